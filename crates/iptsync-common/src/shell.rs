//! Command execution utilities.
//!
//! Programs are spawned directly with an argument vector; no shell sees the
//! words, so values taken from a dump (comments with `$` or backticks) reach
//! the tool byte for byte.
//!
//! # Example
//!
//! ```ignore
//! use iptsync_common::shell::{self, IPTABLES_CMD};
//!
//! let args = ["-t", "filter", "-I", "INPUT", "1", "-j", "ACCEPT"].map(String::from);
//! shell::exec_or_throw(IPTABLES_CMD, &args).await?;
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use std::process::Stdio;
use tokio::process::Command;

use crate::error::{CmdError, CmdResult};

/// Path to the `iptables` command for IPv4 rules.
pub const IPTABLES_CMD: &str = "/sbin/iptables";

/// Path to the `ip6tables` command for IPv6 rules.
pub const IP6TABLES_CMD: &str = "/sbin/ip6tables";

/// Path to `iptables-save`, which dumps the IPv4 rule table.
pub const IPTABLES_SAVE_CMD: &str = "/sbin/iptables-save";

/// Path to `ip6tables-save`, which dumps the IPv6 rule table.
pub const IP6TABLES_SAVE_CMD: &str = "/sbin/ip6tables-save";

/// Regex for characters that need escaping in shell double-quotes.
/// Matches: $, `, ", \, and newline
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("Invalid regex pattern"));

/// Quotes a string for safe use in shell commands.
///
/// Wraps the string in double quotes and escapes `$`, `` ` ``, `"`, `\` and
/// newline.
///
/// # Example
///
/// ```
/// use iptsync_common::shell::shellquote;
///
/// assert_eq!(shellquote("filter"), "\"filter\"");
/// assert_eq!(shellquote("with$var"), "\"with\\$var\"");
/// ```
pub fn shellquote(s: &str) -> String {
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

/// Quotes `word` only when it would not read back as one bare word.
pub fn quote_word(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:,=+@%!".contains(c));
    if plain {
        word.to_string()
    } else {
        shellquote(word)
    }
}

/// Printable form of a program and its arguments, for logs and errors.
pub fn command_line(program: &str, args: &[String]) -> String {
    std::iter::once(program.to_string())
        .chain(args.iter().map(|a| quote_word(a)))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Builds the dump command for `save_tool`, optionally limited to one table.
pub fn save_command(save_tool: &str, table: Option<&str>) -> String {
    match table {
        Some(table) => format!("{} -t {}", save_tool, quote_word(table)),
        None => save_tool.to_string(),
    }
}

/// Result of a shell command execution.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// The exit code of the command (0 = success).
    pub exit_code: i32,
    /// The combined stdout output.
    pub stdout: String,
    /// The combined stderr output.
    pub stderr: String,
}

impl ExecResult {
    /// Returns true if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns the combined output (stdout + stderr) for error messages.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Runs `program` with `args`, without a shell.
///
/// # Returns
///
/// * `Ok(ExecResult)` - The command ran; check [`ExecResult::success`]
/// * `Err(CmdError)` - If the command could not be spawned
pub async fn exec(program: &str, args: &[String]) -> CmdResult<ExecResult> {
    let cmd = command_line(program, args);
    tracing::debug!(command = %cmd, "Executing command");

    let output = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| CmdError::ShellExec {
            command: cmd.clone(),
            source: e,
        })?;

    let exit_code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

    let result = ExecResult {
        exit_code,
        stdout,
        stderr,
    };

    if result.success() {
        tracing::trace!(command = %cmd, exit_code = exit_code, "Command succeeded");
    } else {
        tracing::warn!(
            command = %cmd,
            exit_code = exit_code,
            stderr = %result.stderr,
            "Command failed"
        );
    }

    Ok(result)
}

/// Runs `program` and fails on non-zero exit.
///
/// # Returns
///
/// * `Ok(String)` - The stdout output on success
/// * `Err(CmdError)` - If the command fails or returns non-zero
pub async fn exec_or_throw(program: &str, args: &[String]) -> CmdResult<String> {
    let result = exec(program, args).await?;
    if result.success() {
        Ok(result.stdout)
    } else {
        Err(CmdError::command_failed(
            command_line(program, args),
            result.exit_code,
            result.combined_output(),
        ))
    }
}
