//! The runner that talks to the real filter tools.

use async_trait::async_trait;

use iptsync_common::{shell, CmdError, CmdResult, CommandRunner};
use iptsync_rules::tokenizer::tokenize;

/// Splits a command line into words with the dump tokenizer.
///
/// Delete commands carry a dumped line verbatim, so they must be split by
/// the same rules `iptables-save` quoted them with.
pub fn split_command(command: &str) -> CmdResult<Vec<String>> {
    tokenize(command)
        .map(|tokens| tokens.into_iter().map(|t| t.text).collect())
        .map_err(|e| CmdError::internal(format!("cannot split '{command}': {e}")))
}

/// Spawns the filter tools directly, one process per command.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExecRunner;

#[async_trait]
impl CommandRunner for ExecRunner {
    async fn run(&mut self, command: &str) -> CmdResult<String> {
        let words = split_command(command)?;
        let Some((program, args)) = words.split_first() else {
            return Err(CmdError::internal("empty command"));
        };
        shell::exec_or_throw(program, args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_split_dumped_delete() {
        let words = split_command(
            "/sbin/iptables -t filter -D INPUT -m comment --comment \"cost $HOME `echo INJECTED`\" -j ACCEPT",
        )
        .unwrap();
        assert_eq!(
            words,
            vec![
                "/sbin/iptables",
                "-t",
                "filter",
                "-D",
                "INPUT",
                "-m",
                "comment",
                "--comment",
                "cost $HOME `echo INJECTED`",
                "-j",
                "ACCEPT",
            ]
        );
    }

    #[test]
    fn test_split_rendered_insert() {
        let words = split_command(
            "/sbin/iptables -t filter -I INPUT 1 -m comment --comment '100 it'\\''s $x' -j ACCEPT",
        )
        .unwrap();
        assert_eq!(words[8], "100 it's $x");
    }

    #[test]
    fn test_split_errors() {
        assert!(split_command("/sbin/iptables --comment \"open").is_err());
    }

    #[tokio::test]
    async fn test_exec_runner_no_shell_expansion() {
        let mut runner = ExecRunner;
        let out = runner
            .run("printf %s \"cost $HOME `echo INJECTED`\"")
            .await
            .unwrap();
        assert_eq!(out, "cost $HOME `echo INJECTED`");

        assert!(runner.run("false").await.is_err());
        assert!(matches!(runner.run("").await, Err(CmdError::Internal { .. })));
    }
}
