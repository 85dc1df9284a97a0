//! The seam between the reconciler and the privileged CLI.
//!
//! A command is one line in the word syntax of `*-save` dumps: bare words,
//! double-quoted words with backslash escapes, single-quoted words. It is
//! never handed to a shell. [`RecordingRunner`] captures commands and serves
//! canned output, so reconciliation can be tested without root.

use async_trait::async_trait;
use tracing::debug;

use crate::error::{CmdError, CmdResult};

/// Runs one command line and returns its stdout.
#[async_trait]
pub trait CommandRunner: Send {
    async fn run(&mut self, command: &str) -> CmdResult<String>;
}

/// Captures commands instead of executing them.
#[derive(Debug, Default, Clone)]
pub struct RecordingRunner {
    commands: Vec<String>,
    responses: Vec<(String, String)>,
    fail_on: Option<String>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers commands starting with `prefix` with `output`.
    pub fn with_response(mut self, prefix: impl Into<String>, output: impl Into<String>) -> Self {
        self.responses.push((prefix.into(), output.into()));
        self
    }

    /// Fails the first command containing `needle` with exit code 1.
    pub fn fail_on(mut self, needle: impl Into<String>) -> Self {
        self.fail_on = Some(needle.into());
        self
    }

    /// Every command received so far, in order.
    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    pub fn take_commands(&mut self) -> Vec<String> {
        std::mem::take(&mut self.commands)
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&mut self, command: &str) -> CmdResult<String> {
        debug!(command = %command, "Captured command");
        self.commands.push(command.to_string());

        if let Some(needle) = &self.fail_on {
            if command.contains(needle.as_str()) {
                self.fail_on = None;
                return Err(CmdError::command_failed(command, 1, "simulated failure"));
            }
        }

        Ok(self
            .responses
            .iter()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::IPTABLES_SAVE_CMD;

    #[tokio::test]
    async fn test_recording_runner_captures() {
        let mut runner = RecordingRunner::new().with_response(IPTABLES_SAVE_CMD, "*filter\nCOMMIT");
        let dump = runner.run(IPTABLES_SAVE_CMD).await.unwrap();
        assert_eq!(dump, "*filter\nCOMMIT");
        let out = runner.run("/sbin/iptables -t filter -I INPUT 1 -j ACCEPT").await.unwrap();
        assert_eq!(out, "");
        assert_eq!(runner.commands().len(), 2);
        assert_eq!(runner.take_commands()[1], "/sbin/iptables -t filter -I INPUT 1 -j ACCEPT");
        assert!(runner.commands().is_empty());
    }

    #[tokio::test]
    async fn test_recording_runner_failure() {
        let mut runner = RecordingRunner::new().fail_on("-D INPUT");
        let err = runner.run("/sbin/iptables -t filter -D INPUT -j DROP").await.unwrap_err();
        assert_eq!(err.exit_code(), Some(1));
        // Only the first match fails.
        assert!(runner.run("/sbin/iptables -t filter -D INPUT -j DROP").await.is_ok());
    }
}
