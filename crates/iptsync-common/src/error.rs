//! Error types for command execution.
//!
//! All errors implement `std::error::Error` via `thiserror`.

use std::io;
use thiserror::Error;

/// Result type alias for command execution.
pub type CmdResult<T> = Result<T, CmdError>;

/// Errors that can occur while running filter CLI commands.
#[derive(Debug, Error)]
pub enum CmdError {
    /// Failed to execute a shell command (spawn error).
    #[error("Failed to execute shell command '{command}': {source}")]
    ShellExec {
        /// The command that failed to execute.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Shell command returned non-zero exit code.
    #[error("Shell command failed: '{command}' (exit code {exit_code}): {output}")]
    ShellCommandFailed {
        /// The command that failed.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },

    /// Internal error (unexpected state).
    #[error("Internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl CmdError {
    /// Creates a command failure error.
    pub fn command_failed(
        command: impl Into<String>,
        exit_code: i32,
        output: impl Into<String>,
    ) -> Self {
        Self::ShellCommandFailed {
            command: command.into(),
            exit_code,
            output: output.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// The command this error is about, if any.
    pub fn command(&self) -> Option<&str> {
        match self {
            CmdError::ShellExec { command, .. } | CmdError::ShellCommandFailed { command, .. } => {
                Some(command)
            }
            CmdError::Internal { .. } => None,
        }
    }

    /// Exit status of a command that ran and failed.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            CmdError::ShellCommandFailed { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }
}
