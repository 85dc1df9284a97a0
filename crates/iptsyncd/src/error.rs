//! Error types for the reconciliation daemon.

use std::io;
use thiserror::Error;

use iptsync_common::CmdError;
use iptsync_rules::RuleError;

/// Result type alias for daemon operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that abort a reconciliation cycle.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Decoding, rendering or pattern errors from the rule engine.
    #[error(transparent)]
    Rule(#[from] RuleError),

    /// A filter CLI invocation failed.
    #[error(transparent)]
    Command(#[from] CmdError),

    /// A desired rule failed validation.
    #[error("Rule '{name}' rejected: {source}")]
    RejectedRule {
        /// The rule name.
        name: String,
        /// What was wrong with it.
        #[source]
        source: RuleError,
    },

    /// Configuration validation error.
    #[error("Invalid configuration for {field}: {message}")]
    InvalidConfig {
        /// The field that failed validation.
        field: String,
        /// Error message.
        message: String,
    },

    /// Reading a configuration or dump file failed.
    #[error("Failed to read {path}: {source}")]
    Io {
        /// The file being read.
        path: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },
}

impl SyncError {
    /// Creates an invalid configuration error.
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates a rejected rule error.
    pub fn rejected(name: impl Into<String>, source: RuleError) -> Self {
        Self::RejectedRule {
            name: name.into(),
            source,
        }
    }

    /// Returns true if the live table was read but could not be understood.
    pub fn is_decode_error(&self) -> bool {
        matches!(self, SyncError::Rule(e) if e.is_decode_error())
    }
}
