//! Common infrastructure for the iptsync reconciler.
//!
//! - [`shell`]: tool paths, quoting and argv command execution
//! - [`runner`]: the [`CommandRunner`] seam over the privileged CLI
//! - [`error`]: error types for command execution
//!
//! # Example
//!
//! ```ignore
//! use iptsync_common::{CommandRunner, RecordingRunner, shell::IPTABLES_SAVE_CMD};
//!
//! let mut runner = RecordingRunner::new().with_response(IPTABLES_SAVE_CMD, "*filter\nCOMMIT");
//! let dump = runner.run(IPTABLES_SAVE_CMD).await?;
//! ```

pub mod error;
pub mod runner;
pub mod shell;

// Re-export commonly used items at crate root
pub use error::{CmdError, CmdResult};
pub use runner::{CommandRunner, RecordingRunner};
