//! Integration test infrastructure for iptsync
//!
//! Provides:
//! - Desired-rule and dump builders
//! - Ready-made rule and dump fixtures
//! - [`SimulatedFilter`], an in-memory filter behind the runner seam
//! - Command log and chain order verification helpers

pub mod fixtures;
mod simulated;
mod verification;

pub use fixtures::*;
pub use simulated::{builtin_chains, SimulatedFilter};
pub use verification::*;
