//! Verification helpers for reconciliation tests
//!
//! Assertions over issued commands and over the resulting chain order.

use thiserror::Error;

use iptsync_rules::{decode, ChainKey, RuleError};

use crate::simulated::SimulatedFilter;

/// Verification error types
#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("Dump did not decode: {0}")]
    Decode(#[from] RuleError),

    #[error("No command contains '{fragment}'")]
    CommandMissing { fragment: String },

    #[error("Unexpected command containing '{fragment}': '{command}'")]
    UnexpectedCommand { fragment: String, command: String },

    #[error("Expected '{first}' before '{second}'")]
    OrderMismatch { first: String, second: String },

    #[error("Expected {expected} '{verb}' commands, found {actual}")]
    CountMismatch {
        verb: String,
        expected: usize,
        actual: usize,
    },

    #[error("Chain {chain} holds {actual:?}, expected {expected:?}")]
    ChainMismatch {
        chain: String,
        expected: Vec<String>,
        actual: Vec<String>,
    },
}

/// Result type for verification operations
pub type VerifyResult<T> = Result<T, VerificationError>;

/// Command log verification helper
pub struct CommandVerifier<'a> {
    commands: &'a [String],
}

impl<'a> CommandVerifier<'a> {
    pub fn new(commands: &'a [String]) -> Self {
        Self { commands }
    }

    fn index_of(&self, fragment: &str) -> Option<usize> {
        self.commands.iter().position(|c| c.contains(fragment))
    }

    /// Verify that some command contains `fragment`
    pub fn assert_contains(&self, fragment: &str) -> VerifyResult<()> {
        self.index_of(fragment)
            .map(|_| ())
            .ok_or_else(|| VerificationError::CommandMissing {
                fragment: fragment.to_string(),
            })
    }

    /// Verify that no command contains `fragment`
    pub fn assert_absent(&self, fragment: &str) -> VerifyResult<()> {
        match self.index_of(fragment) {
            Some(idx) => Err(VerificationError::UnexpectedCommand {
                fragment: fragment.to_string(),
                command: self.commands[idx].clone(),
            }),
            None => Ok(()),
        }
    }

    /// Verify that the first command containing `first` precedes the first
    /// containing `second`
    pub fn assert_order(&self, first: &str, second: &str) -> VerifyResult<()> {
        match (self.index_of(first), self.index_of(second)) {
            (Some(a), Some(b)) if a < b => Ok(()),
            (None, _) => Err(VerificationError::CommandMissing {
                fragment: first.to_string(),
            }),
            (_, None) => Err(VerificationError::CommandMissing {
                fragment: second.to_string(),
            }),
            _ => Err(VerificationError::OrderMismatch {
                first: first.to_string(),
                second: second.to_string(),
            }),
        }
    }

    /// Verify how many commands use `verb` (`-I`, `-R`, `-D`, `-N`, `-P`)
    pub fn assert_verb_count(&self, verb: &str, expected: usize) -> VerifyResult<()> {
        let needle = format!(" {verb} ");
        let actual = self.commands.iter().filter(|c| c.contains(&needle)).count();
        if actual != expected {
            return Err(VerificationError::CountMismatch {
                verb: verb.to_string(),
                expected,
                actual,
            });
        }
        Ok(())
    }
}

/// Rule names of one chain, read back through the decoder.
pub fn chain_names(filter: &SimulatedFilter, key: &ChainKey) -> VerifyResult<Vec<String>> {
    let dump = decode(&filter.dump(key.family, None), key.family)?;
    Ok(dump.names_for(key))
}

/// Verify the managed rule order of a chain, ignoring unmanaged rules
pub fn assert_managed_order(
    filter: &SimulatedFilter,
    key: &ChainKey,
    expected: &[&str],
) -> VerifyResult<()> {
    let actual: Vec<String> = chain_names(filter, key)?
        .into_iter()
        .filter(|n| !iptsync_rules::is_unmanaged_name(n))
        .collect();
    if actual != expected {
        return Err(VerificationError::ChainMismatch {
            chain: key.to_string(),
            expected: expected.iter().map(|s| s.to_string()).collect(),
            actual,
        });
    }
    Ok(())
}
