//! Error types for rule decoding, encoding and planning.
//!
//! Every fallible operation in this crate returns [`RuleResult`]. Errors are
//! never swallowed: the only tolerant paths are the decoder skipping switches
//! it does not model and the comparator deferring to plain equality.

use thiserror::Error;

/// Result type alias for rule operations.
pub type RuleResult<T> = Result<T, RuleError>;

/// Errors that can occur while decoding, validating or rendering rules.
#[derive(Debug, Error)]
pub enum RuleError {
    /// An append-line appeared before any `*table` marker.
    #[error("Rule line seen before any table marker: '{line}'")]
    NoTable {
        /// The offending append-line.
        line: String,
    },

    /// The shell-style tokenizer could not split the line.
    #[error("Malformed quoting in '{line}': {reason}")]
    MalformedQuoting {
        /// The line being tokenized.
        line: String,
        /// What went wrong.
        reason: String,
    },

    /// A line had the append marker but no usable chain.
    #[error("Malformed rule line '{line}': {reason}")]
    MalformedLine {
        /// The line being decoded.
        line: String,
        /// What went wrong.
        reason: String,
    },

    /// Two decoded rules share a name; insert ordering is undefined.
    #[error("Duplicate rule name '{name}' in the observed rule set")]
    DuplicateName {
        /// The duplicated name.
        name: String,
    },

    /// The attribute name is not in the schema registry.
    #[error("Unknown rule attribute '{name}'")]
    UnknownAttribute {
        /// The unknown attribute name.
        name: String,
    },

    /// A value failed coercion for its attribute.
    #[error("Invalid value for attribute '{attribute}': {reason}")]
    InvalidValue {
        /// The attribute being set.
        attribute: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// An ignore pattern did not compile.
    #[error("Invalid ignore pattern '{pattern}': {source}")]
    InvalidPattern {
        /// The pattern as supplied.
        pattern: String,
        /// The regex compile error.
        #[source]
        source: regex::Error,
    },

    /// The protocol family name is not recognised.
    #[error("Unknown protocol family '{0}'")]
    UnknownFamily(String),
}

impl RuleError {
    /// Creates an invalid value error.
    pub fn invalid_value(attribute: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            attribute: attribute.into(),
            reason: reason.into(),
        }
    }

    /// Creates a malformed line error.
    pub fn malformed_line(line: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedLine {
            line: line.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if this error comes from reading the live dump rather
    /// than from the desired state.
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            RuleError::NoTable { .. }
                | RuleError::MalformedQuoting { .. }
                | RuleError::MalformedLine { .. }
                | RuleError::DuplicateName { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RuleError::NoTable {
            line: "-A INPUT -j ACCEPT".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Rule line seen before any table marker: '-A INPUT -j ACCEPT'"
        );
    }

    #[test]
    fn test_invalid_value() {
        let err = RuleError::invalid_value("dport", "expected a port");
        assert_eq!(
            err.to_string(),
            "Invalid value for attribute 'dport': expected a port"
        );
    }

    #[test]
    fn test_is_decode_error() {
        assert!(RuleError::DuplicateName {
            name: "100 ssh".to_string()
        }
        .is_decode_error());
        assert!(!RuleError::UnknownFamily("ipx".to_string()).is_decode_error());
        assert!(!RuleError::invalid_value("proto", "bad").is_decode_error());
    }
}
