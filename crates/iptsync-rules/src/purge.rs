//! Chain Purge Filter.
//!
//! Picks the observed rules of a chain that a purge should remove. The
//! caller then drops every candidate the desired state asks to keep.

use regex::Regex;
use tracing::debug;

use crate::error::{RuleError, RuleResult};
use crate::types::{numeric_prefix, ChainKey, RuleRecord, UNMANAGED_BASE};

/// Compiles ignore patterns, failing on the first invalid one.
pub fn compile_ignore_patterns<I, S>(patterns: I) -> RuleResult<Vec<Regex>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    patterns
        .into_iter()
        .map(|p| {
            Regex::new(p.as_ref()).map_err(|source| RuleError::InvalidPattern {
                pattern: p.as_ref().to_string(),
                source,
            })
        })
        .collect()
}

/// Rules of `key` that are neither ignored nor (with `ignore_foreign`)
/// numbered in the unmanaged range.
pub fn purge_candidates<'r>(
    key: &ChainKey,
    records: &'r [RuleRecord],
    ignore: &[Regex],
    ignore_foreign: bool,
) -> Vec<&'r RuleRecord> {
    records
        .iter()
        .filter(|r| r.chain == key.chain && r.table == key.table && r.family == key.family)
        .filter(|r| {
            let ignored = ignore.iter().any(|re| re.is_match(&r.raw_line));
            if ignored {
                debug!(rule = %r.name, chain = %key, "Rule matches an ignore pattern");
            }
            !ignored
        })
        .filter(|r| {
            !(ignore_foreign
                && numeric_prefix(&r.name).is_some_and(|n| n >= u64::from(UNMANAGED_BASE)))
        })
        .collect()
}
