//! Insert-Order Resolver.
//!
//! The filter only knows positions. This module turns rule names into a
//! 1-based ordinal so that managed rules end up sorted by name while
//! unmanaged rules keep their place relative to each other and to the
//! managed rules around them.

use crate::types::{is_unmanaged_name, ChainKey};

/// Computes the ordinal `name` must occupy in a chain whose rules are
/// currently named `current` (in chain order).
pub fn resolve_position(current: &[String], name: &str) -> usize {
    if current.is_empty() {
        return 1;
    }

    if is_unmanaged_name(name) {
        // Unmanaged rules are never reordered; keep the slot it has.
        return current
            .iter()
            .position(|n| n == name)
            .map(|idx| idx + 1)
            .unwrap_or(current.len() + 1);
    }

    let mut rules: Vec<&str> = current.iter().map(String::as_str).collect();
    let existing = rules.contains(&name);
    rules.push(name);

    let offset_rule = if existing {
        name
    } else {
        let mut sorted = rules.clone();
        sorted.sort_unstable();
        sorted.dedup();
        match sorted.iter().position(|n| *n == name) {
            Some(0) | None => rules[0],
            Some(idx) => sorted[idx - 1],
        }
    };

    let offset_idx = rules
        .iter()
        .position(|n| *n == offset_rule)
        .unwrap_or(rules.len() - 1);
    let mut unmanaged = rules[..=offset_idx]
        .iter()
        .filter(|n| is_unmanaged_name(n))
        .count();
    if is_unmanaged_name(offset_rule) && unmanaged > 0 {
        unmanaged -= 1;
    }

    let mut managed: Vec<&str> = rules
        .iter()
        .copied()
        .filter(|n| !is_unmanaged_name(n))
        .collect();
    managed.sort_unstable();
    let managed_idx = managed.iter().position(|n| *n == name).unwrap_or(0);

    managed_idx + 1 + unmanaged
}

/// [`resolve_position`] with the chain it applies to, for call sites that
/// carry a key.
pub fn resolve_position_in(key: &ChainKey, current: &[String], name: &str) -> usize {
    let position = resolve_position(current, name);
    tracing::debug!(chain = %key, rule = %name, position, "Resolved insert position");
    position
}
