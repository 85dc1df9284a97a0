//! Change planning for one named rule.

use std::collections::BTreeSet;
use std::fmt;

use crate::insync::{attribute_insync, CompareContext};
use crate::schema::Schema;
use crate::types::{AttrValue, DesiredRuleSpec, Ensure, RuleRecord};

/// What has to happen to bring one rule in line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Change {
    Create,
    Update,
    Delete,
    Noop,
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Change::Create => "create",
            Change::Update => "update",
            Change::Delete => "delete",
            Change::Noop => "noop",
        };
        f.write_str(s)
    }
}

/// Decides the change for a rule given what is observed and what is wanted.
pub fn plan_change(
    observed: Option<&RuleRecord>,
    desired: Option<&DesiredRuleSpec>,
    schema: &Schema,
    ctx: &CompareContext<'_>,
) -> Change {
    match (observed, desired) {
        (None, None) => Change::Noop,
        (Some(_), None) => Change::Delete,
        (Some(_), Some(d)) if d.ensure == Ensure::Absent => Change::Delete,
        (None, Some(d)) if d.ensure == Ensure::Absent => Change::Noop,
        (None, Some(_)) => Change::Create,
        (Some(o), Some(d)) => {
            if drifted_attributes(o, d, schema, ctx).is_empty() {
                Change::Noop
            } else {
                Change::Update
            }
        }
    }
}

/// Names of the attributes that differ, plus `chain`/`table`/`protocol`
/// when the rule sits in a different sequence.
///
/// An attribute set on one side only is compared against its absent value,
/// so options the save tool prints on its own are not drift.
pub fn drifted_attributes(
    observed: &RuleRecord,
    desired: &DesiredRuleSpec,
    schema: &Schema,
    ctx: &CompareContext<'_>,
) -> Vec<String> {
    let mut drifted = Vec::new();
    if observed.chain != desired.chain {
        drifted.push("chain".to_string());
    }
    if observed.table != desired.table {
        drifted.push("table".to_string());
    }
    if observed.family != desired.family {
        drifted.push("protocol".to_string());
    }

    let names: BTreeSet<&str> = observed
        .attributes
        .names()
        .chain(desired.attributes.names())
        .filter(|n| *n != "name")
        .collect();

    for name in names {
        let spec = schema.lookup(name);
        let absent = spec.and_then(|s| s.absent_value(ctx.family));
        let same = match (observed.attributes.get(name), desired.attributes.get(name)) {
            (Some(o), Some(d)) => match spec {
                Some(spec) => attribute_insync(spec, o, d, ctx),
                None => o == d,
            },
            (Some(o), None) => match (spec, &absent) {
                (Some(spec), Some(absent)) => attribute_insync(spec, o, absent, ctx),
                _ => false,
            },
            (None, Some(d)) => match (spec, &absent) {
                (Some(spec), Some(absent)) => attribute_insync(spec, absent, d, ctx),
                _ => false,
            },
            (None, None) => true,
        };
        if !same {
            drifted.push(name.to_string());
        }
    }
    drifted
}
