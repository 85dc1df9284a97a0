//! Rule codec and reconciliation engine for iptables-style packet filters.
//!
//! This crate is pure and synchronous. It knows how to:
//!
//! - [`decoder`]: read `iptables-save` output into [`RuleRecord`]s
//! - [`encoder`]: render desired attributes as CLI arguments
//! - [`resolver`]: compute the ordinal a named rule must be inserted at
//! - [`insync`]: decide whether observed and desired values are equivalent
//! - [`purge`]: select unmanaged rules for removal
//! - [`plan`]: turn the comparison into create/update/delete/noop
//!
//! All of it is driven by the immutable attribute registry in [`schema`].
//!
//! # Example
//!
//! ```
//! use iptsync_rules::{decode, render, resolve_position, AttrValue, AttributeMap, DesiredRuleSpec, Family};
//!
//! let dump = decode("*filter\n-A INPUT -m comment --comment \"100 a\" -j ACCEPT\n", Family::V4).unwrap();
//! let names: Vec<String> = dump.rules.iter().map(|r| r.name.clone()).collect();
//!
//! let mut spec = DesiredRuleSpec::new("200 b");
//! spec.attributes = AttributeMap::new().with("jump", AttrValue::one("DROP"));
//! let position = resolve_position(&names, &spec.name);
//! assert_eq!(render(&spec, position).unwrap(), "INPUT 2 -m comment --comment '200 b' -j DROP");
//! ```

pub mod decoder;
pub mod encoder;
pub mod error;
pub mod insync;
pub mod lookup;
pub mod plan;
pub mod purge;
pub mod resolver;
pub mod schema;
pub mod tokenizer;
pub mod types;

pub use decoder::{decode, RuleDecoder};
pub use encoder::{render, RuleEncoder};
pub use error::{RuleError, RuleResult};
pub use insync::{attribute_insync, family_insync, insync, CompareContext};
pub use lookup::{AccountLookup, StaticAccounts};
pub use plan::{drifted_attributes, plan_change, Change};
pub use purge::{compile_ignore_patterns, purge_candidates};
pub use resolver::{resolve_position, resolve_position_in};
pub use schema::{AttributeSpec, Schema};
pub use types::{
    ensure_unique_names, is_unmanaged_name, AttrValue, AttributeMap, ChainDecl, ChainKey,
    DesiredRuleSpec, Dump, Ensure, Family, Operand, RuleRecord, UNMANAGED_BASE,
};
