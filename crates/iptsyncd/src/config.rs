//! Desired-state file parser.
//!
//! File format:
//! ```json
//! {
//!   "rules": [
//!     { "name": "100 allow ssh", "chain": "INPUT", "table": "filter",
//!       "protocol": "IPv4", "ensure": "present",
//!       "proto": "tcp", "dport": ["22"], "jump": "ACCEPT" }
//!   ],
//!   "chains": [
//!     { "name": "INPUT", "table": "filter", "protocol": "IPv4",
//!       "purge": true, "ignore": ["-j f2b-"], "policy": "drop" }
//!   ]
//! }
//! ```
//!
//! Every rule key other than `name`, `chain`, `table`, `protocol` and
//! `ensure` is an attribute from the schema registry.

use std::collections::HashSet;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::{debug, info};

use iptsync_rules::schema::{Arity, AttributeSpec, Schema};
use iptsync_rules::{
    compile_ignore_patterns, AttrValue, AttributeMap, ChainKey, DesiredRuleSpec, Ensure, Family,
    Operand, RuleError, RuleResult,
};

use crate::error::{SyncError, SyncResult};

/// Chains that exist in every table that has them and carry a policy.
pub const BUILTIN_CHAINS: &[&str] = &["INPUT", "OUTPUT", "FORWARD", "PREROUTING", "POSTROUTING"];

const POLICIES: &[&str] = &["ACCEPT", "DROP", "QUEUE", "RETURN"];

fn default_chain() -> String {
    "INPUT".to_string()
}

fn default_table() -> String {
    "filter".to_string()
}

fn default_family() -> Family {
    Family::V4
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(pattern) => vec![pattern],
        OneOrMany::Many(patterns) => patterns,
    })
}

/// Per-chain management settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ChainSpec {
    pub name: String,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(rename = "protocol", default = "default_family")]
    pub family: Family,
    /// Delete observed rules nobody asked for.
    #[serde(default)]
    pub purge: bool,
    /// Regexes matched against the raw line; matching rules survive a purge.
    #[serde(default, deserialize_with = "one_or_many")]
    pub ignore: Vec<String>,
    /// Spare rules numbered in the unmanaged range from a purge.
    #[serde(default)]
    pub ignore_foreign: bool,
    /// Uppercased after loading.
    #[serde(default)]
    pub policy: Option<String>,
    #[serde(skip)]
    pub ignore_patterns: Vec<Regex>,
}

impl ChainSpec {
    pub fn new(name: impl Into<String>, table: impl Into<String>, family: Family) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            family,
            purge: false,
            ignore: Vec::new(),
            ignore_foreign: false,
            policy: None,
            ignore_patterns: Vec::new(),
        }
    }

    pub fn key(&self) -> ChainKey {
        ChainKey::new(self.name.clone(), self.table.clone(), self.family)
    }

    pub fn is_builtin(&self) -> bool {
        is_builtin_chain(&self.name)
    }

    fn finalize(&mut self) -> SyncResult<()> {
        if self.name.is_empty() {
            return Err(SyncError::invalid_config("chains", "chain name is empty"));
        }
        if let Some(policy) = &self.policy {
            let upper = policy.to_ascii_uppercase();
            if !POLICIES.contains(&upper.as_str()) {
                return Err(SyncError::invalid_config(
                    format!("chain {}", self.key()),
                    format!("unknown policy '{policy}'"),
                ));
            }
            self.policy = Some(upper);
        }
        self.ignore_patterns = compile_ignore_patterns(&self.ignore)?;
        Ok(())
    }
}

pub fn is_builtin_chain(chain: &str) -> bool {
    BUILTIN_CHAINS.contains(&chain)
}

#[derive(Debug, Deserialize)]
struct RawState {
    #[serde(default)]
    rules: Vec<RawRule>,
    #[serde(default)]
    chains: Vec<ChainSpec>,
}

#[derive(Debug, Deserialize)]
struct RawRule {
    name: String,
    #[serde(default = "default_chain")]
    chain: String,
    #[serde(default = "default_table")]
    table: String,
    #[serde(default = "default_family")]
    protocol: Family,
    #[serde(default)]
    ensure: Ensure,
    #[serde(flatten)]
    attributes: serde_json::Map<String, Value>,
}

/// Everything the front end asks for in one cycle.
#[derive(Debug, Clone, Default)]
pub struct DesiredState {
    pub rules: Vec<DesiredRuleSpec>,
    pub chains: Vec<ChainSpec>,
}

impl DesiredState {
    pub fn new(rules: Vec<DesiredRuleSpec>, chains: Vec<ChainSpec>) -> Self {
        Self { rules, chains }
    }

    /// Names of rules that must exist after the cycle.
    pub fn present_names(&self) -> HashSet<&str> {
        self.rules
            .iter()
            .filter(|r| r.ensure == Ensure::Present)
            .map(|r| r.name.as_str())
            .collect()
    }

    pub fn chain(&self, key: &ChainKey) -> Option<&ChainSpec> {
        self.chains.iter().find(|c| c.key() == *key)
    }
}

/// Loads and validates the desired-state file.
pub fn load_desired_state(path: &Path) -> SyncResult<DesiredState> {
    let text = std::fs::read_to_string(path).map_err(|source| SyncError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let state = parse_desired_state(&text)?;
    info!(
        "Loaded {} rules and {} chains from {}",
        state.rules.len(),
        state.chains.len(),
        path.display()
    );
    Ok(state)
}

/// Parses and validates desired-state JSON against the standard schema.
pub fn parse_desired_state(text: &str) -> SyncResult<DesiredState> {
    let raw: RawState = serde_json::from_str(text)
        .map_err(|e| SyncError::invalid_config("desired state", e.to_string()))?;
    let schema = Schema::standard();

    let mut names = HashSet::new();
    let mut rules = Vec::with_capacity(raw.rules.len());
    for rule in raw.rules {
        if !names.insert(rule.name.clone()) {
            return Err(SyncError::invalid_config(
                "rules",
                format!("rule name '{}' is declared twice", rule.name),
            ));
        }
        rules.push(convert_rule(rule, schema)?);
    }

    let mut keys = HashSet::new();
    let mut chains = Vec::with_capacity(raw.chains.len());
    for mut chain in raw.chains {
        chain.finalize()?;
        if !keys.insert(chain.key()) {
            return Err(SyncError::invalid_config(
                "chains",
                format!("chain {} is declared twice", chain.key()),
            ));
        }
        chains.push(chain);
    }

    Ok(DesiredState { rules, chains })
}

fn convert_rule(raw: RawRule, schema: &Schema) -> SyncResult<DesiredRuleSpec> {
    let name = raw.name;
    if !name.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(SyncError::rejected(
            name,
            RuleError::invalid_value("name", "must begin with a number"),
        ));
    }

    let mut attributes = AttributeMap::new();
    for (key, value) in &raw.attributes {
        let coerced = schema
            .require(key)
            .and_then(|spec| {
                spec.check_family(raw.protocol)?;
                coerce_attribute(spec, value)
            })
            .map_err(|e| SyncError::rejected(name.clone(), e))?;
        if let Some(value) = coerced {
            attributes.insert(key.clone(), value);
        }
    }
    debug!(rule = %name, attributes = attributes.len(), "Validated desired rule");

    Ok(DesiredRuleSpec {
        name,
        chain: raw.chain,
        table: raw.table,
        family: raw.protocol,
        ensure: raw.ensure,
        attributes,
    })
}

/// Converts one JSON value to the attribute's value shape.
///
/// Returns `None` for a presence attribute set to `false`.
pub fn coerce_attribute(spec: &AttributeSpec, value: &Value) -> RuleResult<Option<AttrValue>> {
    if spec.is_presence() {
        let flag = match value {
            Value::Bool(b) => *b,
            Value::String(s) if s == "true" => true,
            Value::String(s) if s == "false" => false,
            _ => return Err(RuleError::invalid_value(spec.name, "expects a boolean")),
        };
        return Ok(flag.then_some(AttrValue::Present { negated: false }));
    }

    let coerced = match value {
        Value::String(_) | Value::Number(_) => {
            let op = operand(spec, value)?;
            match spec.arity {
                Arity::Single => AttrValue::One(op),
                Arity::List if op.text.contains(',') => split_list(op),
                Arity::List => AttrValue::One(op),
                Arity::Repeated => AttrValue::Many(vec![op]),
            }
        }
        Value::Array(items) => {
            let ops = items
                .iter()
                .map(|item| operand(spec, item))
                .collect::<RuleResult<Vec<_>>>()?;
            match spec.arity {
                Arity::Single => {
                    let mut ops = ops;
                    if ops.len() != 1 {
                        return Err(RuleError::invalid_value(spec.name, "takes a single value"));
                    }
                    AttrValue::One(ops.remove(0))
                }
                Arity::List => {
                    if ops.is_empty() {
                        return Err(RuleError::invalid_value(spec.name, "empty list"));
                    }
                    if ops.iter().skip(1).any(|op| op.negated) {
                        return Err(RuleError::invalid_value(
                            spec.name,
                            "only the first element may be negated",
                        ));
                    }
                    AttrValue::Many(ops)
                }
                Arity::Repeated => AttrValue::Many(ops),
            }
        }
        _ => {
            return Err(RuleError::invalid_value(
                spec.name,
                "expects a string, number or array",
            ))
        }
    };

    spec.validate(&coerced)?;
    Ok(Some(coerced))
}

fn operand(spec: &AttributeSpec, value: &Value) -> RuleResult<Operand> {
    match value {
        Value::String(s) => Ok(Operand::parse(s)),
        Value::Number(n) => Ok(Operand::new(n.to_string())),
        _ => Err(RuleError::invalid_value(
            spec.name,
            "list elements must be strings or numbers",
        )),
    }
}

fn split_list(op: Operand) -> AttrValue {
    AttrValue::Many(
        op.text
            .split(',')
            .enumerate()
            .map(|(i, text)| Operand {
                negated: i == 0 && op.negated,
                text: text.trim().to_string(),
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_desired_state_basic() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{
  "rules": [
    {{ "name": "100 allow ssh", "proto": "tcp", "dport": ["22"], "jump": "ACCEPT" }},
    {{ "name": "200 v6 web", "protocol": "ip6tables", "chain": "FORWARD",
       "proto": "tcp", "dport": "80,443", "state": ["NEW", "ESTABLISHED"], "jump": "ACCEPT" }},
    {{ "name": "300 gone", "ensure": "absent", "source": "! 10.0.0.0/8", "jump": "DROP" }}
  ],
  "chains": [
    {{ "name": "INPUT", "purge": true, "ignore": "-j f2b-", "policy": "drop" }}
  ]
}}"#
        )
        .unwrap();
        file.flush().unwrap();

        let state = load_desired_state(file.path()).unwrap();
        assert_eq!(state.rules.len(), 3);

        let ssh = &state.rules[0];
        assert_eq!(ssh.chain, "INPUT");
        assert_eq!(ssh.table, "filter");
        assert_eq!(ssh.family, Family::V4);
        assert_eq!(ssh.attributes.get("dport"), Some(&AttrValue::many(["22"])));
        assert_eq!(ssh.attributes.get("jump"), Some(&AttrValue::one("ACCEPT")));

        let web = &state.rules[1];
        assert_eq!(web.family, Family::V6);
        assert_eq!(web.chain, "FORWARD");
        assert_eq!(
            web.attributes.get("dport"),
            Some(&AttrValue::many(["80", "443"]))
        );

        let gone = &state.rules[2];
        assert_eq!(gone.ensure, Ensure::Absent);
        assert_eq!(
            gone.attributes.get("source"),
            Some(&AttrValue::One(Operand::negated("10.0.0.0/8")))
        );

        let present = state.present_names();
        assert!(present.contains("100 allow ssh"));
        assert!(!present.contains("300 gone"));

        let input = &state.chains[0];
        assert_eq!(input.table, "filter");
        assert_eq!(input.family, Family::V4);
        assert!(input.purge);
        assert_eq!(input.policy.as_deref(), Some("DROP"));
        assert_eq!(input.ignore, vec!["-j f2b-".to_string()]);
        assert_eq!(input.ignore_patterns.len(), 1);
        assert!(input.is_builtin());
    }

    #[test]
    fn test_missing_file() {
        let err = load_desired_state(Path::new("/nonexistent/iptsync/rules.json")).unwrap_err();
        assert!(matches!(err, SyncError::Io { .. }));
    }

    #[test]
    fn test_unknown_attribute_rejected() {
        let err = parse_desired_state(r#"{"rules": [{"name": "100 x", "dports": "22"}]}"#)
            .unwrap_err();
        match err {
            SyncError::RejectedRule { name, source } => {
                assert_eq!(name, "100 x");
                assert!(matches!(source, RuleError::UnknownAttribute { .. }));
            }
            other => panic!("Expected RejectedRule, got {other:?}"),
        }
    }

    #[test]
    fn test_array_on_single_attribute_rejected() {
        let err = parse_desired_state(
            r#"{"rules": [{"name": "100 x", "jump": ["ACCEPT", "DROP"]}]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("takes a single value"));

        // A one-element array is accepted for a single-valued attribute.
        let state =
            parse_desired_state(r#"{"rules": [{"name": "100 x", "jump": ["ACCEPT"]}]}"#).unwrap();
        assert_eq!(
            state.rules[0].attributes.get("jump"),
            Some(&AttrValue::one("ACCEPT"))
        );
    }

    #[test]
    fn test_presence_attribute_coercion() {
        let state = parse_desired_state(
            r#"{"rules": [{"name": "100 x", "isfragment": true, "random": false, "jump": "DROP"}]}"#,
        )
        .unwrap();
        let attrs = &state.rules[0].attributes;
        assert_eq!(
            attrs.get("isfragment"),
            Some(&AttrValue::Present { negated: false })
        );
        assert!(!attrs.contains("random"));

        let err = parse_desired_state(r#"{"rules": [{"name": "100 x", "isfragment": "yes"}]}"#)
            .unwrap_err();
        assert!(err.to_string().contains("expects a boolean"));
    }

    #[test]
    fn test_list_negation_only_first() {
        let state = parse_desired_state(
            r#"{"rules": [{"name": "100 x", "proto": "tcp", "dport": ["! 22", "80"]}]}"#,
        )
        .unwrap();
        assert!(state.rules[0].attributes.get("dport").unwrap().is_negated());

        let err = parse_desired_state(
            r#"{"rules": [{"name": "100 x", "proto": "tcp", "dport": ["22", "! 80"]}]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("only the first element"));
    }

    #[test]
    fn test_numbers_coerced_to_text() {
        let state = parse_desired_state(
            r#"{"rules": [{"name": "100 x", "proto": "tcp", "dport": 22, "set_mss": 1360}]}"#,
        )
        .unwrap();
        let attrs = &state.rules[0].attributes;
        assert_eq!(attrs.get("dport"), Some(&AttrValue::one("22")));
        assert_eq!(attrs.get("set_mss"), Some(&AttrValue::one("1360")));
    }

    #[test]
    fn test_family_restricted_attribute() {
        let err = parse_desired_state(r#"{"rules": [{"name": "100 x", "hop_limit": "5"}]}"#)
            .unwrap_err();
        assert!(err.to_string().contains("only valid for IPv6"));

        let state = parse_desired_state(
            r#"{"rules": [{"name": "100 x", "protocol": "IPv6", "hop_limit": "5"}]}"#,
        )
        .unwrap();
        assert_eq!(state.rules[0].family, Family::V6);
    }

    #[test]
    fn test_rule_name_must_be_numbered() {
        let err = parse_desired_state(r#"{"rules": [{"name": "allow ssh"}]}"#).unwrap_err();
        assert!(matches!(err, SyncError::RejectedRule { .. }));
    }

    #[test]
    fn test_duplicates_rejected() {
        let err = parse_desired_state(r#"{"rules": [{"name": "100 x"}, {"name": "100 x"}]}"#)
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidConfig { .. }));

        let err = parse_desired_state(r#"{"chains": [{"name": "INPUT"}, {"name": "INPUT"}]}"#)
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidConfig { .. }));

        // Same chain name in the other family is a different chain.
        let state = parse_desired_state(
            r#"{"chains": [{"name": "INPUT"}, {"name": "INPUT", "protocol": "IPv6"}]}"#,
        )
        .unwrap();
        assert_eq!(state.chains.len(), 2);
    }

    #[test]
    fn test_bad_chain_settings() {
        let err = parse_desired_state(r#"{"chains": [{"name": "INPUT", "policy": "reject"}]}"#)
            .unwrap_err();
        assert!(err.to_string().contains("unknown policy"));

        let err = parse_desired_state(r#"{"chains": [{"name": "INPUT", "ignore": ["("]}]}"#)
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::Rule(RuleError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_invalid_json() {
        let err = parse_desired_state("{ not json").unwrap_err();
        assert!(matches!(err, SyncError::InvalidConfig { .. }));
    }
}
