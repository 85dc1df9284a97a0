//! Rule data model: families, chain keys, attribute values and records.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{RuleError, RuleResult};

/// First number of the reserved range used for synthesized rule names.
///
/// Shared by the decoder (name synthesis), the insert-order resolver
/// (unmanaged detection) and the purge filter (`ignore_foreign`). All three
/// must agree on it.
pub const UNMANAGED_BASE: u32 = 9000;

/// Matches names in the reserved unmanaged range (`9000`..`9999` followed by
/// a space).
static UNMANAGED_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^9\d{3}\s").expect("Invalid regex pattern"));

/// Returns true if `name` lies in the reserved unmanaged range.
pub fn is_unmanaged_name(name: &str) -> bool {
    UNMANAGED_NAME_RE.is_match(name)
}

/// Returns the decimal prefix of a rule name, if any.
pub fn numeric_prefix(name: &str) -> Option<u64> {
    let digits: String = name.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Protocol family of a rule table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Family {
    /// IPv4, managed with `iptables`.
    #[serde(rename = "IPv4", alias = "iptables", alias = "ipv4")]
    V4,
    /// IPv6, managed with `ip6tables`.
    #[serde(rename = "IPv6", alias = "ip6tables", alias = "ipv6")]
    V6,
}

impl Family {
    /// Canonical family tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Family::V4 => "IPv4",
            Family::V6 => "IPv6",
        }
    }

    /// Provider identifier that aliases this family.
    pub fn provider(&self) -> &'static str {
        match self {
            Family::V4 => "iptables",
            Family::V6 => "ip6tables",
        }
    }

    /// Both families, v4 first.
    pub fn all() -> [Family; 2] {
        [Family::V4, Family::V6]
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Family {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ipv4" | "iptables" | "inet" | "4" => Ok(Family::V4),
            "ipv6" | "ip6tables" | "inet6" | "6" => Ok(Family::V6),
            _ => Err(RuleError::UnknownFamily(s.to_string())),
        }
    }
}

/// Identifies one ordered rule sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChainKey {
    /// Chain name (e.g. "INPUT").
    pub chain: String,
    /// Table name (e.g. "filter").
    pub table: String,
    /// Protocol family.
    pub family: Family,
}

impl ChainKey {
    pub fn new(chain: impl Into<String>, table: impl Into<String>, family: Family) -> Self {
        Self {
            chain: chain.into(),
            table: table.into(),
            family,
        }
    }
}

impl fmt::Display for ChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.chain, self.table, self.family)
    }
}

/// One value of an attribute, with its negation marker.
///
/// Textual form is `"! text"` when negated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Operand {
    pub negated: bool,
    pub text: String,
}

impl Operand {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            negated: false,
            text: text.into(),
        }
    }

    pub fn negated(text: impl Into<String>) -> Self {
        Self {
            negated: true,
            text: text.into(),
        }
    }

    /// Parses the textual form, splitting off a leading `!` marker.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.strip_prefix('!') {
            Some(rest) => Self::negated(rest.trim_start()),
            None => Self::new(trimmed),
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negated {
            write!(f, "! {}", self.text)
        } else {
            f.write_str(&self.text)
        }
    }
}

/// Value held by one attribute of a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    /// Presence-only switch (e.g. `-f`, `--checksum-fill`).
    Present { negated: bool },
    /// A single value.
    One(Operand),
    /// An ordered list. For comma-joined lists only the first element
    /// carries negation, which applies to the whole list; for per-value
    /// attributes each element carries its own.
    Many(Vec<Operand>),
}

impl AttrValue {
    /// Convenience constructor for an unnegated single value.
    pub fn one(text: impl Into<String>) -> Self {
        AttrValue::One(Operand::new(text))
    }

    /// Convenience constructor parsing each element's `!` marker.
    pub fn many<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        AttrValue::Many(items.into_iter().map(|s| Operand::parse(s.as_ref())).collect())
    }

    /// Attribute-level negation: the flag itself, the single value, or the
    /// first list element.
    pub fn is_negated(&self) -> bool {
        match self {
            AttrValue::Present { negated } => *negated,
            AttrValue::One(op) => op.negated,
            AttrValue::Many(ops) => ops.first().map(|op| op.negated).unwrap_or(false),
        }
    }

    /// The operands of this value (empty for presence switches).
    pub fn operands(&self) -> Vec<&Operand> {
        match self {
            AttrValue::Present { .. } => Vec::new(),
            AttrValue::One(op) => vec![op],
            AttrValue::Many(ops) => ops.iter().collect(),
        }
    }

    /// Returns true for list values.
    pub fn is_list(&self) -> bool {
        matches!(self, AttrValue::Many(_))
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Present { negated: false } => f.write_str("true"),
            AttrValue::Present { negated: true } => f.write_str("! true"),
            AttrValue::One(op) => write!(f, "{op}"),
            AttrValue::Many(ops) => {
                let items: Vec<String> = ops.iter().map(|op| op.to_string()).collect();
                write!(f, "[{}]", items.join(", "))
            }
        }
    }
}

/// Attribute name → value mapping, ordered by attribute name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeMap(BTreeMap<String, AttrValue>);

impl AttributeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.0.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: AttrValue) -> Option<AttrValue> {
        self.0.insert(name.into(), value)
    }

    pub fn remove(&mut self, name: &str) -> Option<AttrValue> {
        self.0.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttrValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: AttrValue) -> Self {
        self.insert(name, value);
        self
    }
}

impl FromIterator<(String, AttrValue)> for AttributeMap {
    fn from_iter<T: IntoIterator<Item = (String, AttrValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Whether the front end wants a rule present or absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ensure {
    #[default]
    Present,
    Absent,
}

/// One rule observed in the live table.
///
/// Created fresh on every decode pass and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleRecord {
    pub table: String,
    pub chain: String,
    pub family: Family,
    pub attributes: AttributeMap,
    /// From the comment attribute, or synthesized in the unmanaged range.
    pub name: String,
    /// The append-line exactly as dumped (counters stripped).
    pub raw_line: String,
}

impl RuleRecord {
    pub fn key(&self) -> ChainKey {
        ChainKey::new(self.chain.clone(), self.table.clone(), self.family)
    }

    pub fn is_unmanaged(&self) -> bool {
        is_unmanaged_name(&self.name)
    }

    /// The raw line with its append marker rewritten to the delete verb.
    pub fn delete_args(&self) -> String {
        match self.raw_line.strip_prefix("-A") {
            Some(rest) => format!("-D{rest}"),
            None => self.raw_line.clone(),
        }
    }

    /// Re-expresses this record as desired state, keeping its name.
    pub fn to_desired(&self) -> DesiredRuleSpec {
        DesiredRuleSpec {
            name: self.name.clone(),
            chain: self.chain.clone(),
            table: self.table.clone(),
            family: self.family,
            ensure: Ensure::Present,
            attributes: self.attributes.clone(),
        }
    }
}

/// A rule as requested by the declarative front end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredRuleSpec {
    pub name: String,
    pub chain: String,
    pub table: String,
    pub family: Family,
    pub ensure: Ensure,
    pub attributes: AttributeMap,
}

impl DesiredRuleSpec {
    /// A present rule in `filter`/`INPUT` for IPv4 with no attributes.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            chain: "INPUT".to_string(),
            table: "filter".to_string(),
            family: Family::V4,
            ensure: Ensure::Present,
            attributes: AttributeMap::new(),
        }
    }

    pub fn key(&self) -> ChainKey {
        ChainKey::new(self.chain.clone(), self.table.clone(), self.family)
    }
}

/// A chain declaration line (`:CHAIN POLICY [packets:bytes]`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainDecl {
    pub table: String,
    pub chain: String,
    pub family: Family,
    /// `None` for user-defined chains (dumped as `-`).
    pub policy: Option<String>,
}

impl ChainDecl {
    pub fn key(&self) -> ChainKey {
        ChainKey::new(self.chain.clone(), self.table.clone(), self.family)
    }
}

/// Result of decoding one full dump.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dump {
    pub chains: Vec<ChainDecl>,
    pub rules: Vec<RuleRecord>,
}

impl Dump {
    /// Rules of one chain, in dump order.
    pub fn rules_for<'a>(&'a self, key: &'a ChainKey) -> impl Iterator<Item = &'a RuleRecord> + 'a {
        self.rules
            .iter()
            .filter(move |r| r.chain == key.chain && r.table == key.table && r.family == key.family)
    }

    /// Rule names of one chain, in dump order.
    pub fn names_for(&self, key: &ChainKey) -> Vec<String> {
        self.rules_for(key).map(|r| r.name.clone()).collect()
    }

    pub fn find(&self, name: &str) -> Option<&RuleRecord> {
        self.rules.iter().find(|r| r.name == name)
    }

    pub fn chain(&self, key: &ChainKey) -> Option<&ChainDecl> {
        self.chains.iter().find(|c| c.key() == *key)
    }

    /// Appends another dump (e.g. the other family).
    pub fn extend(&mut self, other: Dump) {
        self.chains.extend(other.chains);
        self.rules.extend(other.rules);
    }
}

/// Fails with [`RuleError::DuplicateName`] on the first repeated name.
pub fn ensure_unique_names<'a, I>(records: I) -> RuleResult<()>
where
    I: IntoIterator<Item = &'a RuleRecord>,
{
    let mut seen = std::collections::HashSet::new();
    for record in records {
        if !seen.insert(record.name.as_str()) {
            return Err(RuleError::DuplicateName {
                name: record.name.clone(),
            });
        }
    }
    Ok(())
}
