//! Rule Decoder.
//!
//! Turns `*-save` text into [`RuleRecord`]s in two passes per append-line:
//!
//! 1. [`group`] walks the token stream and produces module introducers and
//!    switch groups (flag, negation, value tokens), tracking which `-m`
//!    module is active.
//! 2. [`RuleDecoder::assemble`] maps each group onto its registry row and
//!    builds the attribute map.
//!
//! Switches the registry does not know are skipped, so newer filter features
//! never break a cycle.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{RuleError, RuleResult};
use crate::schema::{Arity, Schema, SwitchRole, ValueKind};
use crate::tokenizer::{tokenize, Token};
use crate::types::{
    ensure_unique_names, AttrValue, AttributeMap, ChainDecl, Dump, Family, Operand, RuleRecord,
    UNMANAGED_BASE,
};

/// `[packets:bytes] ` prefix on counter-bearing dumps.
static COUNTER_PREFIX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[\d+:\d+\]\s+").expect("Invalid regex pattern"));

/// One grouped element of an append-line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    /// `-m <module>`
    Module(String),
    /// A switch with its values, scoped to the module active when it appeared.
    Switch {
        module: Option<String>,
        flag: String,
        negated: bool,
        values: Vec<String>,
    },
}

/// Groups the tokens following `-A CHAIN` into module and switch items.
///
/// A `!` negates the next switch when a switch (or nothing) follows it, and
/// the current switch otherwise (`--dports ! 22`).
pub fn group(tokens: &[Token]) -> Vec<Item> {
    let mut items = Vec::new();
    let mut module: Option<String> = None;
    let mut pending_negation = false;
    let mut current: Option<usize> = None;
    let mut iter = tokens.iter().peekable();

    while let Some(token) = iter.next() {
        if token.is_negation() {
            let next_is_switch = iter.peek().map(|t| t.is_switch()).unwrap_or(true);
            match (next_is_switch, current) {
                (false, Some(idx)) => {
                    if let Some(Item::Switch { negated, .. }) = items.get_mut(idx) {
                        *negated = true;
                    }
                }
                _ => pending_negation = true,
            }
            continue;
        }

        if token.is_switch() {
            if token.text == "-m" || token.text == "--match" {
                if let Some(name) = iter.next() {
                    module = Some(name.text.clone());
                    items.push(Item::Module(name.text.clone()));
                }
                current = None;
                pending_negation = false;
                continue;
            }

            let is_target = matches!(token.text.as_str(), "-j" | "--jump" | "-g" | "--goto");
            let flag = match token.text.as_str() {
                "--jump" => "-j".to_string(),
                "--goto" => "-g".to_string(),
                other => other.to_string(),
            };
            items.push(Item::Switch {
                module: if is_target { None } else { module.clone() },
                flag,
                negated: std::mem::take(&mut pending_negation),
                values: Vec::new(),
            });
            current = Some(items.len() - 1);
            if is_target {
                module = None;
            }
            continue;
        }

        match current.and_then(|idx| items.get_mut(idx)) {
            Some(Item::Switch { values, .. }) => values.push(token.text.clone()),
            _ => debug!(token = %token.text, "Skipping stray token"),
        }
    }

    items
}

/// Decoder bound to a schema registry.
#[derive(Debug, Clone, Copy)]
pub struct RuleDecoder<'a> {
    schema: &'a Schema,
}

impl Default for RuleDecoder<'static> {
    fn default() -> Self {
        Self::new(Schema::standard())
    }
}

impl<'a> RuleDecoder<'a> {
    pub fn new(schema: &'a Schema) -> Self {
        Self { schema }
    }

    /// Decodes a whole dump for one family.
    pub fn decode(&self, text: &str, family: Family) -> RuleResult<Dump> {
        let mut dump = Dump::default();
        let mut table: Option<String> = None;
        let mut counter: u32 = 0;
        let mut seen: HashSet<String> = HashSet::new();

        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line == "COMMIT" {
                continue;
            }
            if let Some(name) = line.strip_prefix('*') {
                table = Some(name.trim().to_string());
                continue;
            }
            if let Some(decl) = line.strip_prefix(':') {
                let Some(current) = table.as_ref() else {
                    return Err(RuleError::NoTable {
                        line: line.to_string(),
                    });
                };
                dump.chains.push(parse_chain_decl(decl, current, family, line)?);
                continue;
            }

            let line = COUNTER_PREFIX_RE.replace(line, "");
            if line.starts_with("-A ") {
                let Some(current) = table.as_ref() else {
                    return Err(RuleError::NoTable {
                        line: line.to_string(),
                    });
                };
                counter += 1;
                let (mut record, synthesized) = self.decode_entry(&line, current, family, counter)?;
                if synthesized && seen.contains(&record.name) {
                    // The counter wraps and foreign comments repeat; the
                    // line index keeps the name unique within this dump.
                    debug!(rule = %record.name, line = counter, "Synthesized name taken");
                    record.name = format!("{} #{counter}", record.name);
                }
                seen.insert(record.name.clone());
                dump.rules.push(record);
            } else {
                debug!(line = %line, "Ignoring unrecognised dump line");
            }
        }

        ensure_unique_names(&dump.rules)?;
        Ok(dump)
    }

    /// Decodes one append-line. `counter` is the 1-based index of the line
    /// among the dump's append-lines and seeds synthesized names.
    pub fn decode_line(
        &self,
        line: &str,
        table: &str,
        family: Family,
        counter: u32,
    ) -> RuleResult<RuleRecord> {
        self.decode_entry(line, table, family, counter)
            .map(|(record, _)| record)
    }

    /// [`RuleDecoder::decode_line`], also reporting whether the name was
    /// synthesized rather than taken from a numbered comment.
    fn decode_entry(
        &self,
        line: &str,
        table: &str,
        family: Family,
        counter: u32,
    ) -> RuleResult<(RuleRecord, bool)> {
        let tokens = tokenize(line)?;
        let chain = match tokens.as_slice() {
            [verb, chain, ..] if verb.text == "-A" && !chain.is_switch() => chain.text.clone(),
            _ => return Err(RuleError::malformed_line(line, "missing chain after -A")),
        };

        let items = group(&tokens[2..]);
        let mut attributes = self.assemble(&items, line);

        let comment = match attributes.remove("name") {
            Some(AttrValue::One(op)) => Some(op.text),
            _ => None,
        };
        let synthesized = !comment.as_deref().is_some_and(is_rule_name);
        let name = synthesize_name(comment, line, counter);

        if !attributes.contains("proto") {
            attributes.insert("proto", AttrValue::one("all"));
        }

        let record = RuleRecord {
            table: table.to_string(),
            chain,
            family,
            attributes,
            name,
            raw_line: line.to_string(),
        };
        Ok((record, synthesized))
    }

    /// Maps grouped items onto registry attributes.
    pub fn assemble(&self, items: &[Item], line: &str) -> AttributeMap {
        let mut attributes = AttributeMap::new();

        for item in items {
            let (module, flag, negated, values) = match item {
                Item::Module(name) => {
                    if let Some(spec) = self.schema.module_only(name) {
                        attributes.insert(spec.name, AttrValue::Present { negated: false });
                    }
                    continue;
                }
                Item::Switch {
                    module,
                    flag,
                    negated,
                    values,
                } => (module.as_deref(), flag.as_str(), *negated, values),
            };

            let Some((spec, role)) = self.schema.find_switch(module, flag) else {
                debug!(flag = %flag, module = ?module, "Ignoring unknown switch");
                continue;
            };

            let value = match (spec.kind, role) {
                (ValueKind::Presence, _) => AttrValue::Present { negated },
                (_, SwitchRole::Choice(choice)) => AttrValue::One(Operand {
                    negated,
                    text: choice.to_string(),
                }),
                _ if values.is_empty() => {
                    debug!(attribute = spec.name, "Switch without a value, skipping");
                    continue;
                }
                (_, SwitchRole::Single) => AttrValue::One(Operand {
                    negated,
                    text: values.join(" "),
                }),
                _ if spec.arity == Arity::List => {
                    let joined = values.join(",");
                    let ops = joined
                        .split(',')
                        .enumerate()
                        .map(|(i, part)| Operand {
                            negated: negated && i == 0,
                            text: part.to_string(),
                        })
                        .collect();
                    AttrValue::Many(ops)
                }
                _ => AttrValue::One(Operand {
                    negated,
                    text: values.join(" "),
                }),
            };

            if spec.arity == Arity::Repeated {
                let op = match value {
                    AttrValue::One(op) => op,
                    _ => continue,
                };
                match attributes.remove(spec.name) {
                    Some(AttrValue::Many(mut ops)) => {
                        ops.push(op);
                        attributes.insert(spec.name, AttrValue::Many(ops));
                    }
                    _ => {
                        attributes.insert(spec.name, AttrValue::Many(vec![op]));
                    }
                }
                continue;
            }

            if attributes.contains(spec.name) {
                if spec.name == "name" {
                    warn!(line = %line, "Rule carries more than one comment, keeping the first");
                } else {
                    debug!(attribute = spec.name, line = %line, "Repeated attribute, keeping the first");
                }
                continue;
            }
            attributes.insert(spec.name, value);
        }

        attributes
    }
}

fn parse_chain_decl(decl: &str, table: &str, family: Family, line: &str) -> RuleResult<ChainDecl> {
    let mut parts = decl.split_whitespace();
    let chain = parts
        .next()
        .ok_or_else(|| RuleError::malformed_line(line, "chain declaration without a name"))?;
    let policy = match parts.next() {
        None | Some("-") => None,
        Some(p) => Some(p.to_string()),
    };
    Ok(ChainDecl {
        table: table.to_string(),
        chain: chain.to_string(),
        family,
        policy,
    })
}

/// Picks the rule name from its comment, or synthesizes one in the
/// unmanaged range from the line's position and content hash.
pub fn synthesize_name(comment: Option<String>, raw_line: &str, counter: u32) -> String {
    let number = UNMANAGED_BASE + counter % 1000;
    match comment {
        Some(text) if is_rule_name(&text) => text,
        Some(text) => format!("{number} {text}"),
        None => format!("{number} {}", hex::encode(Sha256::digest(raw_line.as_bytes()))),
    }
}

/// A comment that names a rule starts with its order number.
fn is_rule_name(comment: &str) -> bool {
    comment.starts_with(|c: char| c.is_ascii_digit())
}

/// Decodes a dump with the standard registry.
pub fn decode(text: &str, family: Family) -> RuleResult<Dump> {
    RuleDecoder::default().decode(text, family)
}
