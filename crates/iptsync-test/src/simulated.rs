//! An in-memory packet filter behind the [`CommandRunner`] seam.
//!
//! Understands the commands the daemon issues (`-I`, `-R`, `-D`, `-N`, `-P`
//! and the save tools) and fails the way the real CLI does on bad indices,
//! missing chains and unmatched deletes. Dumps print quoted values with
//! double quotes, as `iptables-save` does.
//!
//! Stored rules are kept in the form the save tool prints them back in:
//! implicit protocol matches are spelled out, target and match defaults are
//! filled in or dropped, and marks are printed in hex. A rule that comes
//! back different from how it was written must still be seen as in sync.

use std::collections::HashMap;
use std::net::IpAddr;
use std::ops::Range;

use async_trait::async_trait;
use tracing::debug;

use iptsync_common::shell::{IP6TABLES_CMD, IP6TABLES_SAVE_CMD, IPTABLES_CMD, IPTABLES_SAVE_CMD};
use iptsync_common::{CmdError, CmdResult, CommandRunner};
use iptsync_rules::insync::normalize_mark;
use iptsync_rules::lookup::log_level_code;
use iptsync_rules::schema::MaskPolicy;
use iptsync_rules::tokenizer::{tokenize, Token};
use iptsync_rules::Family;

/// Built-in chains of a table, in dump order.
pub fn builtin_chains(table: &str) -> &'static [&'static str] {
    match table {
        "filter" | "security" => &["INPUT", "FORWARD", "OUTPUT"],
        "nat" => &["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"],
        "mangle" => &["PREROUTING", "INPUT", "FORWARD", "OUTPUT", "POSTROUTING"],
        "raw" => &["PREROUTING", "OUTPUT"],
        _ => &[],
    }
}

#[derive(Debug, Clone)]
struct ChainState {
    name: String,
    policy: Option<String>,
    rules: Vec<Vec<Token>>,
}

#[derive(Debug, Clone)]
struct TableState {
    name: String,
    chains: Vec<ChainState>,
}

impl TableState {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            chains: builtin_chains(name)
                .iter()
                .map(|chain| ChainState {
                    name: chain.to_string(),
                    policy: Some("ACCEPT".to_string()),
                    rules: Vec::new(),
                })
                .collect(),
        }
    }

    fn chain(&self, name: &str) -> Option<&ChainState> {
        self.chains.iter().find(|c| c.name == name)
    }

    fn chain_mut(&mut self, name: &str) -> Option<&mut ChainState> {
        self.chains.iter_mut().find(|c| c.name == name)
    }
}

/// Per-family tables plus a log of every command received.
#[derive(Debug, Clone)]
pub struct SimulatedFilter {
    tables: HashMap<Family, Vec<TableState>>,
    commands: Vec<String>,
    fail_on: Option<String>,
}

impl Default for SimulatedFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedFilter {
    /// Both families with an empty `filter` table.
    pub fn new() -> Self {
        let tables = Family::all()
            .into_iter()
            .map(|family| (family, vec![TableState::new("filter")]))
            .collect();
        Self {
            tables,
            commands: Vec::new(),
            fail_on: None,
        }
    }

    /// Replaces the tables of `family` with the content of a saved dump.
    pub fn with_dump(mut self, family: Family, dump: &str) -> CmdResult<Self> {
        self.load_dump(family, dump)?;
        Ok(self)
    }

    /// Fails the first command containing `needle` with exit code 1.
    pub fn fail_on(mut self, needle: impl Into<String>) -> Self {
        self.fail_on = Some(needle.into());
        self
    }

    pub fn load_dump(&mut self, family: Family, dump: &str) -> CmdResult<()> {
        let mut tables: Vec<TableState> = Vec::new();
        for raw in dump.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line == "COMMIT" {
                continue;
            }
            if let Some(name) = line.strip_prefix('*') {
                tables.push(TableState {
                    name: name.trim().to_string(),
                    chains: Vec::new(),
                });
                continue;
            }
            let Some(table) = tables.last_mut() else {
                return Err(CmdError::internal(format!("line before any table: {line}")));
            };
            if let Some(decl) = line.strip_prefix(':') {
                let mut parts = decl.split_whitespace();
                let name = parts.next().unwrap_or_default().to_string();
                let policy = parts.next().filter(|p| *p != "-").map(str::to_string);
                table.chains.push(ChainState {
                    name,
                    policy,
                    rules: Vec::new(),
                });
                continue;
            }
            let tokens = tokenize(line).map_err(|e| CmdError::internal(e.to_string()))?;
            match tokens.as_slice() {
                [verb, chain, rest @ ..] if verb.text == "-A" => {
                    let Some(state) = table.chain_mut(&chain.text) else {
                        return Err(CmdError::internal(format!(
                            "rule for undeclared chain: {line}"
                        )));
                    };
                    state.rules.push(rest.to_vec());
                }
                _ => return Err(CmdError::internal(format!("unexpected dump line: {line}"))),
            }
        }
        self.tables.insert(family, tables);
        Ok(())
    }

    /// Every command received, including dumps.
    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    /// Commands that change state.
    pub fn mutations(&self) -> Vec<String> {
        self.commands
            .iter()
            .filter(|c| !c.contains("-save"))
            .cloned()
            .collect()
    }

    pub fn take_commands(&mut self) -> Vec<String> {
        std::mem::take(&mut self.commands)
    }

    pub fn has_chain(&self, family: Family, table: &str, chain: &str) -> bool {
        self.table(family, table)
            .and_then(|t| t.chain(chain))
            .is_some()
    }

    pub fn policy(&self, family: Family, table: &str, chain: &str) -> Option<String> {
        self.table(family, table)
            .and_then(|t| t.chain(chain))
            .and_then(|c| c.policy.clone())
    }

    /// Append-lines of one chain as they would be dumped.
    pub fn chain_rules(&self, family: Family, table: &str, chain: &str) -> Vec<String> {
        self.table(family, table)
            .and_then(|t| t.chain(chain))
            .map(|c| c.rules.iter().map(|r| append_line(&c.name, r)).collect())
            .unwrap_or_default()
    }

    /// The full `*-save` output for a family.
    pub fn dump(&self, family: Family, only_table: Option<&str>) -> String {
        let mut out = format!("# Generated by {}-save (simulated)\n", family.provider());
        for table in self.tables.get(&family).into_iter().flatten() {
            if only_table.is_some_and(|t| t != table.name) {
                continue;
            }
            out.push_str(&format!("*{}\n", table.name));
            for chain in &table.chains {
                let policy = chain.policy.as_deref().unwrap_or("-");
                out.push_str(&format!(":{} {} [0:0]\n", chain.name, policy));
            }
            for chain in &table.chains {
                for rule in &chain.rules {
                    out.push_str(&append_line(&chain.name, rule));
                    out.push('\n');
                }
            }
            out.push_str("COMMIT\n");
        }
        out
    }

    fn table(&self, family: Family, name: &str) -> Option<&TableState> {
        self.tables.get(&family)?.iter().find(|t| t.name == name)
    }

    fn table_mut(&mut self, family: Family, name: &str) -> &mut TableState {
        let tables = self.tables.entry(family).or_default();
        let idx = match tables.iter().position(|t| t.name == name) {
            Some(idx) => idx,
            None => {
                tables.push(TableState::new(name));
                tables.len() - 1
            }
        };
        &mut tables[idx]
    }

    fn apply(&mut self, family: Family, command: &str, args: &[Token]) -> CmdResult<String> {
        let [flag, table, verb, chain, rest @ ..] = args else {
            return Err(CmdError::command_failed(command, 2, "Bad argument"));
        };
        if flag.text != "-t" {
            return Err(CmdError::command_failed(command, 2, "Table must be given"));
        }
        let table = self.table_mut(family, &table.text);
        let chain_name = chain.text.as_str();

        if verb.text == "-N" {
            if table.chain(chain_name).is_some() {
                return Err(CmdError::command_failed(command, 1, "Chain already exists."));
            }
            table.chains.push(ChainState {
                name: chain_name.to_string(),
                policy: None,
                rules: Vec::new(),
            });
            return Ok(String::new());
        }

        let Some(state) = table.chain_mut(chain_name) else {
            return Err(CmdError::command_failed(
                command,
                1,
                "No chain/target/match by that name.",
            ));
        };

        match (verb.text.as_str(), rest) {
            ("-P", [policy]) => {
                if state.policy.is_none() {
                    return Err(CmdError::command_failed(
                        command,
                        1,
                        "Bad built-in chain name",
                    ));
                }
                state.policy = Some(policy.text.clone());
            }
            ("-I", [position, rule @ ..]) => {
                let position: usize = position
                    .text
                    .parse()
                    .map_err(|_| CmdError::command_failed(command, 2, "Invalid rule number"))?;
                if position == 0 || position > state.rules.len() + 1 {
                    return Err(CmdError::command_failed(
                        command,
                        1,
                        "Index of insertion too big.",
                    ));
                }
                state.rules.insert(position - 1, saved_form(rule, family));
            }
            ("-R", [position, rule @ ..]) => {
                let position: usize = position
                    .text
                    .parse()
                    .map_err(|_| CmdError::command_failed(command, 2, "Invalid rule number"))?;
                if position == 0 || position > state.rules.len() {
                    return Err(CmdError::command_failed(
                        command,
                        1,
                        "Index of replacement too big.",
                    ));
                }
                state.rules[position - 1] = saved_form(rule, family);
            }
            ("-D", rule) => {
                let rule = saved_form(rule, family);
                let Some(idx) = state.rules.iter().position(|r| same_words(r, &rule)) else {
                    return Err(CmdError::command_failed(
                        command,
                        1,
                        "Bad rule (does a matching rule exist in that chain?).",
                    ));
                };
                state.rules.remove(idx);
            }
            _ => return Err(CmdError::command_failed(command, 2, "Unknown arguments")),
        }
        Ok(String::new())
    }
}

fn same_words(a: &[Token], b: &[Token]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.text == y.text)
}

/// Protocols whose port switches live in a match module of the same name.
const PORT_PROTOCOLS: &[&str] = &["tcp", "udp", "sctp", "dccp", "udplite"];

fn is_flag(token: &Token, flag: &str) -> bool {
    !token.quoted && token.text == flag
}

fn is_module_boundary(token: &Token) -> bool {
    !token.quoted && matches!(token.text.as_str(), "-m" | "--match" | "-j" | "-g")
}

/// Index of the switch `flag` within `range`.
fn find_flag(rule: &[Token], mut range: Range<usize>, flag: &str) -> Option<usize> {
    range.find(|&i| is_flag(&rule[i], flag))
}

/// The rule as the save tool would print it back.
///
/// Applying it twice gives the same words as applying it once.
pub(crate) fn saved_form(rule: &[Token], family: Family) -> Vec<Token> {
    let mut rule = with_host_prefixes(rule, family);
    rule = with_protocol_modules(&rule);
    normalize_values(&mut rule);
    fill_module_defaults(&mut rule, "recent", family);
    fill_module_defaults(&mut rule, "connlimit", family);
    fill_reject_default(&mut rule, family);
    rule
}

/// `-s 10.0.0.1` is printed as `-s 10.0.0.1/32`.
fn with_host_prefixes(rule: &[Token], family: Family) -> Vec<Token> {
    let mut out = rule.to_vec();
    for i in 1..out.len() {
        if !matches!(out[i - 1].text.as_str(), "-s" | "-d") || out[i - 1].quoted {
            continue;
        }
        let text = &out[i].text;
        if text.contains('/') || text.parse::<IpAddr>().is_err() {
            continue;
        }
        let prefix = match family {
            Family::V4 => 32,
            Family::V6 => 128,
        };
        let host = format!("{text}/{prefix}");
        out[i].text = host;
    }
    out
}

/// `-p tcp --dport 22` is printed as `-p tcp -m tcp --dport 22`.
fn with_protocol_modules(rule: &[Token]) -> Vec<Token> {
    let mut out: Vec<Token> = Vec::with_capacity(rule.len() + 2);
    let mut proto: Option<String> = None;
    let mut module: Option<String> = None;
    let mut iter = rule.iter().peekable();

    while let Some(token) = iter.next() {
        if is_flag(token, "-p") {
            proto = iter.peek().map(|t| t.text.to_ascii_lowercase());
        } else if is_flag(token, "-m") || is_flag(token, "--match") {
            module = iter.peek().map(|t| t.text.clone());
        } else if is_flag(token, "-j") || is_flag(token, "-g") {
            module = None;
        } else if is_flag(token, "--dport") || is_flag(token, "--sport") {
            if let Some(proto) = proto
                .as_deref()
                .filter(|p| PORT_PROTOCOLS.contains(p))
                .filter(|p| module.as_deref() != Some(*p))
            {
                let at = match out.last() {
                    Some(prev) if prev.is_negation() => out.len() - 1,
                    _ => out.len(),
                };
                out.insert(at, Token::bare(proto));
                out.insert(at, Token::bare("-m"));
                module = Some(proto.to_string());
            }
        }
        out.push(token.clone());
    }
    out
}

/// Hex marks, numeric log levels, and no default log level or burst.
fn normalize_values(rule: &mut Vec<Token>) {
    let mut target: Option<String> = None;
    let mut i = 0;
    while i < rule.len() {
        let flag = if rule[i].quoted {
            String::new()
        } else {
            rule[i].text.clone()
        };
        match flag.as_str() {
            "-j" | "-g" => {
                target = rule.get(i + 1).map(|t| t.text.clone());
            }
            "--set-xmark" | "--mark" if i + 1 < rule.len() => {
                let policy = if flag == "--set-xmark" {
                    MaskPolicy::Always
                } else {
                    MaskPolicy::IfPartial
                };
                let value = normalize_mark(&rule[i + 1].text, policy);
                rule[i + 1].text = value;
            }
            "--log-level" if target.as_deref() == Some("LOG") && i + 1 < rule.len() => {
                let level = rule[i + 1].text.clone();
                let code = log_level_code(&level).map(str::to_string).unwrap_or(level);
                if code == "4" {
                    rule.drain(i..i + 2);
                    continue;
                }
                rule[i + 1].text = code;
            }
            "--limit-burst" if rule.get(i + 1).is_some_and(|t| t.text == "5") => {
                rule.drain(i..i + 2);
                continue;
            }
            _ => {}
        }
        i += 1;
    }
}

/// Options a match module always prints, with the value it prints.
fn module_defaults(module: &str, family: Family) -> &'static [(&'static str, &'static str)] {
    match (module, family) {
        ("recent", Family::V4) => &[("--name", "DEFAULT"), ("--mask", "255.255.255.255")],
        ("recent", Family::V6) => &[
            ("--name", "DEFAULT"),
            ("--mask", "ffff:ffff:ffff:ffff:ffff:ffff:ffff:ffff"),
        ],
        ("connlimit", Family::V4) => &[("--connlimit-mask", "32")],
        ("connlimit", Family::V6) => &[("--connlimit-mask", "128")],
        _ => &[],
    }
}

/// Appends the options `module` prints on its own to the end of its run.
fn fill_module_defaults(rule: &mut Vec<Token>, module: &str, family: Family) {
    let Some(start) = (1..rule.len())
        .find(|&i| is_flag(&rule[i - 1], "-m") && rule[i].text == module)
        .map(|i| i + 1)
    else {
        return;
    };
    let mut end = (start..rule.len())
        .find(|&i| is_module_boundary(&rule[i]))
        .unwrap_or(rule.len());
    if end > start && rule[end - 1].is_negation() {
        end -= 1;
    }

    let mut missing: Vec<Token> = Vec::new();
    for (flag, value) in module_defaults(module, family) {
        if find_flag(rule, start..end, flag).is_none() {
            missing.push(Token::bare(*flag));
            missing.push(Token::bare(*value));
        }
    }
    match module {
        "recent" => {
            let sided = find_flag(rule, start..end, "--rsource")
                .or_else(|| find_flag(rule, start..end, "--rdest"));
            if sided.is_none() {
                missing.push(Token::bare("--rsource"));
            }
        }
        "connlimit" => {
            let sided = find_flag(rule, start..end, "--connlimit-saddr")
                .or_else(|| find_flag(rule, start..end, "--connlimit-daddr"));
            if sided.is_none() {
                missing.push(Token::bare("--connlimit-saddr"));
            }
        }
        _ => {}
    }
    let tail = rule.split_off(end);
    rule.extend(missing);
    rule.extend(tail);
}

/// `-j REJECT` is printed with the ICMP error it sends.
fn fill_reject_default(rule: &mut Vec<Token>, family: Family) {
    let Some(target) = (1..rule.len())
        .find(|&i| is_flag(&rule[i - 1], "-j") && rule[i].text == "REJECT")
    else {
        return;
    };
    if find_flag(rule, target..rule.len(), "--reject-with").is_some() {
        return;
    }
    let error = match family {
        Family::V4 => "icmp-port-unreachable",
        Family::V6 => "icmp6-port-unreachable",
    };
    rule.insert(target + 1, Token::bare(error));
    rule.insert(target + 1, Token::bare("--reject-with"));
}

fn append_line(chain: &str, rule: &[Token]) -> String {
    let mut words = vec!["-A".to_string(), chain.to_string()];
    words.extend(rule.iter().map(dump_word));
    words.join(" ")
}

/// Double-quotes words that would not read back as one bare token.
fn dump_word(token: &Token) -> String {
    let text = &token.text;
    let needs = text.is_empty()
        || text.chars().any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '\\'))
        || (token.quoted && (text.starts_with('-') || text == "!"));
    if needs {
        format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        text.clone()
    }
}

#[async_trait]
impl CommandRunner for SimulatedFilter {
    async fn run(&mut self, command: &str) -> CmdResult<String> {
        debug!(command = %command, "Simulated command");
        self.commands.push(command.to_string());

        if let Some(needle) = &self.fail_on {
            if command.contains(needle.as_str()) {
                self.fail_on = None;
                return Err(CmdError::command_failed(command, 1, "simulated failure"));
            }
        }

        let tokens = tokenize(command).map_err(|e| CmdError::internal(e.to_string()))?;
        let Some((tool, args)) = tokens.split_first() else {
            return Err(CmdError::internal("empty command"));
        };
        let only_table = match args {
            [flag, table] if flag.text == "-t" => Some(table.text.as_str()),
            _ => None,
        };
        match tool.text.as_str() {
            IPTABLES_SAVE_CMD => Ok(self.dump(Family::V4, only_table)),
            IP6TABLES_SAVE_CMD => Ok(self.dump(Family::V6, only_table)),
            IPTABLES_CMD => self.apply(Family::V4, command, args),
            IP6TABLES_CMD => self.apply(Family::V6, command, args),
            _ => Err(CmdError::command_failed(command, 127, "command not found")),
        }
    }
}
