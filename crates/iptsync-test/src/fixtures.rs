//! Test fixtures for reconciliation scenarios
//!
//! Builders for desired rules and saved dumps, plus ready-made rules that
//! show up across the integration tests.

use iptsync_rules::{AttrValue, DesiredRuleSpec, Ensure, Family, Operand};

/// Builds a [`DesiredRuleSpec`] one attribute at a time.
#[derive(Debug, Clone)]
pub struct RuleBuilder {
    spec: DesiredRuleSpec,
}

impl RuleBuilder {
    /// A present IPv4 rule in `filter`/`INPUT`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            spec: DesiredRuleSpec::new(name),
        }
    }

    pub fn chain(mut self, chain: impl Into<String>) -> Self {
        self.spec.chain = chain.into();
        self
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.spec.table = table.into();
        self
    }

    pub fn family(mut self, family: Family) -> Self {
        self.spec.family = family;
        self
    }

    pub fn absent(mut self) -> Self {
        self.spec.ensure = Ensure::Absent;
        self
    }

    /// Sets a single value; a leading `! ` negates it.
    pub fn one(self, name: &str, value: &str) -> Self {
        self.attr(name, AttrValue::One(Operand::parse(value)))
    }

    /// Sets a list value.
    pub fn many<I, S>(self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.attr(name, AttrValue::many(values))
    }

    /// Sets a presence switch.
    pub fn flag(self, name: &str) -> Self {
        self.attr(name, AttrValue::Present { negated: false })
    }

    pub fn attr(mut self, name: &str, value: AttrValue) -> Self {
        self.spec.attributes.insert(name, value);
        self
    }

    pub fn build(self) -> DesiredRuleSpec {
        self.spec
    }
}

/// Builds `*-save` text table by table.
#[derive(Debug, Clone, Default)]
pub struct DumpBuilder {
    tables: Vec<(String, Vec<String>, Vec<String>)>,
}

impl DumpBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a table section.
    pub fn table(mut self, name: &str) -> Self {
        self.tables.push((name.to_string(), Vec::new(), Vec::new()));
        self
    }

    /// Declares a chain; `None` dumps as a user-defined chain.
    pub fn chain(mut self, name: &str, policy: Option<&str>) -> Self {
        if let Some((_, chains, _)) = self.tables.last_mut() {
            chains.push(format!(":{} {} [0:0]", name, policy.unwrap_or("-")));
        }
        self
    }

    /// Adds an append-line (`-A CHAIN ...`) to the current table.
    pub fn rule(mut self, line: &str) -> Self {
        if let Some((_, _, rules)) = self.tables.last_mut() {
            rules.push(line.to_string());
        }
        self
    }

    pub fn build(&self) -> String {
        let mut out = String::from("# Generated by iptables-save v1.8.9\n");
        for (name, chains, rules) in &self.tables {
            out.push_str(&format!("*{name}\n"));
            for line in chains.iter().chain(rules) {
                out.push_str(line);
                out.push('\n');
            }
            out.push_str("COMMIT\n");
        }
        out
    }
}

/// Common desired rules
pub mod rule_fixtures {
    use super::*;

    /// Accept a TCP port by number.
    pub fn allow_tcp(name: &str, port: &str) -> DesiredRuleSpec {
        RuleBuilder::new(name)
            .one("proto", "tcp")
            .many("dport", [port])
            .one("jump", "ACCEPT")
            .build()
    }

    pub fn allow_ssh() -> DesiredRuleSpec {
        allow_tcp("100 allow ssh", "22")
    }

    pub fn allow_http() -> DesiredRuleSpec {
        allow_tcp("200 allow http", "80")
    }

    pub fn allow_https() -> DesiredRuleSpec {
        allow_tcp("300 allow https", "443")
    }

    /// Drop conntrack-invalid packets.
    pub fn drop_invalid() -> DesiredRuleSpec {
        RuleBuilder::new("050 drop invalid")
            .many("ctstate", ["INVALID"])
            .one("jump", "DROP")
            .build()
    }

    /// Log with a prefix that needs quoting.
    pub fn log_rejected() -> DesiredRuleSpec {
        RuleBuilder::new("990 log rejected")
            .one("jump", "LOG")
            .one("log_prefix", "iptables rejected: ")
            .one("log_level", "4")
            .build()
    }

    /// ICMPv6 echo request with a hop limit.
    pub fn v6_ping() -> DesiredRuleSpec {
        RuleBuilder::new("150 v6 ping")
            .family(Family::V6)
            .one("proto", "ipv6-icmp")
            .one("icmp", "echo-request")
            .one("hop_limit", "255")
            .one("jump", "ACCEPT")
            .build()
    }

    /// Block everything outside a subnet except a few ports.
    pub fn block_outside() -> DesiredRuleSpec {
        RuleBuilder::new("400 block outside")
            .one("source", "! 10.0.0.0/8")
            .one("proto", "tcp")
            .many("dport", ["! 22", "443"])
            .one("jump", "DROP")
            .build()
    }
}

/// Common live tables
pub mod dump_fixtures {
    use super::*;

    /// `INPUT` with two managed rules around unmanaged ones, as left by a
    /// host that also runs other filter tooling.
    pub fn mixed_input() -> String {
        DumpBuilder::new()
            .table("filter")
            .chain("INPUT", Some("ACCEPT"))
            .chain("FORWARD", Some("ACCEPT"))
            .chain("OUTPUT", Some("ACCEPT"))
            .rule("-A INPUT -i lo -j ACCEPT")
            .rule("-A INPUT -p tcp -m multiport --dports 22 -m comment --comment \"100 allow ssh\" -j ACCEPT")
            .rule("-A INPUT -m conntrack --ctstate RELATED,ESTABLISHED -j ACCEPT")
            .rule("-A INPUT -p tcp -m multiport --dports 443 -m comment --comment \"300 allow https\" -j ACCEPT")
            .rule("-A INPUT -p udp -m udp --dport 5353 -m comment --comment \"9500 foreign mdns\" -j ACCEPT")
            .build()
    }

    /// A bare filter table.
    pub fn empty_filter() -> String {
        DumpBuilder::new()
            .table("filter")
            .chain("INPUT", Some("ACCEPT"))
            .chain("FORWARD", Some("ACCEPT"))
            .chain("OUTPUT", Some("ACCEPT"))
            .build()
    }
}
