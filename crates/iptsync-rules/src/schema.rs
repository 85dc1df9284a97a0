//! Attribute Schema Registry.
//!
//! One immutable table describing every rule attribute: which switch (and
//! optional `-m` module) carries it, its arity, value kind, where negation
//! goes, and how observed and desired values are compared. The table order is
//! the canonical emission order used by the encoder. Decoder, encoder and
//! comparator are all driven by the fields of [`AttributeSpec`]; adding an
//! attribute means adding one row to [`Schema::build`].

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::error::{RuleError, RuleResult};
use crate::types::{AttrValue, Family, Operand};

/// A flag, optionally scoped to the `-m <module>` that provides it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Switch {
    pub module: Option<&'static str>,
    pub flag: &'static str,
}

impl Switch {
    pub const fn plain(flag: &'static str) -> Self {
        Self { module: None, flag }
    }

    pub const fn in_module(module: &'static str, flag: &'static str) -> Self {
        Self {
            module: Some(module),
            flag,
        }
    }
}

/// How an attribute appears on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Form {
    /// One switch.
    Simple(Switch),
    /// A single-value switch plus a multi-value switch in a shared module
    /// (`--dport` vs `-m multiport --dports`).
    Dual { single: Switch, multi: Switch },
    /// A different switch per protocol family.
    PerFamily { v4: Switch, v6: Switch },
    /// The value selects which flag of the module is emitted
    /// (`recent` → `--set`, `--update`, ...).
    Choice {
        module: &'static str,
        flags: &'static [&'static str],
    },
    /// Loading the module is the whole match (`-m socket`).
    ModuleOnly(&'static str),
}

/// How many values an attribute takes and how they are introduced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Single,
    /// Comma-joined after one switch; negation applies to the whole list.
    List,
    /// One switch occurrence (with its own module introducer) per value.
    Repeated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// Flag only, no value.
    Presence,
    Text,
    /// Free text, always single-quoted on output.
    Quoted,
    Integer,
    /// `lo:hi` or a single number.
    Range,
    /// Port number, service name or `lo:hi` range.
    Port,
    /// Two space-separated operands (`SYN,ACK SYN`, `set-name src`).
    Pair,
    /// Jump or goto target; target options follow it.
    Target,
}

/// Where the `!` goes when rendering a negated value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negation {
    /// `! -s 10.0.0.0/8`
    BeforeFlag,
    /// `--dports ! 22,80`
    AfterFlag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerKind {
    User,
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskPolicy {
    /// Always render `value/mask`, defaulting the mask to all ones.
    Always,
    /// Render the mask only when it is not all ones.
    IfPartial,
}

/// Equivalence used when comparing observed against desired values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compare {
    /// No special handling; generic comparison.
    Exact,
    Cidr,
    NumericString,
    TcpFlags,
    Owner(OwnerKind),
    CaseFold,
    JumpTarget,
    Icmp,
    LogLevel,
    Mark(MaskPolicy),
    TimeOfDay,
    /// Sorted multi-value set; `ranges` normalizes `lo-hi` to `lo:hi`.
    SortedSet { ranges: bool },
}

/// What the save tool prints for an attribute the rule never set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Implied {
    Value(&'static str),
    PerFamily { v4: &'static str, v6: &'static str },
    /// A switch that is always printed (`--rsource`).
    Present,
}

/// One registry row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeSpec {
    pub name: &'static str,
    pub form: Form,
    pub arity: Arity,
    pub kind: ValueKind,
    pub negation: Negation,
    pub compare: Compare,
    /// Restricts the attribute to one family.
    pub family: Option<Family>,
    /// Value assumed when the attribute is absent.
    pub default: Option<&'static str>,
    /// Added by the save tool when the module or target is in use.
    pub implied: Option<Implied>,
}

impl AttributeSpec {
    fn new(name: &'static str, form: Form, kind: ValueKind) -> Self {
        Self {
            name,
            form,
            arity: Arity::Single,
            kind,
            negation: Negation::BeforeFlag,
            compare: Compare::Exact,
            family: None,
            default: None,
            implied: None,
        }
    }

    fn list(self) -> Self {
        Self {
            arity: Arity::List,
            ..self
        }
    }

    fn repeated(self) -> Self {
        Self {
            arity: Arity::Repeated,
            ..self
        }
    }

    fn negate_after(self) -> Self {
        Self {
            negation: Negation::AfterFlag,
            ..self
        }
    }

    fn compare(self, compare: Compare) -> Self {
        Self { compare, ..self }
    }

    fn only(self, family: Family) -> Self {
        Self {
            family: Some(family),
            ..self
        }
    }

    fn default_value(self, default: &'static str) -> Self {
        Self {
            default: Some(default),
            ..self
        }
    }

    fn implied(self, implied: Implied) -> Self {
        Self {
            implied: Some(implied),
            ..self
        }
    }

    /// The value that stands in for this attribute when a rule leaves it
    /// out: the default, or whatever the save tool prints on its own.
    pub fn absent_value(&self, family: Family) -> Option<AttrValue> {
        if let Some(default) = self.default {
            return Some(AttrValue::one(default));
        }
        match self.implied? {
            Implied::Value(value) => Some(AttrValue::one(value)),
            Implied::PerFamily { v4, v6 } => Some(AttrValue::one(match family {
                Family::V4 => v4,
                Family::V6 => v6,
            })),
            Implied::Present => Some(AttrValue::Present { negated: false }),
        }
    }

    /// Every module this attribute may introduce.
    pub fn modules(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        let mut push = |m: Option<&'static str>| {
            if let Some(m) = m {
                if !out.contains(&m) {
                    out.push(m);
                }
            }
        };
        match self.form {
            Form::Simple(sw) => push(sw.module),
            Form::Dual { single, multi } => {
                push(single.module);
                push(multi.module);
            }
            Form::PerFamily { v4, v6 } => {
                push(v4.module);
                push(v6.module);
            }
            Form::Choice { module, .. } | Form::ModuleOnly(module) => push(Some(module)),
        }
        out
    }

    /// Returns true if each value gets its own module introducer.
    pub fn is_independently_introduced(&self) -> bool {
        self.arity == Arity::Repeated
    }

    pub fn is_presence(&self) -> bool {
        self.kind == ValueKind::Presence
    }

    pub fn is_target(&self) -> bool {
        self.kind == ValueKind::Target
    }

    /// Checks that `family` may carry this attribute.
    pub fn check_family(&self, family: Family) -> RuleResult<()> {
        match self.family {
            Some(only) if only != family => Err(RuleError::invalid_value(
                self.name,
                format!("only valid for {only}, rule is {family}"),
            )),
            _ => Ok(()),
        }
    }

    /// Checks the shape of a value against this attribute's arity and kind.
    pub fn validate(&self, value: &AttrValue) -> RuleResult<()> {
        match (self.kind, value) {
            (ValueKind::Presence, AttrValue::Present { .. }) => return Ok(()),
            (ValueKind::Presence, _) => {
                return Err(RuleError::invalid_value(self.name, "takes no value"))
            }
            (_, AttrValue::Present { .. }) => {
                return Err(RuleError::invalid_value(self.name, "requires a value"))
            }
            _ => {}
        }
        if let (Arity::Single, AttrValue::Many(ops)) = (self.arity, value) {
            if ops.len() != 1 {
                return Err(RuleError::invalid_value(self.name, "takes a single value"));
            }
        }
        for op in value.operands() {
            self.validate_operand(op)?;
        }
        if let Form::Choice { flags, .. } = self.form {
            for op in value.operands() {
                if !flags.iter().any(|f| f.trim_start_matches('-') == op.text) {
                    return Err(RuleError::invalid_value(
                        self.name,
                        format!("'{}' is not one of {}", op.text, flags.join(", ")),
                    ));
                }
            }
        }
        Ok(())
    }

    fn validate_operand(&self, op: &Operand) -> RuleResult<()> {
        let text = op.text.as_str();
        if text.is_empty() && self.kind != ValueKind::Quoted {
            return Err(RuleError::invalid_value(self.name, "empty value"));
        }
        let ok = match self.kind {
            ValueKind::Integer => text.parse::<i64>().is_ok(),
            ValueKind::Range => text
                .split([':', '-'])
                .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit())),
            ValueKind::Port => text.split([':', '-']).all(|part| {
                !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            }),
            ValueKind::Pair => text.split_whitespace().count() == 2,
            _ => true,
        };
        if ok {
            Ok(())
        } else {
            Err(RuleError::invalid_value(
                self.name,
                format!("'{}' is not a valid {:?} value", text, self.kind),
            ))
        }
    }
}

/// How a decoded switch maps onto its attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchRole {
    /// The only switch of the attribute.
    Plain,
    /// The single-value half of a dual form.
    Single,
    /// The multi-value half of a dual form.
    Multi,
    /// A choice flag; carries the value it stands for.
    Choice(&'static str),
}

/// Immutable attribute registry.
#[derive(Debug)]
pub struct Schema {
    attributes: Vec<AttributeSpec>,
    by_name: HashMap<&'static str, usize>,
    switches: Vec<(Switch, usize, SwitchRole)>,
    by_flag: HashMap<&'static str, Vec<(usize, SwitchRole)>>,
}

static STANDARD: Lazy<Schema> = Lazy::new(Schema::build);

const RECENT_FLAGS: &[&str] = &["--set", "--update", "--rcheck", "--remove"];

impl Schema {
    /// The process-wide registry.
    pub fn standard() -> &'static Schema {
        &STANDARD
    }

    fn build() -> Self {
        use Compare as C;
        use ValueKind as K;
        let plain = |flag| Form::Simple(Switch::plain(flag));
        let module = |m, flag| Form::Simple(Switch::in_module(m, flag));
        let row = AttributeSpec::new;

        let attributes = vec![
            // Core IP header matches, in the order the dump prints them.
            row("source", plain("-s"), K::Text).compare(C::Cidr),
            row("destination", plain("-d"), K::Text).compare(C::Cidr),
            row("iniface", plain("-i"), K::Text),
            row("outiface", plain("-o"), K::Text),
            row("proto", plain("-p"), K::Text)
                .compare(C::NumericString)
                .default_value("all"),
            row("isfragment", plain("-f"), K::Presence),
            // Match modules.
            row("physdev_in", module("physdev", "--physdev-in"), K::Text),
            row("physdev_out", module("physdev", "--physdev-out"), K::Text),
            row("physdev_is_bridged", module("physdev", "--physdev-is-bridged"), K::Presence),
            row("physdev_is_in", module("physdev", "--physdev-is-in"), K::Presence),
            row("physdev_is_out", module("physdev", "--physdev-is-out"), K::Presence),
            row("stat_mode", module("statistic", "--mode"), K::Text),
            row("stat_every", module("statistic", "--every"), K::Integer),
            row("stat_packet", module("statistic", "--packet"), K::Integer),
            row("stat_probability", module("statistic", "--probability"), K::Text),
            row("src_range", module("iprange", "--src-range"), K::Text),
            row("dst_range", module("iprange", "--dst-range"), K::Text),
            row("tcp_flags", module("tcp", "--tcp-flags"), K::Pair).compare(C::TcpFlags),
            row("uid", module("owner", "--uid-owner"), K::Text).compare(C::Owner(OwnerKind::User)),
            row("gid", module("owner", "--gid-owner"), K::Text).compare(C::Owner(OwnerKind::Group)),
            row("mac_source", module("mac", "--mac-source"), K::Text).compare(C::CaseFold),
            row(
                "sport",
                Form::Dual {
                    single: Switch::plain("--sport"),
                    multi: Switch::in_module("multiport", "--sports"),
                },
                K::Port,
            )
            .list()
            .negate_after()
            .compare(C::SortedSet { ranges: true }),
            row(
                "dport",
                Form::Dual {
                    single: Switch::plain("--dport"),
                    multi: Switch::in_module("multiport", "--dports"),
                },
                K::Port,
            )
            .list()
            .negate_after()
            .compare(C::SortedSet { ranges: true }),
            row("port", module("multiport", "--ports"), K::Port)
                .list()
                .negate_after()
                .compare(C::SortedSet { ranges: true }),
            row("src_type", module("addrtype", "--src-type"), K::Text)
                .repeated()
                .negate_after(),
            row("dst_type", module("addrtype", "--dst-type"), K::Text)
                .repeated()
                .negate_after(),
            row("socket", Form::ModuleOnly("socket"), K::Presence),
            row("pkttype", module("pkttype", "--pkt-type"), K::Text),
            row("ipsec_dir", module("policy", "--dir"), K::Text),
            row("ipsec_policy", module("policy", "--pol"), K::Text),
            row("state", module("state", "--state"), K::Text)
                .list()
                .compare(C::SortedSet { ranges: false }),
            row("ctstate", module("conntrack", "--ctstate"), K::Text)
                .list()
                .compare(C::SortedSet { ranges: false }),
            row("ctproto", module("conntrack", "--ctproto"), K::Text).compare(C::NumericString),
            row("ctorigsrc", module("conntrack", "--ctorigsrc"), K::Text).compare(C::Cidr),
            row("ctorigdst", module("conntrack", "--ctorigdst"), K::Text).compare(C::Cidr),
            row("ctreplsrc", module("conntrack", "--ctreplsrc"), K::Text).compare(C::Cidr),
            row("ctrepldst", module("conntrack", "--ctrepldst"), K::Text).compare(C::Cidr),
            row("ctorigsrcport", module("conntrack", "--ctorigsrcport"), K::Port),
            row("ctorigdstport", module("conntrack", "--ctorigdstport"), K::Port),
            row("ctreplsrcport", module("conntrack", "--ctreplsrcport"), K::Port),
            row("ctrepldstport", module("conntrack", "--ctrepldstport"), K::Port),
            row("ctstatus", module("conntrack", "--ctstatus"), K::Text)
                .list()
                .compare(C::SortedSet { ranges: false }),
            row("ctexpire", module("conntrack", "--ctexpire"), K::Range),
            row("ctdir", module("conntrack", "--ctdir"), K::Text),
            row(
                "icmp",
                Form::PerFamily {
                    v4: Switch::in_module("icmp", "--icmp-type"),
                    v6: Switch::in_module("icmp6", "--icmpv6-type"),
                },
                K::Text,
            )
            .compare(C::Icmp),
            row("limit", module("limit", "--limit"), K::Text),
            row("burst", module("limit", "--limit-burst"), K::Integer)
                .implied(Implied::Value("5")),
            row("length", module("length", "--length"), K::Range),
            row(
                "recent",
                Form::Choice {
                    module: "recent",
                    flags: RECENT_FLAGS,
                },
                K::Text,
            ),
            row("rseconds", module("recent", "--seconds"), K::Integer),
            row("reap", module("recent", "--reap"), K::Presence),
            row("rhitcount", module("recent", "--hitcount"), K::Integer),
            row("rttl", module("recent", "--rttl"), K::Presence),
            row("rname", module("recent", "--name"), K::Text).implied(Implied::Value("DEFAULT")),
            row("mask", module("recent", "--mask"), K::Text).implied(Implied::PerFamily {
                v4: "255.255.255.255",
                v6: "ffff:ffff:ffff:ffff:ffff:ffff:ffff:ffff",
            }),
            row("rsource", module("recent", "--rsource"), K::Presence).implied(Implied::Present),
            row("rdest", module("recent", "--rdest"), K::Presence),
            row("ipset", module("set", "--match-set"), K::Pair)
                .repeated()
                .negate_after(),
            row("string", module("string", "--string"), K::Quoted),
            row("string_hex", module("string", "--hex-string"), K::Quoted),
            row("string_algo", module("string", "--algo"), K::Text),
            row("string_from", module("string", "--from"), K::Integer),
            row("string_to", module("string", "--to"), K::Integer),
            row("hop_limit", module("hl", "--hl-eq"), K::Integer)
                .compare(C::NumericString)
                .only(Family::V6),
            row("match_mark", module("mark", "--mark"), K::Text)
                .negate_after()
                .compare(C::Mark(MaskPolicy::IfPartial)),
            row("connmark", module("connmark", "--mark"), K::Text)
                .compare(C::Mark(MaskPolicy::IfPartial)),
            row("mss", module("tcpmss", "--mss"), K::Range),
            row("connlimit_above", module("connlimit", "--connlimit-above"), K::Integer),
            row("connlimit_mask", module("connlimit", "--connlimit-mask"), K::Integer)
                .implied(Implied::PerFamily { v4: "32", v6: "128" }),
            row("time_start", module("time", "--timestart"), K::Text).compare(C::TimeOfDay),
            row("time_stop", module("time", "--timestop"), K::Text).compare(C::TimeOfDay),
            row("month_days", module("time", "--monthdays"), K::Text)
                .list()
                .compare(C::SortedSet { ranges: false }),
            row("week_days", module("time", "--weekdays"), K::Text)
                .list()
                .compare(C::SortedSet { ranges: false }),
            row("date_start", module("time", "--datestart"), K::Text),
            row("date_stop", module("time", "--datestop"), K::Text),
            row("time_contiguous", module("time", "--contiguous"), K::Presence),
            row("kernel_timezone", module("time", "--kerneltz"), K::Presence),
            // The rule name rides in the comment match, last before the target.
            row("name", module("comment", "--comment"), K::Quoted),
            // Targets.
            row("jump", plain("-j"), K::Target).compare(C::JumpTarget),
            row("goto", plain("-g"), K::Target).compare(C::JumpTarget),
            // Target options.
            row("clamp_mss_to_pmtu", plain("--clamp-mss-to-pmtu"), K::Presence),
            row("gateway", plain("--gateway"), K::Text),
            row("set_mss", plain("--set-mss"), K::Integer),
            row("set_dscp", plain("--set-dscp"), K::Text),
            row("set_dscp_class", plain("--set-dscp-class"), K::Text).compare(C::CaseFold),
            row("todest", plain("--to-destination"), K::Text),
            row("tosource", plain("--to-source"), K::Text),
            row("toports", plain("--to-ports"), K::Text),
            row("to", plain("--to"), K::Text),
            row("checksum_fill", plain("--checksum-fill"), K::Presence),
            row("random_fully", plain("--random-fully"), K::Presence),
            row("random", plain("--random"), K::Presence),
            row("log_prefix", plain("--log-prefix"), K::Quoted),
            row("log_level", plain("--log-level"), K::Text)
                .compare(C::LogLevel)
                .implied(Implied::Value("4")),
            row("log_uid", plain("--log-uid"), K::Presence),
            row("log_tcp_sequence", plain("--log-tcp-sequence"), K::Presence),
            row("log_tcp_options", plain("--log-tcp-options"), K::Presence),
            row("log_ip_options", plain("--log-ip-options"), K::Presence),
            row("reject", plain("--reject-with"), K::Text).implied(Implied::PerFamily {
                v4: "icmp-port-unreachable",
                v6: "icmp6-port-unreachable",
            }),
            row("set_mark", plain("--set-xmark"), K::Text).compare(C::Mark(MaskPolicy::Always)),
            row("nflog_group", plain("--nflog-group"), K::Integer),
            row("nflog_prefix", plain("--nflog-prefix"), K::Quoted),
            row("nflog_range", plain("--nflog-range"), K::Integer),
            row("nflog_threshold", plain("--nflog-threshold"), K::Integer),
            row("queue_num", plain("--queue-num"), K::Integer),
            row("queue_bypass", plain("--queue-bypass"), K::Presence),
        ];

        Self::from_rows(attributes)
    }

    fn from_rows(attributes: Vec<AttributeSpec>) -> Self {
        let mut by_name = HashMap::new();
        let mut all_switches = Vec::new();
        let mut by_flag: HashMap<&'static str, Vec<(usize, SwitchRole)>> = HashMap::new();

        for (idx, spec) in attributes.iter().enumerate() {
            by_name.insert(spec.name, idx);
            let switches: Vec<(Switch, SwitchRole)> = match spec.form {
                Form::Simple(sw) => vec![(sw, SwitchRole::Plain)],
                Form::Dual { single, multi } => {
                    vec![(single, SwitchRole::Single), (multi, SwitchRole::Multi)]
                }
                Form::PerFamily { v4, v6 } => {
                    vec![(v4, SwitchRole::Plain), (v6, SwitchRole::Plain)]
                }
                Form::Choice { module, flags } => flags
                    .iter()
                    .map(|&flag| {
                        (
                            Switch::in_module(module, flag),
                            SwitchRole::Choice(flag.trim_start_matches('-')),
                        )
                    })
                    .collect(),
                Form::ModuleOnly(_) => Vec::new(),
            };
            for (sw, role) in switches {
                all_switches.push((sw, idx, role));
                by_flag.entry(sw.flag).or_default().push((idx, role));
            }
        }

        Self {
            attributes,
            by_name,
            switches: all_switches,
            by_flag,
        }
    }

    /// Looks up an attribute by name.
    pub fn lookup(&self, name: &str) -> Option<&AttributeSpec> {
        self.by_name.get(name).map(|&idx| &self.attributes[idx])
    }

    /// Like [`Schema::lookup`] but fails with `UnknownAttribute`.
    pub fn require(&self, name: &str) -> RuleResult<&AttributeSpec> {
        self.lookup(name).ok_or_else(|| RuleError::UnknownAttribute {
            name: name.to_string(),
        })
    }

    /// All attributes in canonical emission order.
    pub fn ordered_attributes(&self) -> &[AttributeSpec] {
        &self.attributes
    }

    /// Attributes that share the `-m <module>` introducer.
    pub fn module_members(&self, module: &str) -> Vec<&AttributeSpec> {
        self.attributes
            .iter()
            .filter(|spec| spec.modules().contains(&module))
            .collect()
    }

    /// The attribute whose whole match is loading `module`.
    pub fn module_only(&self, module: &str) -> Option<&AttributeSpec> {
        self.attributes
            .iter()
            .find(|spec| matches!(spec.form, Form::ModuleOnly(m) if m == module))
    }

    /// Resolves a switch seen in a dump line.
    ///
    /// Tries the exact `(module, flag)` pair first, then the flag with no
    /// module, then the flag in any module provided only one attribute owns
    /// it.
    pub fn find_switch(
        &self,
        module: Option<&str>,
        flag: &str,
    ) -> Option<(&AttributeSpec, SwitchRole)> {
        let scoped = |want: Option<&str>| {
            self.switches
                .iter()
                .find(|(sw, _, _)| sw.module == want && sw.flag == flag)
                .map(|(_, idx, role)| (*idx, *role))
        };
        let hit = module
            .and_then(|m| scoped(Some(m)))
            .or_else(|| scoped(None))
            .or_else(|| match self.by_flag.get(flag) {
                Some(owners) if owners.len() == 1 => Some(owners[0]),
                _ => None,
            })?;
        Some((&self.attributes[hit.0], hit.1))
    }

    /// Canonical position of an attribute.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }
}
