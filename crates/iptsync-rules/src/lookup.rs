//! Symbol tables and name lookups used by the comparator.

use std::collections::HashMap;

use crate::types::Family;

/// ICMP type names accepted by `--icmp-type`, with their numeric codes.
const ICMP_V4: &[(&str, &str)] = &[
    ("echo-reply", "0"),
    ("pong", "0"),
    ("destination-unreachable", "3"),
    ("network-unreachable", "3/0"),
    ("host-unreachable", "3/1"),
    ("protocol-unreachable", "3/2"),
    ("port-unreachable", "3/3"),
    ("fragmentation-needed", "3/4"),
    ("source-route-failed", "3/5"),
    ("network-unknown", "3/6"),
    ("host-unknown", "3/7"),
    ("network-prohibited", "3/9"),
    ("host-prohibited", "3/10"),
    ("TOS-network-unreachable", "3/11"),
    ("TOS-host-unreachable", "3/12"),
    ("communication-prohibited", "3/13"),
    ("host-precedence-violation", "3/14"),
    ("precedence-cutoff", "3/15"),
    ("source-quench", "4"),
    ("redirect", "5"),
    ("network-redirect", "5/0"),
    ("host-redirect", "5/1"),
    ("TOS-network-redirect", "5/2"),
    ("TOS-host-redirect", "5/3"),
    ("echo-request", "8"),
    ("ping", "8"),
    ("router-advertisement", "9"),
    ("router-solicitation", "10"),
    ("time-exceeded", "11"),
    ("ttl-exceeded", "11"),
    ("ttl-zero-during-transit", "11/0"),
    ("ttl-zero-during-reassembly", "11/1"),
    ("parameter-problem", "12"),
    ("ip-header-bad", "12/0"),
    ("required-option-missing", "12/1"),
    ("timestamp-request", "13"),
    ("timestamp-reply", "14"),
    ("address-mask-request", "17"),
    ("address-mask-reply", "18"),
];

/// ICMPv6 type names accepted by `--icmpv6-type`.
const ICMP_V6: &[(&str, &str)] = &[
    ("destination-unreachable", "1"),
    ("no-route", "1/0"),
    ("communication-prohibited", "1/1"),
    ("beyond-scope", "1/2"),
    ("address-unreachable", "1/3"),
    ("port-unreachable", "1/4"),
    ("failed-policy", "1/5"),
    ("reject-route", "1/6"),
    ("packet-too-big", "2"),
    ("time-exceeded", "3"),
    ("ttl-exceeded", "3"),
    ("ttl-zero-during-transit", "3/0"),
    ("ttl-zero-during-reassembly", "3/1"),
    ("parameter-problem", "4"),
    ("bad-header", "4/0"),
    ("unknown-header-type", "4/1"),
    ("unknown-option", "4/2"),
    ("echo-request", "128"),
    ("ping", "128"),
    ("echo-reply", "129"),
    ("pong", "129"),
    ("router-solicitation", "133"),
    ("router-advertisement", "134"),
    ("neighbour-solicitation", "135"),
    ("neighbor-solicitation", "135"),
    ("neighbour-advertisement", "136"),
    ("neighbor-advertisement", "136"),
    ("redirect", "137"),
];

/// Syslog levels accepted by `--log-level`.
const LOG_LEVELS: &[(&str, &str)] = &[
    ("emerg", "0"),
    ("alert", "1"),
    ("crit", "2"),
    ("err", "3"),
    ("error", "3"),
    ("warn", "4"),
    ("warning", "4"),
    ("notice", "5"),
    ("info", "6"),
    ("debug", "7"),
];

/// Targets built into the filter; compared case-insensitively.
pub const BUILTIN_TARGETS: &[&str] = &[
    "ACCEPT",
    "DROP",
    "REJECT",
    "RETURN",
    "QUEUE",
    "LOG",
    "NFLOG",
    "NFQUEUE",
    "MARK",
    "CONNMARK",
    "MASQUERADE",
    "SNAT",
    "DNAT",
    "REDIRECT",
    "NETMAP",
    "TCPMSS",
    "DSCP",
    "CHECKSUM",
    "CT",
    "NOTRACK",
    "TRACE",
    "TEE",
];

/// Numeric form of an ICMP type name, if known for `family`.
pub fn icmp_code(family: Family, name: &str) -> Option<&'static str> {
    let table = match family {
        Family::V4 => ICMP_V4,
        Family::V6 => ICMP_V6,
    };
    table
        .iter()
        .find(|(sym, _)| sym.eq_ignore_ascii_case(name))
        .map(|(_, code)| *code)
}

/// Numeric form of a syslog level name.
pub fn log_level_code(name: &str) -> Option<&'static str> {
    LOG_LEVELS
        .iter()
        .find(|(sym, _)| sym.eq_ignore_ascii_case(name))
        .map(|(_, code)| *code)
}

pub fn is_builtin_target(target: &str) -> bool {
    BUILTIN_TARGETS.iter().any(|t| t.eq_ignore_ascii_case(target))
}

/// Resolves owner names to numeric ids.
pub trait AccountLookup: Send + Sync {
    fn uid(&self, name: &str) -> Option<u32>;
    fn gid(&self, name: &str) -> Option<u32>;
}

/// Fixed name tables, for tests and hosts without an account database.
#[derive(Debug, Clone, Default)]
pub struct StaticAccounts {
    users: HashMap<String, u32>,
    groups: HashMap<String, u32>,
}

impl StaticAccounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, name: impl Into<String>, uid: u32) -> Self {
        self.users.insert(name.into(), uid);
        self
    }

    pub fn with_group(mut self, name: impl Into<String>, gid: u32) -> Self {
        self.groups.insert(name.into(), gid);
        self
    }
}

impl AccountLookup for StaticAccounts {
    fn uid(&self, name: &str) -> Option<u32> {
        self.users.get(name).copied()
    }

    fn gid(&self, name: &str) -> Option<u32> {
        self.groups.get(name).copied()
    }
}
