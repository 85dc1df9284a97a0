//! Insync Comparator.
//!
//! Decides whether an observed attribute value and a desired one describe the
//! same configuration. Each [`Compare`] strategy normalizes both sides the
//! same way before comparing, so the result does not depend on which side is
//! observed. `None` means the strategy has no opinion and the caller falls
//! back to plain equality.

use std::collections::BTreeSet;
use std::str::FromStr;

use ipnetwork::IpNetwork;
use tracing::trace;

use crate::lookup::{icmp_code, is_builtin_target, log_level_code, AccountLookup};
use crate::schema::{AttributeSpec, Compare, MaskPolicy, OwnerKind};
use crate::types::{AttrValue, Family, Operand};

const FULL_MASK: u64 = 0xffff_ffff;
const ALL_TCP_FLAGS: &[&str] = &["FIN", "SYN", "RST", "PSH", "ACK", "URG"];

/// Ambient inputs some comparisons need.
#[derive(Clone, Copy)]
pub struct CompareContext<'a> {
    pub family: Family,
    pub accounts: &'a dyn AccountLookup,
}

impl<'a> CompareContext<'a> {
    pub fn new(family: Family, accounts: &'a dyn AccountLookup) -> Self {
        Self { family, accounts }
    }
}

/// Family aliasing: `iptables` means `IPv4`, `ip6tables` means `IPv6`.
pub fn family_insync(observed: &str, desired: &str) -> bool {
    match (Family::from_str(observed), Family::from_str(desired)) {
        (Ok(a), Ok(b)) => a == b,
        _ => observed == desired,
    }
}

/// Special-cased comparison for one attribute.
pub fn insync(
    spec: &AttributeSpec,
    observed: &AttrValue,
    desired: &AttrValue,
    ctx: &CompareContext<'_>,
) -> Option<bool> {
    let result = match spec.compare {
        Compare::Exact => None,
        Compare::SortedSet { ranges } => Some(sorted_set(observed, ranges) == sorted_set(desired, ranges)),
        Compare::Cidr => single_pair(observed, desired, normalize_cidr),
        Compare::NumericString => {
            single_pair(observed, desired, |s| s.trim().to_ascii_lowercase())
        }
        Compare::TcpFlags => single_pair(observed, desired, normalize_tcp_flags),
        Compare::Owner(kind) => single_pair(observed, desired, |s| resolve_owner(s, kind, ctx)),
        Compare::CaseFold => single_pair(observed, desired, |s| s.to_ascii_lowercase()),
        Compare::JumpTarget => single_pair_raw(observed, desired).map(|(a, b)| {
            if is_builtin_target(&a.text) || is_builtin_target(&b.text) {
                a.negated == b.negated && a.text.eq_ignore_ascii_case(&b.text)
            } else {
                a == b
            }
        }),
        Compare::Icmp => single_pair(observed, desired, |s| {
            icmp_code(ctx.family, s)
                .map(str::to_string)
                .unwrap_or_else(|| s.to_string())
        }),
        Compare::LogLevel => single_pair(observed, desired, |s| {
            log_level_code(s)
                .map(str::to_string)
                .unwrap_or_else(|| s.to_string())
        }),
        Compare::Mark(policy) => single_pair(observed, desired, |s| normalize_mark(s, policy)),
        Compare::TimeOfDay => single_pair(observed, desired, normalize_time),
    };

    let result = result.or_else(|| generic(observed, desired));
    trace!(attribute = spec.name, %observed, %desired, ?result, "Compared attribute");
    result
}

/// [`insync`], falling back to equality when it has no opinion.
pub fn attribute_insync(
    spec: &AttributeSpec,
    observed: &AttrValue,
    desired: &AttrValue,
    ctx: &CompareContext<'_>,
) -> bool {
    insync(spec, observed, desired, ctx).unwrap_or_else(|| observed == desired)
}

/// Lists compare as sorted sets; anything else gets no opinion.
fn generic(observed: &AttrValue, desired: &AttrValue) -> Option<bool> {
    match (observed, desired) {
        (AttrValue::Many(a), AttrValue::Many(b)) => {
            let mut a: Vec<String> = a.iter().map(Operand::to_string).collect();
            let mut b: Vec<String> = b.iter().map(Operand::to_string).collect();
            a.sort();
            b.sort();
            Some(a == b)
        }
        _ => None,
    }
}

/// The single operand of a value, accepting one-element lists.
fn single(value: &AttrValue) -> Option<&Operand> {
    match value {
        AttrValue::One(op) => Some(op),
        AttrValue::Many(ops) if ops.len() == 1 => ops.first(),
        _ => None,
    }
}

fn single_pair_raw<'v>(
    observed: &'v AttrValue,
    desired: &'v AttrValue,
) -> Option<(&'v Operand, &'v Operand)> {
    Some((single(observed)?, single(desired)?))
}

/// Normalizes both single operands with `norm` and compares them along with
/// their negation.
fn single_pair<F>(observed: &AttrValue, desired: &AttrValue, norm: F) -> Option<bool>
where
    F: Fn(&str) -> String,
{
    let (a, b) = single_pair_raw(observed, desired)?;
    Some(a.negated == b.negated && norm(&a.text) == norm(&b.text))
}

/// Network address plus prefix; a bare host gets a full-length prefix.
pub fn normalize_cidr(text: &str) -> String {
    match IpNetwork::from_str(text.trim()) {
        Ok(net) => format!("{}/{}", net.network(), net.prefix()),
        Err(_) => text.trim().to_ascii_lowercase(),
    }
}

/// Expands `ALL` and `NONE` and turns each flag list into a set.
fn normalize_tcp_flags(text: &str) -> String {
    text.split_whitespace()
        .map(|part| {
            let set: BTreeSet<String> = part
                .split(',')
                .flat_map(|flag| match flag.to_ascii_uppercase().as_str() {
                    "ALL" => ALL_TCP_FLAGS.iter().map(|f| f.to_string()).collect(),
                    "NONE" | "" => Vec::new(),
                    other => vec![other.to_string()],
                })
                .collect();
            set.into_iter().collect::<Vec<_>>().join(",")
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn resolve_owner(text: &str, kind: OwnerKind, ctx: &CompareContext<'_>) -> String {
    let text = text.trim();
    if text.parse::<u32>().is_ok() {
        return text.to_string();
    }
    let id = match kind {
        OwnerKind::User => ctx.accounts.uid(text),
        OwnerKind::Group => ctx.accounts.gid(text),
    };
    id.map(|id| id.to_string()).unwrap_or_else(|| text.to_string())
}

fn parse_number(text: &str) -> Option<u64> {
    let text = text.trim();
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

/// Canonical hex form of `value[/mask]`.
pub fn normalize_mark(text: &str, policy: MaskPolicy) -> String {
    let (value, mask) = match text.split_once('/') {
        Some((v, m)) => (parse_number(v), parse_number(m).map(Some)),
        None => (parse_number(text), Some(None)),
    };
    let (Some(value), Some(mask)) = (value, mask) else {
        return text.trim().to_ascii_lowercase();
    };
    match (policy, mask) {
        (MaskPolicy::Always, mask) => format!("{:#x}/{:#x}", value, mask.unwrap_or(FULL_MASK)),
        (MaskPolicy::IfPartial, Some(mask)) if mask != FULL_MASK => {
            format!("{:#x}/{:#x}", value, mask)
        }
        (MaskPolicy::IfPartial, _) => format!("{:#x}", value),
    }
}

/// Pads `H:M[:S]` to `HH:MM:SS`.
pub fn normalize_time(text: &str) -> String {
    let mut parts: Vec<String> = text
        .trim()
        .split(':')
        .map(|p| format!("{:0>2}", p))
        .collect();
    while parts.len() < 3 {
        parts.push("00".to_string());
    }
    parts.join(":")
}

/// Negation of the whole set plus its sorted elements.
fn sorted_set(value: &AttrValue, ranges: bool) -> (bool, Vec<String>) {
    let ops: Vec<Operand> = match value {
        AttrValue::Present { negated } => return (*negated, Vec::new()),
        AttrValue::One(op) => op
            .text
            .split(',')
            .enumerate()
            .map(|(i, part)| Operand {
                negated: op.negated && i == 0,
                text: part.to_string(),
            })
            .collect(),
        AttrValue::Many(ops) => ops.clone(),
    };
    let negated = ops.first().map(|op| op.negated).unwrap_or(false);
    let mut items: Vec<String> = ops
        .iter()
        .map(|op| {
            let text = op.text.trim().trim_start_matches('!').trim();
            if ranges {
                text.replace('-', ":")
            } else {
                text.to_string()
            }
        })
        .collect();
    items.sort();
    (negated, items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::StaticAccounts;
    use crate::schema::Schema;

    fn check(attr: &str, observed: AttrValue, desired: AttrValue) -> bool {
        let accounts = StaticAccounts::new().with_user("www-data", 33).with_group("adm", 4);
        let ctx = CompareContext::new(Family::V4, &accounts);
        let spec = Schema::standard().lookup(attr).unwrap();
        let forward = attribute_insync(spec, &observed, &desired, &ctx);
        let backward = attribute_insync(spec, &desired, &observed, &ctx);
        assert_eq!(forward, backward, "{attr} comparison is not symmetric");
        forward
    }

    fn one(text: &str) -> AttrValue {
        AttrValue::One(Operand::parse(text))
    }

    #[test]
    fn test_family_aliases() {
        assert!(family_insync("IPv4", "iptables"));
        assert!(family_insync("ip6tables", "IPv6"));
        assert!(!family_insync("IPv4", "ip6tables"));
    }

    #[test]
    fn test_cidr() {
        assert!(check("source", one("10.0.0.1/32"), one("10.0.0.1")));
        assert!(check("destination", one("10.0.0.0/8"), one("10.1.2.3/8")));
        assert!(check("source", one("2001:db8::/32"), one("2001:db8::1/32")));
        assert!(!check("source", one("! 10.0.0.1/32"), one("10.0.0.1")));
        assert!(!check("source", one("10.0.0.2/32"), one("10.0.0.1")));
    }

    #[test]
    fn test_numeric_string() {
        assert!(check("proto", one("tcp"), one("TCP")));
        assert!(check("hop_limit", one("255"), one(" 255")));
        assert!(!check("proto", one("tcp"), one("udp")));
    }

    #[test]
    fn test_tcp_flags() {
        assert!(check(
            "tcp_flags",
            one("FIN,SYN,RST,PSH,ACK,URG SYN"),
            one("ALL SYN")
        ));
        assert!(check("tcp_flags", one("SYN,ACK FIN"), one("ACK,SYN FIN")));
        assert!(!check("tcp_flags", one("SYN,ACK SYN"), one("SYN,ACK ACK")));
        assert!(check("tcp_flags", one("ALL NONE"), one("FIN,SYN,RST,PSH,ACK,URG NONE")));
    }

    #[test]
    fn test_owner() {
        assert!(check("uid", one("33"), one("www-data")));
        assert!(check("uid", one("! 33"), one("! www-data")));
        assert!(!check("uid", one("! 33"), one("www-data")));
        assert!(check("gid", one("4"), one("adm")));
        assert!(!check("gid", one("5"), one("adm")));
    }

    #[test]
    fn test_case_fold() {
        assert!(check("mac_source", one("AA:BB:CC:DD:EE:FF"), one("aa:bb:cc:dd:ee:ff")));
        assert!(check("jump", one("ACCEPT"), one("accept")));
        assert!(!check("jump", one("MYCHAIN"), one("mychain")));
    }

    #[test]
    fn test_symbolic() {
        assert!(check("icmp", one("8"), one("echo-request")));
        assert!(check("icmp", one("ping"), one("echo-request")));
        assert!(!check("icmp", one("0"), one("echo-request")));
        assert!(check("log_level", one("4"), one("warn")));
        assert!(check("log_level", one("7"), one("debug")));
    }

    #[test]
    fn test_marks() {
        assert!(check("match_mark", one("0x2a"), one("42")));
        assert!(check("match_mark", one("0x2a/0xffffffff"), one("0x2a")));
        assert!(check("connmark", one("0x1/0xff"), one("1/255")));
        assert!(!check("connmark", one("0x1/0xff"), one("0x1")));
        assert!(check("set_mark", one("0x2a/0xffffffff"), one("42")));
        assert!(check("set_mark", one("0x2a/0xffffffff"), one("0x2a")));
    }

    #[test]
    fn test_time_of_day() {
        assert!(check("time_start", one("08:00:00"), one("8:00")));
        assert!(check("time_stop", one("17:30:00"), one("17:30")));
        assert!(!check("time_stop", one("17:30:00"), one("17:31")));
    }

    #[test]
    fn test_port_sets() {
        assert!(check(
            "dport",
            AttrValue::many(["! 50:60", "90"]),
            AttrValue::many(["! 90", "50-60"])
        ));
        assert!(check("dport", AttrValue::one("22"), AttrValue::many(["22"])));
        assert!(!check(
            "dport",
            AttrValue::many(["! 22", "80"]),
            AttrValue::many(["22", "80"])
        ));
        assert!(check(
            "state",
            AttrValue::many(["RELATED", "ESTABLISHED"]),
            AttrValue::one("ESTABLISHED,RELATED")
        ));
    }

    #[test]
    fn test_generic_lists_and_fallback() {
        assert!(check(
            "src_type",
            AttrValue::many(["LOCAL", "! BROADCAST"]),
            AttrValue::many(["! BROADCAST", "LOCAL"])
        ));
        assert!(check("iniface", one("eth0"), one("eth0")));
        assert!(!check("iniface", one("eth0"), one("eth1")));
        assert!(!check("iniface", one("eth0"), one("! eth0")));
    }

    #[test]
    fn test_no_opinion_for_exact() {
        let accounts = StaticAccounts::new();
        let ctx = CompareContext::new(Family::V4, &accounts);
        let spec = Schema::standard().lookup("iniface").unwrap();
        assert_eq!(insync(spec, &one("eth0"), &one("eth0"), &ctx), None);
    }

    #[test]
    fn test_normalizers() {
        assert_eq!(normalize_cidr("192.168.1.7/24"), "192.168.1.0/24");
        assert_eq!(normalize_cidr("example.com"), "example.com");
        assert_eq!(normalize_mark("42", MaskPolicy::Always), "0x2a/0xffffffff");
        assert_eq!(normalize_mark("0x2a/0xffffffff", MaskPolicy::IfPartial), "0x2a");
        assert_eq!(normalize_mark("bogus", MaskPolicy::IfPartial), "bogus");
        assert_eq!(normalize_time("8"), "08:00:00");
    }
}
