//! Reconciliation integration tests
//!
//! Drives full cycles of the daemon against the simulated filter and checks
//! the commands issued and the resulting chain contents.

use std::io::Write;

use pretty_assertions::assert_eq;
use tempfile::NamedTempFile;

use iptsync_rules::{ChainKey, Family, StaticAccounts};
use iptsync_test::{
    assert_managed_order, chain_names,
    fixtures::{dump_fixtures, rule_fixtures, RuleBuilder},
    CommandVerifier, SimulatedFilter,
};
use iptsyncd::{load_desired_state, ChainSpec, DesiredState, SyncError, SyncMgr};

fn input_v4() -> ChainKey {
    ChainKey::new("INPUT", "filter", Family::V4)
}

fn manager(filter: SimulatedFilter) -> SyncMgr<SimulatedFilter> {
    SyncMgr::new(filter).with_accounts(StaticAccounts::new())
}

fn mixed_filter() -> SimulatedFilter {
    SimulatedFilter::new()
        .with_dump(Family::V4, &dump_fixtures::mixed_input())
        .unwrap()
}

/// Scenario:
/// 1. Start from an empty filter table
/// 2. Apply six rules in one cycle
/// 3. A second cycle finds nothing to do
#[tokio::test]
async fn test_second_cycle_is_converged() {
    let mut mgr = manager(SimulatedFilter::new());
    let desired = DesiredState::new(
        vec![
            rule_fixtures::log_rejected(),
            rule_fixtures::allow_https(),
            rule_fixtures::block_outside(),
            rule_fixtures::allow_ssh(),
            rule_fixtures::drop_invalid(),
            rule_fixtures::allow_http(),
        ],
        Vec::new(),
    );

    let first = mgr.run_cycle(&desired).await.unwrap();
    assert_eq!(first.created, 6);
    assert_managed_order(
        mgr.runner(),
        &input_v4(),
        &[
            "050 drop invalid",
            "100 allow ssh",
            "200 allow http",
            "300 allow https",
            "400 block outside",
            "990 log rejected",
        ],
    )
    .unwrap();

    let second = mgr.run_cycle(&desired).await.unwrap();
    assert!(second.is_converged(), "unexpected commands: {:?}", second.commands);
    assert_eq!(second.noop, 6);
}

/// Scenario:
/// 1. Apply rules the save tool prints back with extra options
///    (`-m tcp`, `--reject-with`, `--mask --rsource`, hex marks, `/32`)
/// 2. A second cycle reads them back as in sync
#[tokio::test]
async fn test_save_tool_additions_converge() {
    let mut mgr = manager(SimulatedFilter::new());
    let desired = DesiredState::new(
        vec![
            RuleBuilder::new("600 reject telnet")
                .one("source", "192.168.0.1")
                .one("proto", "tcp")
                .one("dport", "23")
                .one("jump", "REJECT")
                .build(),
            RuleBuilder::new("610 limit v6 web")
                .family(Family::V6)
                .one("proto", "tcp")
                .many("dport", ["80"])
                .one("connlimit_above", "10")
                .one("jump", "REJECT")
                .build(),
            RuleBuilder::new("640 ssh track")
                .one("proto", "tcp")
                .many("dport", ["22"])
                .one("recent", "set")
                .one("rname", "SSH")
                .one("jump", "ACCEPT")
                .build(),
            RuleBuilder::new("650 ssh brute force")
                .one("proto", "tcp")
                .many("dport", ["22"])
                .one("recent", "update")
                .one("rseconds", "60")
                .one("rhitcount", "4")
                .flag("rttl")
                .one("rname", "SSH")
                .one("jump", "DROP")
                .build(),
            RuleBuilder::new("660 v6 recent")
                .family(Family::V6)
                .one("recent", "rcheck")
                .flag("rdest")
                .one("jump", "DROP")
                .build(),
            RuleBuilder::new("700 mark web")
                .table("mangle")
                .chain("PREROUTING")
                .one("proto", "tcp")
                .many("dport", ["80"])
                .one("match_mark", "10")
                .one("jump", "MARK")
                .one("set_mark", "1")
                .build(),
            RuleBuilder::new("980 log info")
                .one("limit", "3/min")
                .one("burst", "5")
                .one("jump", "LOG")
                .one("log_level", "info")
                .build(),
        ],
        Vec::new(),
    );

    let first = mgr.run_cycle(&desired).await.unwrap();
    assert_eq!(first.created, 7);

    let v4 = mgr.runner().dump(Family::V4, None);
    assert!(v4.contains("-s 192.168.0.1/32 -p tcp -m tcp --dport 23"));
    assert!(v4.contains("-j REJECT --reject-with icmp-port-unreachable"));
    assert!(v4.contains("--name SSH --mask 255.255.255.255 --rsource"));
    assert!(v4.contains("--mark 0xa"));
    assert!(v4.contains("--set-xmark 0x1/0xffffffff"));
    assert!(v4.contains("--log-level 6"));
    assert!(!v4.contains("--limit-burst"));
    let v6 = mgr.runner().dump(Family::V6, None);
    assert!(v6.contains("--connlimit-mask 128"));
    assert!(v6.contains("--reject-with icmp6-port-unreachable"));
    assert!(v6.contains("--rdest --name DEFAULT"));

    let second = mgr.run_cycle(&desired).await.unwrap();
    assert!(second.is_converged(), "unexpected commands: {:?}", second.commands);
    assert_eq!(second.noop, 7);
}

/// Scenario:
/// 1. INPUT holds managed rules interleaved with rules from other tooling
/// 2. A new managed rule lands between its managed neighbours
/// 3. The foreign rules keep their relative order
#[tokio::test]
async fn test_unmanaged_rules_keep_their_place() {
    let mut mgr = manager(mixed_filter()).with_families([Family::V4]);
    let desired = DesiredState::new(
        vec![
            rule_fixtures::allow_ssh(),
            rule_fixtures::allow_http(),
            rule_fixtures::allow_https(),
        ],
        Vec::new(),
    );

    let report = mgr.run_cycle(&desired).await.unwrap();
    assert_eq!(report.created, 1);
    CommandVerifier::new(&report.commands)
        .assert_contains("-I INPUT 3 ")
        .unwrap();

    let rules = mgr.runner().chain_rules(Family::V4, "filter", "INPUT");
    assert_eq!(rules.len(), 6);
    assert_eq!(rules[0], "-A INPUT -i lo -j ACCEPT");
    assert!(rules[2].contains("\"200 allow http\""));
    assert!(rules[3].contains("--ctstate RELATED,ESTABLISHED"));
    assert!(rules[5].contains("\"9500 foreign mdns\""));

    assert!(mgr.run_cycle(&desired).await.unwrap().is_converged());
}

#[tokio::test]
async fn test_purge_spares_ignored_and_foreign_rules() {
    let mut mgr = manager(mixed_filter()).with_families([Family::V4]);
    let mut chain = ChainSpec::new("INPUT", "filter", Family::V4);
    chain.purge = true;
    chain.ignore_foreign = true;
    let desired = DesiredState::new(vec![rule_fixtures::allow_ssh()], vec![chain]);

    let report = mgr.run_cycle(&desired).await.unwrap();
    assert_eq!(report.purged, 1);
    let verifier = CommandVerifier::new(&report.commands);
    verifier.assert_contains("--dports 443").unwrap();
    verifier.assert_absent("-i lo").unwrap();
    verifier.assert_absent("5353").unwrap();

    assert_managed_order(mgr.runner(), &input_v4(), &["100 allow ssh"]).unwrap();
    assert_eq!(chain_names(mgr.runner(), &input_v4()).unwrap().len(), 4);
}

#[tokio::test]
async fn test_purge_without_exemptions() {
    let mut mgr = manager(mixed_filter()).with_families([Family::V4]);
    let mut chain = ChainSpec::new("INPUT", "filter", Family::V4);
    chain.purge = true;
    let desired = DesiredState::new(vec![rule_fixtures::allow_ssh()], vec![chain]);

    let report = mgr.run_cycle(&desired).await.unwrap();
    assert_eq!(report.purged, 4);
    assert_eq!(
        mgr.runner().chain_rules(Family::V4, "filter", "INPUT"),
        vec![
            "-A INPUT -p tcp -m multiport --dports 22 -m comment --comment \"100 allow ssh\" -j ACCEPT"
        ]
    );
}

#[tokio::test]
async fn test_drifted_rule_replaced_in_place() {
    let mut mgr = manager(mixed_filter()).with_families([Family::V4]);
    let desired = DesiredState::new(
        vec![
            rule_fixtures::allow_tcp("100 allow ssh", "2222"),
            rule_fixtures::allow_https(),
        ],
        Vec::new(),
    );

    let report = mgr.run_cycle(&desired).await.unwrap();
    assert_eq!(report.updated, 1);
    let verifier = CommandVerifier::new(&report.commands);
    verifier.assert_verb_count("-R", 1).unwrap();
    verifier.assert_verb_count("-D", 0).unwrap();
    verifier.assert_contains("-R INPUT 2 ").unwrap();

    assert!(mgr.run_cycle(&desired).await.unwrap().is_converged());
}

#[tokio::test]
async fn test_misplaced_rule_moved() {
    let dump = "\
*filter
:INPUT ACCEPT [0:0]
:FORWARD ACCEPT [0:0]
:OUTPUT ACCEPT [0:0]
-A INPUT -p tcp -m multiport --dports 443 -m comment --comment \"300 allow https\" -j ACCEPT
-A INPUT -p tcp -m multiport --dports 22 -m comment --comment \"100 allow ssh\" -j ACCEPT
COMMIT
";
    let filter = SimulatedFilter::new().with_dump(Family::V4, dump).unwrap();
    let mut mgr = manager(filter).with_families([Family::V4]);
    let desired = DesiredState::new(
        vec![
            rule_fixtures::allow_tcp("100 allow ssh", "2222"),
            rule_fixtures::allow_https(),
        ],
        Vec::new(),
    );

    let report = mgr.run_cycle(&desired).await.unwrap();
    let verifier = CommandVerifier::new(&report.commands);
    verifier.assert_order("-D INPUT", "-I INPUT 1 ").unwrap();
    assert_managed_order(
        mgr.runner(),
        &input_v4(),
        &["100 allow ssh", "300 allow https"],
    )
    .unwrap();
}

/// Scenario:
/// 1. The second insert of a cycle fails
/// 2. The first insert stays applied and the cycle reports the failure
/// 3. The next cycle finishes the job
#[tokio::test]
async fn test_failed_command_aborts_cycle() {
    let filter = SimulatedFilter::new().fail_on("200 allow http");
    let mut mgr = manager(filter).with_families([Family::V4]);
    let desired = DesiredState::new(
        vec![
            rule_fixtures::drop_invalid(),
            rule_fixtures::allow_http(),
            rule_fixtures::allow_https(),
        ],
        Vec::new(),
    );

    let err = mgr.run_cycle(&desired).await.unwrap_err();
    match err {
        SyncError::Command(e) => assert_eq!(e.exit_code(), Some(1)),
        other => panic!("Expected Command error, got {other:?}"),
    }
    assert_managed_order(mgr.runner(), &input_v4(), &["050 drop invalid"]).unwrap();
    CommandVerifier::new(&mgr.runner().mutations())
        .assert_absent("300 allow https")
        .unwrap();

    let report = mgr.run_cycle(&desired).await.unwrap();
    assert_eq!(report.created, 2);
    assert_eq!(report.noop, 1);
}

#[tokio::test]
async fn test_both_families_and_custom_chain() {
    let mut mgr = manager(SimulatedFilter::new());
    let logging = RuleBuilder::new("500 log v6")
        .family(Family::V6)
        .chain("LOGGING")
        .one("jump", "LOG")
        .one("log_prefix", "v6: ")
        .build();
    let mut chain = ChainSpec::new("LOGGING", "filter", Family::V6);
    chain.purge = true;
    let desired = DesiredState::new(
        vec![rule_fixtures::allow_ssh(), rule_fixtures::v6_ping(), logging],
        vec![chain],
    );

    let report = mgr.run_cycle(&desired).await.unwrap();
    assert_eq!(report.created, 3);
    assert_eq!(report.chains_created, 1);

    let verifier = CommandVerifier::new(&report.commands);
    verifier
        .assert_order("/sbin/ip6tables -t filter -N LOGGING", "-I LOGGING 1")
        .unwrap();
    verifier
        .assert_contains("/sbin/ip6tables -t filter -I INPUT 1 -p ipv6-icmp -m icmp6 --icmpv6-type echo-request")
        .unwrap();
    verifier
        .assert_contains("/sbin/iptables -t filter -I INPUT 1 -p tcp")
        .unwrap();

    assert!(mgr.runner().has_chain(Family::V6, "filter", "LOGGING"));
    assert!(!mgr.runner().has_chain(Family::V4, "filter", "LOGGING"));
    assert!(mgr.run_cycle(&desired).await.unwrap().is_converged());
}

#[tokio::test]
async fn test_disabled_family_left_alone() {
    let mut mgr = manager(SimulatedFilter::new()).with_families([Family::V4]);
    let desired = DesiredState::new(
        vec![rule_fixtures::allow_ssh(), rule_fixtures::v6_ping()],
        Vec::new(),
    );

    let report = mgr.run_cycle(&desired).await.unwrap();
    assert_eq!(report.created, 1);
    CommandVerifier::new(mgr.runner().commands())
        .assert_absent("ip6tables")
        .unwrap();
}

#[tokio::test]
async fn test_policy_set_once() {
    let mut mgr = manager(SimulatedFilter::new()).with_families([Family::V4]);
    let mut input = ChainSpec::new("INPUT", "filter", Family::V4);
    input.policy = Some("DROP".to_string());
    let desired = DesiredState::new(vec![rule_fixtures::allow_ssh()], vec![input]);

    let report = mgr.run_cycle(&desired).await.unwrap();
    assert_eq!(report.policies_set, 1);
    assert_eq!(
        mgr.runner().policy(Family::V4, "filter", "INPUT").as_deref(),
        Some("DROP")
    );
    assert!(mgr.run_cycle(&desired).await.unwrap().is_converged());
}

#[tokio::test]
async fn test_dry_run_leaves_filter_untouched() {
    let mut mgr = manager(mixed_filter())
        .with_families([Family::V4])
        .with_dry_run(true);
    let mut chain = ChainSpec::new("INPUT", "filter", Family::V4);
    chain.purge = true;
    let desired = DesiredState::new(vec![rule_fixtures::allow_http()], vec![chain]);

    let report = mgr.run_cycle(&desired).await.unwrap();
    assert_eq!(report.purged, 5);
    assert_eq!(report.created, 1);
    // Everything was purged first, so the insert goes to the top.
    CommandVerifier::new(&report.commands)
        .assert_contains("-I INPUT 1 ")
        .unwrap();
    assert!(mgr.runner().mutations().is_empty());
    assert_eq!(
        mgr.runner().chain_rules(Family::V4, "filter", "INPUT").len(),
        5
    );
}

#[tokio::test]
async fn test_desired_state_file_end_to_end() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"{{
  "rules": [
    {{ "name": "100 allow ssh", "proto": "tcp", "dport": ["22"], "jump": "ACCEPT" }},
    {{ "name": "110 allow dns", "proto": "udp", "dport": "53", "source": "192.168.1.0/24", "jump": "ACCEPT" }},
    {{ "name": "120 web ranges", "proto": "tcp", "dport": ["8000-8080", "443"], "ctstate": ["NEW"], "jump": "ACCEPT" }},
    {{ "name": "300 allow https", "ensure": "absent" }}
  ],
  "chains": [
    {{ "name": "INPUT", "purge": true, "ignore": ["-i lo"], "ignore_foreign": true, "policy": "drop" }}
  ]
}}"#
    )
    .unwrap();
    file.flush().unwrap();

    let desired = load_desired_state(file.path()).unwrap();
    let mut mgr = manager(mixed_filter()).with_families([Family::V4]);

    let report = mgr.run_cycle(&desired).await.unwrap();
    assert_eq!(report.policies_set, 1);
    assert_eq!(report.deleted, 1);
    assert_eq!(report.purged, 0);
    assert_eq!(report.created, 2);
    CommandVerifier::new(&report.commands)
        .assert_contains("--dports 8000:8080,443")
        .unwrap();

    assert_managed_order(
        mgr.runner(),
        &input_v4(),
        &["100 allow ssh", "110 allow dns", "120 web ranges"],
    )
    .unwrap();
    let second = mgr.run_cycle(&desired).await.unwrap();
    assert!(second.is_converged(), "unexpected commands: {:?}", second.commands);
}
