#![cfg(test)]

use std::{
    net::Ipv4Addr,
    sync::atomic::{AtomicBool, Ordering},
    thread,
};

use ipfilter_common::{Direction, Family, FI_OOW, IPPROTO_TCP, IPPROTO_UDP, TH_ACK, TH_SYN};

use super::{Decision, Firewall};
use crate::{
    config::{Policy, Tunables},
    control::{RequestKind, Response},
    packet::PacketSummary,
    rule::{Action, BlockReturn, Rule},
    Error,
};

fn tcp_in(src: [u8; 4], dport: u16, flags: u8) -> PacketSummary {
    PacketSummary::new(Ipv4Addr::from(src), Ipv4Addr::new(192, 168, 0, 1))
        .with_proto(IPPROTO_TCP)
        .with_ports(40000, dport)
        .with_tcp_flags(flags)
        .with_len(60)
}

fn tcp_reply(dst: [u8; 4], sport: u16, flags: u8) -> PacketSummary {
    PacketSummary::new(Ipv4Addr::new(192, 168, 0, 1), Ipv4Addr::from(dst))
        .with_proto(IPPROTO_TCP)
        .with_ports(sport, 40000)
        .with_tcp_flags(flags)
}

#[test]
fn keep_state_end_to_end() {
    let fw = Firewall::new();
    fw.add_rule(
        "pass in quick from 10.0.0.0/8 to any port = 80 proto tcp flags S keep state",
        None,
    )
    .unwrap();
    fw.add_rule("block in all", None).unwrap();
    fw.add_rule("block out all", None).unwrap();

    let outcome = fw.check(Direction::In, &tcp_in([10, 1, 1, 1], 80, TH_SYN), 100);
    assert_eq!(outcome.decision, Decision::Pass);
    assert_eq!(outcome.rule.unwrap().line(), 1);
    assert!(!outcome.from_state);
    assert!(outcome.state.is_some());
    assert_eq!(fw.state().len(), 1);

    // the quick rule stopped the scan before the block
    let stats = fw.stats();
    let hits: Vec<_> = stats.rules[0].rules.iter().map(|r| r.hits).collect();
    assert_eq!(hits, vec![1, 0]);

    // replies pass through the state table despite `block out all`
    let outcome = fw.check(
        Direction::Out,
        &tcp_reply([10, 1, 1, 1], 80, TH_SYN | TH_ACK),
        101,
    );
    assert_eq!(outcome.decision, Decision::Pass);
    assert!(outcome.from_state);

    let outcome = fw.check(Direction::In, &tcp_in([172, 16, 0, 1], 80, TH_SYN), 102);
    assert_eq!(outcome.decision, Decision::Block(None));
    assert_eq!(outcome.rule.unwrap().line(), 2);
}

#[test]
fn state_expires() {
    let mut tunables = Tunables::default();
    tunables.udp_timeout = 10;
    let fw = Firewall::with_tunables(tunables);
    fw.add_rule("pass out proto udp all keep state", None).unwrap();
    fw.add_rule("block in all", None).unwrap();

    let query = PacketSummary::new(Ipv4Addr::new(192, 168, 0, 1), Ipv4Addr::new(8, 8, 8, 8))
        .with_proto(IPPROTO_UDP)
        .with_ports(5353, 53);
    let answer = PacketSummary::new(Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(192, 168, 0, 1))
        .with_proto(IPPROTO_UDP)
        .with_ports(53, 5353);
    fw.check(Direction::Out, &query, 0);

    assert_eq!(fw.expire(9), 0);
    assert_eq!(fw.expire(10), 1);
    let outcome = fw.check(Direction::In, &answer, 11);
    assert_eq!(outcome.decision, Decision::Block(None));
}

#[test]
fn default_policy() {
    let fw = Firewall::new();
    let p = tcp_in([10, 0, 0, 1], 22, TH_SYN);
    let outcome = fw.check(Direction::In, &p, 0);
    assert_eq!(outcome.decision, Decision::Pass);
    assert!(outcome.rule.is_none());

    fw.set_tunable("default_policy", 1).unwrap();
    assert_eq!(fw.tunables().default_policy, Policy::Block);
    assert_eq!(fw.check(Direction::In, &p, 0).decision, Decision::Block(None));
    assert_eq!(fw.stats().filter[0].nomatch, 2);
}

#[test]
fn block_returns_and_auth() {
    let fw = Firewall::new();
    fw.add_rule("block return-rst in proto tcp all", None).unwrap();
    fw.add_rule("auth in proto tcp from any to any port = 23", None)
        .unwrap();
    assert_eq!(
        fw.check(Direction::In, &tcp_in([10, 0, 0, 1], 80, TH_SYN), 0).decision,
        Decision::Block(Some(BlockReturn::Rst))
    );
    assert_eq!(
        fw.check(Direction::In, &tcp_in([10, 0, 0, 1], 23, TH_SYN), 0).decision,
        Decision::Auth
    );
    let stats = fw.stats();
    assert_eq!((stats.filter[0].blocked, stats.filter[0].auth), (1, 1));
}

fn quarantine(rule: &Rule, _: &PacketSummary) -> Option<Action> {
    (rule.line() == 2).then(|| Action::Block(None))
}

#[test]
fn deferred_call_decides_after_scan() {
    let fw = Firewall::new().with_function("quarantine", quarantine);
    fw.add_rule("pass in all", None).unwrap();
    fw.add_rule("call quarantine in from 10.0.0.66 to any", None)
        .unwrap();
    let outcome = fw.check(Direction::In, &tcp_in([10, 0, 0, 66], 80, TH_SYN), 0);
    assert_eq!(outcome.decision, Decision::Block(None));
    // unknown functions leave the packet to the default policy
    let fw = Firewall::new();
    fw.add_rule("call nothing in all", None).unwrap();
    let outcome = fw.check(Direction::In, &tcp_in([10, 0, 0, 66], 80, TH_SYN), 0);
    assert_eq!(outcome.decision, Decision::Pass);
    assert!(outcome.rule.is_none());
}

#[test]
fn out_of_window_packets_skip_keep_state_rules() {
    let fw = Firewall::new();
    fw.add_rule("block in all", None).unwrap();
    fw.add_rule("pass in proto tcp all keep state", None).unwrap();
    let p = tcp_in([10, 0, 0, 1], 80, TH_ACK).with_flags(FI_OOW);
    let outcome = fw.check(Direction::In, &p, 0);
    assert_eq!(outcome.decision, Decision::Block(None));
    assert_eq!(outcome.rule.unwrap().line(), 1);
    assert!(outcome.state.is_none());
    assert!(fw.state().is_empty());
}

#[test]
fn full_state_table_blocks() {
    let mut tunables = Tunables::default();
    tunables.state_max = 1;
    let fw = Firewall::with_tunables(tunables);
    fw.add_rule("pass in proto tcp all keep state", None).unwrap();
    fw.check(Direction::In, &tcp_in([10, 0, 0, 1], 80, TH_SYN), 0);
    let outcome = fw.check(Direction::In, &tcp_in([10, 0, 0, 2], 80, TH_SYN), 0);
    assert_eq!(outcome.decision, Decision::Block(None));
    assert_eq!(fw.stats().filter[0].state_failed, 1);
}

#[test]
fn untracked_quick_rule_lets_scan_continue() {
    let mut tunables = Tunables::default();
    tunables.state_max = 1;
    let fw = Firewall::with_tunables(tunables);
    fw.add_rule("block in all", None).unwrap();
    fw.add_rule("pass in quick proto tcp from any to any port = 80 keep state", None)
        .unwrap();
    fw.add_rule("pass in from 10.0.0.2 to any", None).unwrap();

    let outcome = fw.check(Direction::In, &tcp_in([10, 0, 0, 1], 80, TH_SYN), 0);
    assert_eq!(outcome.rule.unwrap().line(), 2);
    assert!(outcome.state.is_some());

    // table full: the quick rule counts as not matching
    let outcome = fw.check(Direction::In, &tcp_in([10, 0, 0, 2], 80, TH_SYN), 0);
    assert_eq!(outcome.decision, Decision::Pass);
    assert_eq!(outcome.rule.unwrap().line(), 3);
    assert!(outcome.state.is_none());

    let outcome = fw.check(Direction::In, &tcp_in([10, 0, 0, 3], 80, TH_SYN), 0);
    assert_eq!(outcome.decision, Decision::Block(None));
    assert_eq!(outcome.rule.unwrap().line(), 1);
    let stats = fw.stats();
    assert_eq!((stats.filter[0].state_added, stats.filter[0].state_failed), (1, 2));
}

#[test]
fn added_rules_are_numbered_in_order() {
    let fw = Firewall::new();
    fw.add_rule("pass in all", None).unwrap();
    fw.add_rule("block in quick from 10.0.0.1 to any", Some(0)).unwrap();
    let (added, _) = fw.add_rules("count in all\nlog in all");
    assert_eq!(added, 2);
    let set = fw.rules().snapshot(Direction::In, Family::V4);
    let lines: Vec<_> = set.list(None).map(|r| r.line()).collect();
    assert_eq!(lines, vec![2, 1, 3, 4]);

    let outcome = fw.check(Direction::In, &tcp_in([10, 0, 0, 1], 80, TH_SYN), 0);
    assert_eq!(outcome.rule.unwrap().line(), 2);
    let outcome = fw.check(Direction::In, &tcp_in([10, 0, 0, 2], 80, TH_SYN), 0);
    assert_eq!(outcome.rule.unwrap().line(), 1);

    fw.reload("block in all").unwrap();
    fw.add_rule("pass in all", None).unwrap();
    let set = fw.rules().snapshot(Direction::In, Family::V4);
    let lines: Vec<_> = set.list(None).map(|r| r.line()).collect();
    assert_eq!(lines, vec![1, 2]);
}

#[test]
fn log_rules_and_modifiers() {
    let fw = Firewall::new();
    fw.add_rule("log in all", None).unwrap();
    fw.add_rule("pass in log first proto tcp all keep state", None)
        .unwrap();
    fw.check(Direction::In, &tcp_in([10, 0, 0, 1], 80, TH_SYN), 0);
    // `log first` is quiet once the flow is tracked
    fw.check(Direction::In, &tcp_in([10, 0, 0, 1], 80, TH_ACK), 1);
    assert_eq!(fw.stats().logged, 2);
}

#[test]
fn add_rules_reports_bad_lines() {
    let fw = Firewall::new();
    let (added, errors) = fw.add_rules("pass in all\npass in frm any\nblock out all\n");
    assert_eq!(added, 2);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].line(), Some(2));
}

#[test]
fn reload_replaces_lists() {
    let fw = Firewall::new();
    fw.add_rule("pass in all", None).unwrap();
    let (count, errors) = fw.reload("block in all\nblock out all\nnonsense").unwrap();
    assert_eq!((count, errors.len()), (2, 1));
    let first = fw
        .rules()
        .nth_rule(Direction::In, Family::V4, None, 0)
        .unwrap();
    assert_eq!(first.to_string(), "block in all");
}

#[test]
fn remove_rule_by_text() {
    let fw = Firewall::new();
    fw.add_rule("block in from 10.0.0.1 to any", None).unwrap();
    fw.remove_rule("block in from 10.0.0.1/32 to any").unwrap();
    assert!(fw.rules().snapshot(Direction::In, Family::V4).is_empty());
    assert!(matches!(
        fw.remove_rule("block in all"),
        Err(Error::RuleNotFound)
    ));
}

fn request(fw: &Firewall, kind: RequestKind, payload: &str) -> crate::Result<Response> {
    fw.request(kind as u32, payload.as_bytes(), payload.len())
}

#[test]
fn control_requests() {
    let fw = Firewall::new();
    assert_eq!(
        request(&fw, RequestKind::AddRule, "block in all").unwrap(),
        Response::Done
    );
    request(&fw, RequestKind::AddRule, "@1 pass in proto udp all").unwrap();
    assert_eq!(
        request(&fw, RequestKind::NextRule, r#"{"direction": "in", "index": 0}"#).unwrap(),
        Response::Rule(Some("pass in proto udp all".to_string()))
    );
    assert_eq!(
        request(&fw, RequestKind::NextRule, r#"{"direction": "in", "index": 2}"#).unwrap(),
        Response::Rule(None)
    );

    request(&fw, RequestKind::SetTunable, r#"{"name": "udp_timeout", "value": 30}"#).unwrap();
    assert_eq!(
        request(&fw, RequestKind::GetTunable, r#"{"name": "udp_timeout"}"#).unwrap(),
        Response::Tunable(30)
    );
    assert!(matches!(
        request(&fw, RequestKind::SetTunable, r#"{"name": "bogus", "value": 1}"#),
        Err(Error::UnknownTunable(_))
    ));

    fw.check(Direction::In, &tcp_in([10, 0, 0, 1], 80, TH_SYN), 0);
    let Response::Stats(stats) = request(&fw, RequestKind::FetchStats, "").unwrap() else {
        panic!("expected stats");
    };
    assert_eq!(stats["filter"][0]["blocked"], 1);
    assert_eq!(stats["rules"][0]["rules"][0]["hits"], 1);

    request(&fw, RequestKind::ZeroStats, "").unwrap();
    assert_eq!(fw.stats().filter[0].packets, 0);

    request(&fw, RequestKind::RemoveRule, "block in all").unwrap();
    assert_eq!(
        request(&fw, RequestKind::Flush, "").unwrap(),
        Response::Count(1)
    );
    assert_eq!(
        request(&fw, RequestKind::FlushState, "").unwrap(),
        Response::Count(0)
    );
    assert_eq!(
        request(&fw, RequestKind::Reload, "pass in all\nbad").unwrap(),
        Response::Loaded {
            rules: 1,
            errors: vec!["line 2: unexpected `bad`".to_string()]
        }
    );
}

#[test]
fn counters_hold_under_parallel_checks() {
    let fw = Firewall::new();
    fw.add_rule("pass in all", None).unwrap();
    fw.add_rule("count in proto tcp all", None).unwrap();
    thread::scope(|s| {
        for t in 0..4u8 {
            let fw = &fw;
            s.spawn(move || {
                for i in 0..500u16 {
                    let p = tcp_in([10, 0, t, 1], 1000 + i, TH_SYN);
                    fw.check(Direction::In, &p, u64::from(i));
                }
            });
        }
    });

    let stats = fw.stats();
    assert_eq!((stats.filter[0].packets, stats.filter[0].passed), (2000, 2000));
    let hits: Vec<_> = stats.rules[0]
        .rules
        .iter()
        .map(|r| (r.hits, r.bytes))
        .collect();
    assert_eq!(hits, vec![(2000, 120_000), (2000, 120_000)]);
}

#[test]
fn reload_swaps_whole_lists() {
    let old = "block in all\nblock in proto tcp all\nblock in from 10.0.0.0/8 to any";
    let new = "pass in all\npass in proto tcp all\npass in from 10.0.0.0/8 to any";
    let fw = Firewall::new();
    fw.reload(old).unwrap();
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        s.spawn(|| {
            for i in 0..200 {
                fw.reload(if i % 2 == 0 { new } else { old }).unwrap();
            }
            done.store(true, Ordering::Relaxed);
        });
        for t in 0..3u8 {
            let (fw, done) = (&fw, &done);
            s.spawn(move || {
                let mut checked = 0;
                while !done.load(Ordering::Relaxed) || checked < 100 {
                    let set = fw.rules().snapshot(Direction::In, Family::V4);
                    let actions: Vec<_> = set.list(None).map(|r| r.action().clone()).collect();
                    assert_eq!(actions.len(), 3);
                    assert!(actions.iter().all(|a| *a == actions[0]), "{actions:?}");

                    let p = tcp_in([10, 0, t, 1], 80, TH_SYN);
                    let outcome = fw.check(Direction::In, &p, 0);
                    let rule = outcome.rule.unwrap();
                    assert_eq!(rule.line(), 3);
                    let expected = match rule.action() {
                        Action::Pass => Decision::Pass,
                        _ => Decision::Block(None),
                    };
                    assert_eq!(outcome.decision, expected);
                    checked += 1;
                }
            });
        }
    });

    let filter = &fw.stats().filter[0];
    assert!(filter.packets >= 300);
    assert_eq!(filter.packets, filter.passed + filter.blocked);
}
