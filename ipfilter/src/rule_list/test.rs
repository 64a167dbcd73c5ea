#![cfg(test)]

use ipfilter_common::{Direction, Family};

use super::RuleListStore;
use crate::{compiler::Compiler, resolve::LiteralResolver, rule::Action, rule::Rule, Error};

fn rule(line: usize, text: &str) -> Rule {
    Compiler::new(&LiteralResolver)
        .compile_line(line, text)
        .unwrap()
        .unwrap()
}

fn texts(store: &RuleListStore, group: Option<&str>) -> Vec<String> {
    store
        .snapshot(Direction::In, Family::V4)
        .list(group)
        .map(|r| r.to_string())
        .collect()
}

fn skip_of(store: &RuleListStore, n: usize) -> u32 {
    match store
        .nth_rule(Direction::In, Family::V4, None, n)
        .unwrap()
        .action()
    {
        Action::Skip(n) => *n,
        other => panic!("not a skip rule: {other:?}"),
    }
}

#[test]
fn rules_keep_insertion_order() {
    let store = RuleListStore::new();
    store.add_rule(rule(1, "pass in all"), None).unwrap();
    store.add_rule(rule(2, "block in all"), None).unwrap();
    store.add_rule(rule(3, "count in all"), Some(0)).unwrap();
    assert_eq!(texts(&store, None), vec!["count in all", "pass in all", "block in all"]);

    // out of range positions append
    store.add_rule(rule(4, "log in all"), Some(99)).unwrap();
    assert_eq!(texts(&store, None).last().unwrap(), "log in all");
}

#[test]
fn lists_are_per_direction_and_family() {
    let store = RuleListStore::new();
    store.add_rule(rule(1, "pass in all"), None).unwrap();
    store.add_rule(rule(2, "pass out all"), None).unwrap();
    store.add_rule(rule(3, "pass in from ::1 to any"), None).unwrap();
    assert_eq!(store.snapshot(Direction::In, Family::V4).len(), 1);
    assert_eq!(store.snapshot(Direction::Out, Family::V4).len(), 1);
    assert_eq!(store.snapshot(Direction::In, Family::V6).len(), 1);
    assert!(store.snapshot(Direction::Out, Family::V6).is_empty());
}

#[test]
fn insert_inside_skip_range_grows_skip() {
    let store = RuleListStore::new();
    store.add_rule(rule(1, "skip 1 in all"), None).unwrap();
    store.add_rule(rule(2, "pass in all"), None).unwrap();
    store.add_rule(rule(3, "block in all"), None).unwrap();

    store.add_rule(rule(4, "count in all"), Some(2)).unwrap();
    assert_eq!(skip_of(&store, 0), 1);

    store.add_rule(rule(5, "log in all"), Some(1)).unwrap();
    assert_eq!(skip_of(&store, 0), 2);
    // the skipped rules are still the same ones
    assert_eq!(texts(&store, None)[3], "count in all");
}

#[test]
fn remove_inside_skip_range_shrinks_skip() {
    let store = RuleListStore::new();
    store.add_rule(rule(1, "skip 2 in all"), None).unwrap();
    store.add_rule(rule(2, "pass in all"), None).unwrap();
    store.add_rule(rule(3, "count in all"), None).unwrap();
    store.add_rule(rule(4, "block in all"), None).unwrap();

    store.remove_rule(rule(9, "block in all").body()).unwrap();
    assert_eq!(skip_of(&store, 0), 2);

    store.remove_rule(rule(9, "count in all").body()).unwrap();
    assert_eq!(skip_of(&store, 0), 1);
}

#[test]
fn skip_fixup_keeps_counters() {
    let store = RuleListStore::new();
    store.add_rule(rule(1, "skip 1 in all"), None).unwrap();
    store.add_rule(rule(2, "pass in all"), None).unwrap();
    store
        .nth_rule(Direction::In, Family::V4, None, 0)
        .unwrap()
        .counters()
        .hit(40, 10);
    let old = store.snapshot(Direction::In, Family::V4);
    store.add_rule(rule(3, "block in all"), Some(1)).unwrap();

    let skip = store.nth_rule(Direction::In, Family::V4, None, 0).unwrap();
    assert_eq!(skip.line(), 1);
    assert_eq!(skip.counters().hits(), 1);
    assert_eq!(skip.counters().bytes(), 40);

    // packets still classified against the old list count for the new one
    old.list(None).next().unwrap().counters().hit(20, 11);
    assert_eq!(skip.counters().hits(), 2);
    assert_eq!(skip.counters().bytes(), 60);
}

#[test]
fn appending_leaves_skips_alone() {
    let store = RuleListStore::new();
    store.add_rule(rule(1, "skip 1 in proto tcp all"), None).unwrap();
    store.add_rule(rule(2, "block in quick all"), None).unwrap();
    store.add_rule(rule(3, "pass in all"), None).unwrap();
    store.add_rule(rule(4, "block in all"), Some(9)).unwrap();
    assert_eq!(skip_of(&store, 0), 1);

    store
        .replace(vec![
            rule(1, "skip 1 in proto tcp all"),
            rule(2, "block in quick all"),
            rule(3, "pass in all"),
            rule(4, "block in all"),
        ])
        .unwrap();
    assert_eq!(skip_of(&store, 0), 1);
    assert_eq!(texts(&store, None)[0], "skip 1 in proto tcp all");
}

#[test]
fn insert_after_skip_range_leaves_skip_alone() {
    let store = RuleListStore::new();
    store.add_rule(rule(1, "skip 1 in all"), None).unwrap();
    store.add_rule(rule(2, "pass in all"), None).unwrap();
    store.add_rule(rule(3, "block in all"), None).unwrap();
    store.add_rule(rule(4, "count in all"), Some(2)).unwrap();
    assert_eq!(skip_of(&store, 0), 1);
    store.remove_rule(rule(9, "block in all").body()).unwrap();
    assert_eq!(skip_of(&store, 0), 1);
}

#[test]
fn removed_slots_are_reused() {
    let store = RuleListStore::new();
    store.add_rule(rule(1, "pass in all"), None).unwrap();
    for line in 2..50 {
        store.add_rule(rule(line, "block in all"), None).unwrap();
        store.remove_rule(rule(line, "block in all").body()).unwrap();
    }
    let id = store.add_rule(rule(50, "count in all"), None).unwrap();
    let set = store.snapshot(Direction::In, Family::V4);
    assert_eq!(set.len(), 2);
    assert_eq!(set.get(id).unwrap().line(), 50);
    assert_eq!(texts(&store, None), vec!["pass in all", "count in all"]);
    assert_eq!(set.slots.len(), 2);
}

#[test]
fn numbered_rules_follow_earlier_ones() {
    let store = RuleListStore::new();
    store.add_rule(rule(7, "pass in all"), None).unwrap();
    let id = store
        .add_numbered(None, |line| Ok(rule(line, "block in all")))
        .unwrap();
    let next = store.add_numbered(Some(0), |line| Ok(rule(line, "count in all"))).unwrap();
    let set = store.snapshot(Direction::In, Family::V4);
    assert_eq!(set.get(id).unwrap().line(), 8);
    assert_eq!(set.get(next).unwrap().line(), 9);

    // a failed build uses up no number
    let failed = store.add_numbered(None, |line| {
        Err(Error::Semantic {
            line,
            reason: "rejected".to_string(),
        })
    });
    assert!(matches!(failed, Err(Error::Semantic { line: 10, .. })));

    store.replace(vec![rule(1, "pass in all"), rule(2, "block in all")]).unwrap();
    let id = store.add_numbered(None, |line| Ok(rule(line, "log in all"))).unwrap();
    assert_eq!(store.snapshot(Direction::In, Family::V4).get(id).unwrap().line(), 3);
}

#[test]
fn remove_unknown_rule() {
    let store = RuleListStore::new();
    store.add_rule(rule(1, "pass in all"), None).unwrap();
    assert!(matches!(
        store.remove_rule(rule(2, "block in all").body()),
        Err(Error::RuleNotFound)
    ));
    assert!(matches!(
        store.remove_rule(rule(3, "pass in all group 7").body()),
        Err(Error::RuleNotFound)
    ));
}

#[test]
fn groups_track_head_and_members() {
    let store = RuleListStore::new();
    store.add_rule(rule(1, "pass in proto tcp all head 10"), None).unwrap();
    store.add_rule(rule(2, "block in from 10.0.0.1 to any group 10"), None).unwrap();
    store.add_rule(rule(3, "block in from 10.0.0.2 to any group 10"), None).unwrap();

    let set = store.snapshot(Direction::In, Family::V4);
    let group = set.group("10").unwrap();
    assert_eq!(group.name(), "10");
    assert_eq!(group.rules().len(), 2);
    assert_eq!(group.refs(), 3);
    assert_eq!(set.get(group.head().unwrap()).unwrap().line(), 1);
    assert_eq!(set.top().len(), 1);
    assert_eq!(texts(&store, Some("10")).len(), 2);
}

#[test]
fn head_with_members_is_busy() {
    let store = RuleListStore::new();
    let head = rule(1, "pass in all head 10");
    let member = rule(2, "block in all group 10");
    store.add_rule(rule(1, "pass in all head 10"), None).unwrap();
    store.add_rule(rule(2, "block in all group 10"), None).unwrap();

    assert!(matches!(store.remove_rule(head.body()), Err(Error::Busy(g)) if g == "10"));
    store.remove_rule(member.body()).unwrap();
    store.remove_rule(head.body()).unwrap();

    // emptied groups stay until removed
    let set = store.snapshot(Direction::In, Family::V4);
    assert_eq!(set.group("10").unwrap().refs(), 0);
    store.remove_group(Direction::In, Family::V4, "10").unwrap();
    assert!(store.snapshot(Direction::In, Family::V4).group("10").is_none());
}

#[test]
fn referenced_group_cannot_be_removed() {
    let store = RuleListStore::new();
    store.add_rule(rule(1, "block in all group 3"), None).unwrap();
    assert!(matches!(
        store.remove_group(Direction::In, Family::V4, "3"),
        Err(Error::Busy(_))
    ));
    assert!(matches!(
        store.remove_group(Direction::In, Family::V4, "4"),
        Err(Error::RuleNotFound)
    ));
}

#[test]
fn second_head_is_rejected() {
    let store = RuleListStore::new();
    store.add_rule(rule(1, "pass in all head 10"), None).unwrap();
    let err = store.add_rule(rule(2, "block in all head 10"), None).unwrap_err();
    assert!(matches!(err, Error::Semantic { line: 2, .. }));
}

#[test]
fn group_belongs_to_one_direction() {
    let store = RuleListStore::new();
    store.add_rule(rule(1, "pass in all head 10"), None).unwrap();
    let err = store.add_rule(rule(2, "block out all group 10"), None).unwrap_err();
    assert!(matches!(err, Error::Semantic { line: 2, .. }));
}

#[test]
fn replace_is_all_or_nothing() {
    let store = RuleListStore::new();
    store.add_rule(rule(1, "pass in all"), None).unwrap();

    let bad = vec![rule(1, "block in all head 1"), rule(2, "block in all head 1")];
    assert!(store.replace(bad).is_err());
    assert_eq!(texts(&store, None), vec!["pass in all"]);

    store
        .replace(vec![rule(1, "block in all"), rule(2, "pass out all")])
        .unwrap();
    assert_eq!(texts(&store, None), vec!["block in all"]);
    assert_eq!(store.snapshot(Direction::Out, Family::V4).len(), 1);
}

#[test]
fn flush_selected_lists() {
    let store = RuleListStore::new();
    store.add_rule(rule(1, "pass in all"), None).unwrap();
    store.add_rule(rule(2, "pass in all group 1"), None).unwrap();
    store.add_rule(rule(3, "pass out all"), None).unwrap();
    store.add_rule(rule(4, "pass out from ::1 to any"), None).unwrap();

    assert_eq!(store.flush(Some(Direction::In), None), 2);
    assert!(store.snapshot(Direction::In, Family::V4).is_empty());
    assert_eq!(store.flush(None, Some(Family::V6)), 1);
    assert_eq!(store.flush(None, None), 1);
    assert_eq!(store.flush(None, None), 0);
}

#[test]
fn old_snapshots_survive_updates() {
    let store = RuleListStore::new();
    store.add_rule(rule(1, "pass in all"), None).unwrap();
    let before = store.snapshot(Direction::In, Family::V4);
    store.flush(None, None);
    assert_eq!(before.len(), 1);
    assert!(store.snapshot(Direction::In, Family::V4).is_empty());
}

#[test]
fn nth_rule_walks_a_list() {
    let store = RuleListStore::new();
    store.add_rule(rule(1, "pass in all"), None).unwrap();
    store.add_rule(rule(2, "block in all group 5"), None).unwrap();
    let first = store.nth_rule(Direction::In, Family::V4, None, 0).unwrap();
    assert_eq!(first.line(), 1);
    assert!(store.nth_rule(Direction::In, Family::V4, None, 1).is_none());
    let grouped = store
        .nth_rule(Direction::In, Family::V4, Some("5"), 0)
        .unwrap();
    assert_eq!(grouped.line(), 2);
}

#[test]
fn stats_and_zeroing() {
    let store = RuleListStore::new();
    store.add_rule(rule(1, "pass in all"), None).unwrap();
    let r = store.nth_rule(Direction::In, Family::V4, None, 0).unwrap();
    r.counters().hit(100, 4);
    r.counters().hit(50, 5);
    r.counters().rate(4, 2);
    r.counters().rate(5, 2);

    let stats = store.rule_stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].direction, Direction::In);
    let s = &stats[0].rules[0];
    assert_eq!((s.hits, s.bytes, s.last_packet, s.pps), (2, 150, 5, 2));
    assert_eq!(s.rule, "pass in all");

    store.zero_stats();
    assert_eq!(r.counters().hits(), 0);
    assert_eq!(store.rule_stats()[0].rules[0].bytes, 0);
}
