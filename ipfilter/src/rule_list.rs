mod test;

use std::{collections::HashMap, sync::Arc};

use arc_swap::ArcSwap;
use ipfilter_common::{Direction, EnumCount, Family};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::{
    rule::{Action, Rule, RuleBody, RuleStats},
    Error, Result,
};

/// Stable index of a rule inside a [RuleSet].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RuleId(usize);

/// Named sub-list entered from the rule that heads it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    name: String,
    head: Option<RuleId>,
    rules: Vec<RuleId>,
    refs: usize,
}

impl Group {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            head: None,
            rules: Vec::new(),
            refs: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn head(&self) -> Option<RuleId> {
        self.head
    }

    pub fn rules(&self) -> &[RuleId] {
        &self.rules
    }

    /// Rules that name this group, its head included.
    pub fn refs(&self) -> usize {
        self.refs
    }
}

/// One ordered rule list with its groups.
///
/// Rules live in an arena of slots; lists hold [RuleId]s into it. Slots
/// freed by removal are reused.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    slots: Vec<Option<Arc<Rule>>>,
    top: Vec<RuleId>,
    groups: HashMap<String, Group>,
}

impl RuleSet {
    pub fn get(&self, id: RuleId) -> Option<&Arc<Rule>> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    /// Top level list, in evaluation order.
    pub fn top(&self) -> &[RuleId] {
        &self.top
    }

    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.get(name)
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    /// Rules of the top list (`None`) or of a group, in evaluation order.
    pub fn list(&self, group: Option<&str>) -> impl Iterator<Item = &Arc<Rule>> {
        let ids: &[RuleId] = match group {
            None => &self.top,
            Some(name) => self.groups.get(name).map(|g| &g.rules[..]).unwrap_or(&[]),
        };
        ids.iter().filter_map(move |id| self.get(*id))
    }

    /// Every live rule, in slot order.
    pub fn rules(&self) -> impl Iterator<Item = &Arc<Rule>> {
        self.slots.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.rules().count()
    }

    pub fn is_empty(&self) -> bool {
        self.top.is_empty() && self.groups.values().all(|g| g.rules.is_empty())
    }

    fn ids_mut(&mut self, group: Option<&str>) -> &mut Vec<RuleId> {
        match group {
            None => &mut self.top,
            Some(name) => {
                &mut self
                    .groups
                    .entry(name.to_string())
                    .or_insert_with(|| Group::new(name))
                    .rules
            }
        }
    }

    fn group_mut(&mut self, name: &str) -> &mut Group {
        self.groups
            .entry(name.to_string())
            .or_insert_with(|| Group::new(name))
    }

    /// Skip counts of rules before `at` whose skipped range covers `at` move by `delta`.
    fn fix_skips(&mut self, group: Option<&str>, at: usize, delta: i64) {
        let ids = self.ids_mut(group).clone();
        for (i, id) in ids.iter().enumerate().take(at) {
            let Some(rule) = self.get(*id) else { continue };
            let Action::Skip(n) = rule.action() else { continue };
            if at <= i + *n as usize {
                let mut body = rule.body().clone();
                body.action = Action::Skip((*n as i64 + delta).max(0) as u32);
                let rebuilt = Arc::new(rule.rebuilt(body));
                self.slots[id.0] = Some(rebuilt);
            }
        }
    }

    // Reuses the first free slot.
    fn store(&mut self, rule: Rule) -> RuleId {
        let rule = Some(Arc::new(rule));
        match self.slots.iter().position(Option::is_none) {
            Some(i) => {
                self.slots[i] = rule;
                RuleId(i)
            }
            None => {
                self.slots.push(rule);
                RuleId(self.slots.len() - 1)
            }
        }
    }

    fn insert(&mut self, rule: Rule, position: Option<usize>) -> Result<RuleId> {
        if let Some(head) = rule.head() {
            if self.groups.get(head).and_then(|g| g.head).is_some() {
                return Err(Error::Semantic {
                    line: rule.line(),
                    reason: format!("group {head} already has a head rule"),
                });
            }
        }

        let group = rule.group().map(str::to_string);
        let head = rule.head().map(str::to_string);
        let id = self.store(rule);

        let ids = self.ids_mut(group.as_deref());
        let len = ids.len();
        let at = position.unwrap_or(len).min(len);
        ids.insert(at, id);
        if let Some(name) = &group {
            self.group_mut(name).refs += 1;
        }
        // appending never lands inside a skipped range
        if at < len {
            self.fix_skips(group.as_deref(), at, 1);
        }

        if let Some(name) = &head {
            let g = self.group_mut(name);
            g.head = Some(id);
            g.refs += 1;
        }
        Ok(id)
    }

    fn remove(&mut self, body: &RuleBody) -> Result<Arc<Rule>> {
        let group = body.group.as_deref();
        let ids = match group {
            None => &self.top,
            Some(name) => &self.groups.get(name).ok_or(Error::RuleNotFound)?.rules,
        };
        let at = ids
            .iter()
            .position(|id| self.get(*id).map_or(false, |r| r.body() == body))
            .ok_or(Error::RuleNotFound)?;
        let id = ids[at];

        if let Some(head) = body.head.as_deref() {
            if let Some(g) = self.groups.get_mut(head) {
                if !g.rules.is_empty() {
                    return Err(Error::Busy(head.to_string()));
                }
                g.head = None;
                g.refs = g.refs.saturating_sub(1);
            }
        }

        self.ids_mut(group).remove(at);
        if let Some(name) = group {
            let g = self.group_mut(name);
            g.refs = g.refs.saturating_sub(1);
        }
        self.fix_skips(group, at, -1);
        self.slots[id.0].take().ok_or(Error::RuleNotFound)
    }

    fn remove_group(&mut self, name: &str) -> Result<()> {
        let group = self.groups.get(name).ok_or(Error::RuleNotFound)?;
        if group.refs > 0 {
            return Err(Error::Busy(name.to_string()));
        }
        self.groups.remove(name);
        Ok(())
    }
}

/// Counters of one rule list, for the statistics surface.
#[derive(Debug, Clone, Serialize)]
pub struct ListStats {
    pub direction: Direction,
    pub family: Family,
    pub rules: Vec<RuleStats>,
}

/// Rule lists indexed by direction and family.
///
/// Readers take a snapshot and never wait; writers build the next list and
/// swap it in under a single writer lock.
pub struct RuleListStore {
    lists: [[ArcSwap<RuleSet>; Family::COUNT]; Direction::COUNT],
    /// Writer lock, holding the number the next numbered rule gets.
    writer: Mutex<usize>,
}

impl Default for RuleListStore {
    fn default() -> Self {
        Self::new()
    }
}

const DIRECTIONS: [Direction; Direction::COUNT] = [Direction::In, Direction::Out];
const FAMILIES: [Family; Family::COUNT] = [Family::V4, Family::V6];

fn other(dir: Direction) -> Direction {
    match dir {
        Direction::In => Direction::Out,
        Direction::Out => Direction::In,
    }
}

// A group name belongs to one direction only.
fn check_group_direction(opposite: &RuleSet, rule: &Rule) -> Result<()> {
    for name in [rule.group(), rule.head()].into_iter().flatten() {
        if opposite.group(name).is_some() {
            return Err(Error::Semantic {
                line: rule.line(),
                reason: format!(
                    "group {name} is already used for {} rules",
                    other(rule.direction()).as_str()
                ),
            });
        }
    }
    Ok(())
}

impl RuleListStore {
    pub fn new() -> Self {
        Self {
            lists: std::array::from_fn(|_| {
                std::array::from_fn(|_| ArcSwap::from_pointee(RuleSet::default()))
            }),
            writer: Mutex::new(1),
        }
    }

    fn slot(&self, dir: Direction, family: Family) -> &ArcSwap<RuleSet> {
        &self.lists[dir.index()][family.index()]
    }

    /// The list packets are currently classified against.
    pub fn snapshot(&self, dir: Direction, family: Family) -> Arc<RuleSet> {
        self.slot(dir, family).load_full()
    }

    /// Appends `rule`, or inserts it at `position` of its list.
    pub fn add_rule(&self, rule: Rule, position: Option<usize>) -> Result<RuleId> {
        let mut number = self.writer.lock();
        *number = (*number).max(rule.line() + 1);
        self.add_locked(rule, position)
    }

    /// Adds the rule `build` makes for the next free rule number.
    ///
    /// Numbers keep growing across additions, so rules added one at a time
    /// stay distinguishable in outcomes and statistics.
    pub fn add_numbered(
        &self,
        position: Option<usize>,
        build: impl FnOnce(usize) -> Result<Rule>,
    ) -> Result<RuleId> {
        let mut number = self.writer.lock();
        let id = self.add_locked(build(*number)?, position)?;
        *number += 1;
        Ok(id)
    }

    fn add_locked(&self, rule: Rule, position: Option<usize>) -> Result<RuleId> {
        let (dir, family) = (rule.direction(), rule.family());
        check_group_direction(&self.slot(other(dir), family).load(), &rule)?;
        let mut next = RuleSet::clone(&self.slot(dir, family).load());
        let id = next.insert(rule, position)?;
        self.slot(dir, family).store(Arc::new(next));
        Ok(id)
    }

    /// Removes the rule whose body equals `body`.
    pub fn remove_rule(&self, body: &RuleBody) -> Result<Arc<Rule>> {
        let (dir, family) = (body.direction, body.family);
        let _guard = self.writer.lock();
        let mut next = RuleSet::clone(&self.slot(dir, family).load());
        let removed = next.remove(body)?;
        self.slot(dir, family).store(Arc::new(next));
        Ok(removed)
    }

    /// Deletes an empty, unreferenced group.
    pub fn remove_group(&self, dir: Direction, family: Family, name: &str) -> Result<()> {
        let _guard = self.writer.lock();
        let mut next = RuleSet::clone(&self.slot(dir, family).load());
        next.remove_group(name)?;
        self.slot(dir, family).store(Arc::new(next));
        Ok(())
    }

    /// Empties the selected lists (all of them for `None`), returning how many rules went.
    pub fn flush(&self, dir: Option<Direction>, family: Option<Family>) -> usize {
        let _guard = self.writer.lock();
        let mut flushed = 0;
        for d in DIRECTIONS.iter().filter(|d| dir.map_or(true, |x| x == **d)) {
            for f in FAMILIES.iter().filter(|f| family.map_or(true, |x| x == **f)) {
                flushed += self.slot(*d, *f).swap(Arc::default()).len();
            }
        }
        info!(flushed, "flushed rule lists");
        flushed
    }

    /// Swaps every list for one built from `rules`. Nothing changes on error.
    pub fn replace(&self, rules: Vec<Rule>) -> Result<()> {
        let mut sets: [[RuleSet; Family::COUNT]; Direction::COUNT] = Default::default();
        let count = rules.len();
        let next_number = rules.iter().map(|r| r.line() + 1).max().unwrap_or(1);
        for rule in rules {
            let (dir, family) = (rule.direction(), rule.family());
            check_group_direction(&sets[other(dir).index()][family.index()], &rule)?;
            sets[dir.index()][family.index()].insert(rule, None)?;
        }

        let mut number = self.writer.lock();
        *number = next_number;
        for (d, row) in sets.into_iter().enumerate() {
            for (f, set) in row.into_iter().enumerate() {
                self.lists[d][f].store(Arc::new(set));
            }
        }
        info!(rules = count, "reloaded rule lists");
        Ok(())
    }

    /// Resets the counters of every rule.
    pub fn zero_stats(&self) {
        for d in DIRECTIONS {
            for f in FAMILIES {
                self.snapshot(d, f).rules().for_each(|r| r.counters().zero());
            }
        }
    }

    pub fn rule_stats(&self) -> Vec<ListStats> {
        let mut out = Vec::new();
        for direction in DIRECTIONS {
            for family in FAMILIES {
                let set = self.snapshot(direction, family);
                if set.is_empty() {
                    continue;
                }
                out.push(ListStats {
                    direction,
                    family,
                    rules: set.rules().map(|r| r.stats()).collect(),
                });
            }
        }
        out
    }

    /// The `n`th rule of the top list or of `group`, for iterating a list.
    pub fn nth_rule(
        &self,
        dir: Direction,
        family: Family,
        group: Option<&str>,
        n: usize,
    ) -> Option<Arc<Rule>> {
        self.snapshot(dir, family).list(group).nth(n).cloned()
    }
}
