
use std::{collections::HashMap, fmt, sync::Arc};

use ipfilter_common::{Direction, MatchBlock, FI_OOW, FI_SHORT, IPPROTO_TCP};
use tracing::{trace, warn};

use crate::{
    config::DEFAULT_TICKS_PER_SECOND,
    packet::PacketSummary,
    rule::{Action, Rule},
    rule_list::{RuleId, RuleSet},
    state::StateEntry,
    Tick,
};

/// Deepest chain of `head` groups a scan follows.
pub const MAX_GROUP_DEPTH: usize = 16;

/// Function a `call` rule hands matching packets to.
///
/// Returning `None` means the rule did not match after all.
pub trait RuleFunction: Send + Sync {
    fn call(&self, rule: &Rule, packet: &PacketSummary) -> Option<Action>;
}

impl<F> RuleFunction for F
where
    F: Fn(&Rule, &PacketSummary) -> Option<Action> + Send + Sync,
{
    fn call(&self, rule: &Rule, packet: &PacketSummary) -> Option<Action> {
        self(rule, packet)
    }
}

/// Named [RuleFunction]s `call` rules can refer to.
#[derive(Default, Clone)]
pub struct FunctionTable {
    funcs: HashMap<String, Arc<dyn RuleFunction>>,
}

impl fmt::Debug for FunctionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.funcs.keys()).finish()
    }
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, func: impl RuleFunction + 'static) {
        self.funcs.insert(name.into(), Arc::new(func));
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn RuleFunction>> {
        self.funcs.get(name)
    }
}

/// Outcome of one scan.
#[derive(Debug, Default)]
pub struct ScanResult {
    /// Rule that decided, if any rule did.
    pub rule: Option<Arc<Rule>>,
    /// Decision: the rule's action, what a `call now` function returned, or
    /// a block for a rule over its packet rate.
    pub action: Option<Action>,
    /// Rules whose predicates were evaluated, skipped ones excluded.
    pub evaluated: usize,
    /// Matching log-only rules.
    pub logged: Vec<Arc<Rule>>,
    /// Flow tracked for a quick `keep state` rule during the scan.
    pub state: Option<Arc<StateEntry>>,
}

/// Tracks a flow for the rule that decided; `None` when the flow cannot be
/// tracked.
pub type StateKeeper<'f> = &'f dyn Fn(&Arc<Rule>) -> Option<Arc<StateEntry>>;

/// Evaluates packets against rule lists.
#[derive(Clone, Copy)]
pub struct Classifier<'f> {
    now: Tick,
    ticks_per_second: u64,
    functions: Option<&'f FunctionTable>,
    keeper: Option<StateKeeper<'f>>,
}

impl fmt::Debug for Classifier<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Classifier")
            .field("now", &self.now)
            .field("ticks_per_second", &self.ticks_per_second)
            .field("functions", &self.functions)
            .finish_non_exhaustive()
    }
}

impl Default for Classifier<'_> {
    fn default() -> Self {
        Self::new(0)
    }
}

impl<'f> Classifier<'f> {
    /// Classifier for packets arriving at tick `now`.
    pub fn new(now: Tick) -> Self {
        Self {
            now,
            ticks_per_second: DEFAULT_TICKS_PER_SECOND,
            functions: None,
            keeper: None,
        }
    }

    pub fn with_functions(self, functions: &'f FunctionTable) -> Self {
        Self {
            functions: Some(functions),
            ..self
        }
    }

    pub fn with_ticks_per_second(self, ticks_per_second: u64) -> Self {
        Self {
            ticks_per_second: ticks_per_second.max(1),
            ..self
        }
    }

    /// Lets quick `keep state` rules track their flow as they end the scan.
    /// A rule whose flow cannot be tracked is treated as not matching and the
    /// scan goes on.
    pub fn with_state_keeper(self, keeper: StateKeeper<'f>) -> Self {
        Self {
            keeper: Some(keeper),
            ..self
        }
    }

    /// Walks the top list of `set`. The last matching rule decides unless a
    /// `quick` rule stops the walk first.
    pub fn scan(&self, set: &RuleSet, packet: &PacketSummary) -> ScanResult {
        let mut out = ScanResult::default();
        let block = packet.match_block();
        self.scan_list(set, set.top(), packet, &block, 0, &mut out);

        if let Some(rule) = &out.rule {
            if let Some(limit) = rule.body().pps {
                let pps = rule.counters().rate(self.now, self.ticks_per_second);
                if pps > limit as u64 {
                    trace!(line = rule.line(), pps, "over packet rate");
                    out.action = Some(Action::Block(None));
                }
            }
        }
        out
    }

    // Returns the quick flag of the rule that decided last in `ids`, or
    // `None` when no rule there decided.
    fn scan_list(
        &self,
        set: &RuleSet,
        ids: &[RuleId],
        packet: &PacketSummary,
        block: &MatchBlock,
        depth: usize,
        out: &mut ScanResult,
    ) -> Option<bool> {
        let mut skip = 0u32;
        let mut decided = None;
        for id in ids {
            let Some(rule) = set.get(*id) else { continue };
            if skip > 0 {
                skip -= 1;
                continue;
            }
            out.evaluated += 1;
            if !rule_matches(rule, packet, block) {
                continue;
            }
            // no flow can be tracked for an out of window segment
            if rule.body().keep_state && packet.flags() & FI_OOW != 0 {
                trace!(line = rule.line(), "keep state rule passed over");
                continue;
            }
            trace!(line = rule.line(), "rule matched");
            rule.counters().hit(packet.len(), self.now);

            let before = (out.rule.clone(), out.action.clone(), decided);
            match rule.action() {
                Action::Skip(n) => {
                    skip = *n;
                    continue;
                }
                Action::Log => out.logged.push(rule.clone()),
                Action::Account | Action::NoMatch => {}
                Action::Call { func, now: true } => {
                    let called = self
                        .functions
                        .and_then(|t| t.get(func))
                        .and_then(|f| f.call(rule, packet));
                    match called {
                        Some(action) => {
                            out.rule = Some(rule.clone());
                            out.action = Some(action);
                            decided = Some(rule.is_quick());
                        }
                        None => continue,
                    }
                }
                action => {
                    out.rule = Some(rule.clone());
                    out.action = Some(action.clone());
                    decided = Some(rule.is_quick());
                }
            }

            let mut stop = rule.is_quick();
            if let Some(head) = rule.head() {
                match set.group(head) {
                    Some(_) if depth >= MAX_GROUP_DEPTH => {
                        warn!(group = head, "group nesting too deep, not entered")
                    }
                    Some(group) => {
                        // a group decision brings its own quick flag
                        let inner =
                            self.scan_list(set, group.rules(), packet, block, depth + 1, out);
                        if let Some(quick) = inner {
                            stop = quick;
                            decided = inner;
                        }
                    }
                    None => {}
                }
            }
            if stop {
                if !self.keep_state(out) {
                    (out.rule, out.action, decided) = before;
                    continue;
                }
                return decided;
            }
        }
        decided
    }

    // False when the deciding rule wants its flow tracked and that failed.
    fn keep_state(&self, out: &mut ScanResult) -> bool {
        let (Some(keeper), Some(rule)) = (self.keeper, &out.rule) else {
            return true;
        };
        if out.state.is_some() || out.action != Some(Action::Pass) || !rule.body().keep_state {
            return true;
        }
        match keeper(rule) {
            Some(entry) => {
                out.state = Some(entry);
                true
            }
            None => false,
        }
    }
}

fn iface_is(name: &Option<String>, packet_if: Option<&str>) -> bool {
    match name {
        None => true,
        Some(names) => match packet_if {
            Some(ifname) => names.split(',').any(|n| n == ifname || n == "*"),
            None => false,
        },
    }
}

/// Field predicates in order, cheapest rejects first.
pub(crate) fn rule_matches(rule: &Rule, packet: &PacketSummary, block: &MatchBlock) -> bool {
    let body = rule.body();

    let (this_side, other_side) = match body.direction {
        Direction::In => (packet.in_if(), packet.out_if()),
        Direction::Out => (packet.out_if(), packet.in_if()),
    };
    if !iface_is(&body.ifaces.on[0], this_side)
        || !iface_is(&body.ifaces.on[1], other_side)
        || !iface_is(&body.ifaces.in_via, packet.in_if())
        || !iface_is(&body.ifaces.out_via, packet.out_if())
    {
        return false;
    }

    if !body.coarse.matches(block) {
        return false;
    }
    if !body.src.matches(&packet.src()) || !body.dst.matches(&packet.dst()) {
        return false;
    }
    if !body.proto.matches(packet.proto()) {
        return false;
    }

    if !body.sport.is_any() && !packet.sport().map_or(false, |p| body.sport.matches(p)) {
        return false;
    }
    if !body.dport.is_any() && !packet.dport().map_or(false, |p| body.dport.matches(p)) {
        return false;
    }

    if body.tcp_mask != 0 || body.tcp_flags != 0 {
        // a short segment has no flags to compare
        if packet.proto() != IPPROTO_TCP || packet.flags() & FI_SHORT != 0 {
            return false;
        }
        match packet.tcp_flags() {
            Some(f) if f & body.tcp_mask == body.tcp_flags & body.tcp_mask => {}
            _ => return false,
        }
    }

    if body.icmp_mask != 0 {
        match packet.icmp() {
            Some(icmp) if icmp.type_code() & body.icmp_mask == body.icmp & body.icmp_mask => {}
            _ => return false,
        }
    }
    true
}
