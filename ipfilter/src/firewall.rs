mod test;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use ipfilter_common::{Direction, EnumCount, Family};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    classifier::{Classifier, FunctionTable, RuleFunction},
    compiler::Compiler,
    config::{Policy, Tunables},
    control::{Request, Response},
    logger::{PacketLogger, Verdict},
    packet::PacketSummary,
    resolve::{LiteralResolver, Resolver},
    rule::{Action, BlockReturn, Rule},
    rule_list::{ListStats, RuleId, RuleListStore},
    state::{StateEntry, StateStats, StateTable},
    Error, Result, Tick,
};

/// What to do with a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Pass,
    /// Drop, optionally answering the sender.
    Block(Option<BlockReturn>),
    /// Hold for user authentication.
    Auth,
}

/// Result of [Firewall::check].
#[derive(Debug, Clone)]
pub struct Outcome {
    pub decision: Decision,
    /// Rule the decision came from. `None` when the default policy applied.
    pub rule: Option<Arc<Rule>>,
    /// Flow the packet belongs to, if one is tracked.
    pub state: Option<Arc<StateEntry>>,
    /// True when the state table decided without a rule scan.
    pub from_state: bool,
}

#[derive(Debug, Default)]
struct FilterCounters {
    packets: AtomicU64,
    passed: AtomicU64,
    blocked: AtomicU64,
    auth: AtomicU64,
    nomatch: AtomicU64,
    state_hits: AtomicU64,
    state_added: AtomicU64,
    state_failed: AtomicU64,
}

/// Per direction packet counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilterStats {
    pub direction: Direction,
    pub packets: u64,
    pub passed: u64,
    pub blocked: u64,
    pub auth: u64,
    pub nomatch: u64,
    pub state_hits: u64,
    pub state_added: u64,
    pub state_failed: u64,
}

impl FilterCounters {
    fn snapshot(&self, direction: Direction) -> FilterStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        FilterStats {
            direction,
            packets: get(&self.packets),
            passed: get(&self.passed),
            blocked: get(&self.blocked),
            auth: get(&self.auth),
            nomatch: get(&self.nomatch),
            state_hits: get(&self.state_hits),
            state_added: get(&self.state_added),
            state_failed: get(&self.state_failed),
        }
    }

    fn zero(&self) {
        for c in [
            &self.packets,
            &self.passed,
            &self.blocked,
            &self.auth,
            &self.nomatch,
            &self.state_hits,
            &self.state_added,
            &self.state_failed,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }
}

fn bump(c: &AtomicU64) {
    c.fetch_add(1, Ordering::Relaxed);
}

/// Everything the statistics request reports.
#[derive(Debug, Clone, Serialize)]
pub struct FirewallStats {
    pub filter: Vec<FilterStats>,
    pub rules: Vec<ListStats>,
    pub state: StateStats,
    pub logged: u64,
    pub log_failed: u64,
}

const DIRECTIONS: [Direction; Direction::COUNT] = [Direction::In, Direction::Out];

/// A packet filter: rule lists, connection state and packet logging.
///
/// Packets no rule decides on get the `default_policy` tunable, [Policy::Pass]
/// unless configured otherwise.
///
/// # Example
/// ```
/// # use ipfilter::{Decision, Firewall, PacketSummary};
/// # use std::net::Ipv4Addr;
/// let fw = Firewall::new();
/// fw.add_rule("block in from 10.0.0.0/8 to any", None).unwrap();
/// let packet = PacketSummary::new(Ipv4Addr::new(10, 1, 1, 1), Ipv4Addr::new(192, 168, 0, 1));
/// let outcome = fw.check(ipfilter::Direction::In, &packet, 0);
/// assert_eq!(outcome.decision, Decision::Block(None));
/// ```
pub struct Firewall {
    rules: RuleListStore,
    state: StateTable,
    tunables: RwLock<Tunables>,
    functions: FunctionTable,
    logger: PacketLogger,
    resolver: Box<dyn Resolver>,
    counters: [FilterCounters; Direction::COUNT],
}

impl Default for Firewall {
    fn default() -> Self {
        Self::new()
    }
}

impl Firewall {
    /// Creates an empty [Firewall] with default tunables.
    pub fn new() -> Self {
        Self::with_tunables(Tunables::default())
    }

    pub fn with_tunables(tunables: Tunables) -> Self {
        Self {
            rules: RuleListStore::new(),
            state: StateTable::new(&tunables),
            tunables: RwLock::new(tunables),
            functions: FunctionTable::new(),
            logger: PacketLogger::new(),
            resolver: Box::new(LiteralResolver),
            counters: Default::default(),
        }
    }

    /// Resolver used for host and service names in rule text.
    pub fn with_resolver(self, resolver: impl Resolver + 'static) -> Self {
        Self {
            resolver: Box::new(resolver),
            ..self
        }
    }

    /// Registers a function `call` rules can name.
    pub fn with_function(mut self, name: impl Into<String>, func: impl RuleFunction + 'static) -> Self {
        self.functions.register(name, func);
        self
    }

    fn compiler(&self) -> Compiler<'_> {
        Compiler::new(self.resolver.as_ref())
    }

    fn compile_one(&self, line: usize, text: &str) -> Result<Rule> {
        self.compiler()
            .compile_line(line, text)?
            .ok_or(Error::InvalidRequest)
    }

    /// Compiles one rule and adds it at `position` of its list, or at the end.
    /// The rule is numbered after every rule added or loaded before it.
    ///
    /// # Example
    /// ```
    /// # use ipfilter::Firewall;
    /// let fw = Firewall::new();
    /// fw.add_rule("pass in quick proto tcp from any to any port = 22", None).unwrap();
    /// fw.add_rule("block in all", Some(0)).unwrap();
    /// ```
    pub fn add_rule(&self, text: &str, position: Option<usize>) -> Result<RuleId> {
        self.rules
            .add_numbered(position, |line| self.compile_one(line, text))
    }

    /// Adds every rule in `text`, line by line. Lines that fail are reported
    /// with their line in `text` and skipped.
    pub fn add_rules(&self, text: &str) -> (usize, Vec<Error>) {
        let (rules, mut errors) = self.compiler().compile_str(text);
        let mut added = 0;
        for rule in rules {
            match self.rules.add_numbered(None, |line| Ok(rule.renumbered(line))) {
                Ok(_) => added += 1,
                Err(e) => errors.push(e),
            }
        }
        (added, errors)
    }

    /// Replaces every rule list with the rules in `text`.
    ///
    /// Lines that do not compile are skipped; nothing changes if the rules
    /// that did compile cannot form consistent lists.
    pub fn reload(&self, text: &str) -> Result<(usize, Vec<Error>)> {
        let (rules, errors) = self.compiler().compile_str(text);
        let count = rules.len();
        self.rules.replace(rules)?;
        if !errors.is_empty() {
            warn!(errors = errors.len(), "rule lines skipped on reload");
        }
        Ok((count, errors))
    }

    /// Removes the rule `text` compiles to.
    pub fn remove_rule(&self, text: &str) -> Result<()> {
        let rule = self.compile_one(1, text)?;
        self.rules.remove_rule(rule.body())?;
        Ok(())
    }

    pub fn flush(&self, dir: Option<Direction>, family: Option<Family>) -> usize {
        self.rules.flush(dir, family)
    }

    pub fn flush_state(&self) -> usize {
        let flushed = self.state.flush();
        info!(flushed, "flushed state table");
        flushed
    }

    pub fn rules(&self) -> &RuleListStore {
        &self.rules
    }

    pub fn state(&self) -> &StateTable {
        &self.state
    }

    pub fn tunables(&self) -> Tunables {
        self.tunables.read().clone()
    }

    pub fn get_tunable(&self, name: &str) -> Result<u64> {
        self.tunables.read().get(name)
    }

    pub fn set_tunable(&self, name: &str, value: u64) -> Result<()> {
        let mut tunables = self.tunables.write();
        tunables.set(name, value)?;
        self.state.apply(&tunables);
        info!(name, value, "tunable set");
        Ok(())
    }

    /// Ages out state entries. Call it every tick.
    pub fn expire(&self, now: Tick) -> usize {
        self.state.expire(now)
    }

    fn add_state(
        &self,
        dir: Direction,
        packet: &PacketSummary,
        rule: &Arc<Rule>,
        now: Tick,
    ) -> Option<Arc<StateEntry>> {
        let counters = &self.counters[dir.index()];
        match self.state.add(dir, packet, rule, now) {
            Ok(entry) => {
                bump(&counters.state_added);
                Some(entry)
            }
            Err(e) => {
                debug!(line = rule.line(), "keep state failed: {e}");
                bump(&counters.state_failed);
                None
            }
        }
    }

    fn log(&self, packet: &PacketSummary, dir: Direction, verdict: Verdict, rule: Option<&Rule>) -> bool {
        match self.logger.log(packet, dir, verdict, rule) {
            Ok(()) => true,
            Err(e) => {
                warn!("packet not logged: {e}");
                false
            }
        }
    }

    /// Decides what happens to `packet`, seen travelling `dir` at tick `now`.
    pub fn check(&self, dir: Direction, packet: &PacketSummary, now: Tick) -> Outcome {
        let counters = &self.counters[dir.index()];
        bump(&counters.packets);

        if let Some(hit) = self.state.lookup(dir, packet, now) {
            bump(&counters.state_hits);
            bump(&counters.passed);
            let rule = hit.entry.rule().clone();
            if let Some(log) = &rule.body().log {
                if !log.first {
                    self.log(packet, dir, Verdict::Pass, Some(&rule));
                }
            }
            return Outcome {
                decision: Decision::Pass,
                rule: Some(rule),
                state: Some(hit.entry),
                from_state: true,
            };
        }

        let (ticks_per_second, policy) = {
            let t = self.tunables.read();
            (t.ticks_per_second, t.default_policy)
        };
        let set = self.rules.snapshot(dir, packet.family());
        let keeper = |rule: &Arc<Rule>| self.add_state(dir, packet, rule, now);
        let scan = Classifier::new(now)
            .with_ticks_per_second(ticks_per_second)
            .with_functions(&self.functions)
            .with_state_keeper(&keeper)
            .scan(&set, packet);
        for rule in &scan.logged {
            self.log(packet, dir, Verdict::Log, Some(rule));
        }

        let action = match (&scan.rule, scan.action) {
            (Some(rule), Some(Action::Call { func, now: false })) => self
                .functions
                .get(&func)
                .and_then(|f| f.call(rule, packet))
                .filter(Action::is_decisive),
            (_, action) => action,
        };
        let (mut decision, rule) = match action {
            Some(Action::Pass) => (Decision::Pass, scan.rule),
            Some(Action::Block(ret)) => (Decision::Block(ret), scan.rule),
            Some(Action::Auth | Action::Preauth) => (Decision::Auth, scan.rule),
            _ => {
                bump(&counters.nomatch);
                let decision = match policy {
                    Policy::Pass => Decision::Pass,
                    Policy::Block => Decision::Block(None),
                };
                (decision, None)
            }
        };

        // quick rules track their flow during the scan
        let mut state = scan.state;
        if let (Decision::Pass, Some(rule)) = (&decision, &rule) {
            if rule.body().keep_state && state.is_none() {
                state = self.add_state(dir, packet, rule, now);
                if state.is_none() {
                    decision = Decision::Block(None);
                }
            }
        }

        match &rule {
            Some(r) => {
                if let Some(log) = &r.body().log {
                    let verdict = match decision {
                        Decision::Pass => Verdict::Pass,
                        Decision::Block(_) => Verdict::Block,
                        Decision::Auth => Verdict::Auth,
                    };
                    if !self.log(packet, dir, verdict, Some(r)) && log.or_block {
                        decision = Decision::Block(None);
                    }
                }
            }
            None => debug!(direction = dir.as_str(), "no rule matched"),
        }

        bump(match decision {
            Decision::Pass => &counters.passed,
            Decision::Block(_) => &counters.blocked,
            Decision::Auth => &counters.auth,
        });
        Outcome {
            decision,
            rule,
            state,
            from_state: false,
        }
    }

    pub fn stats(&self) -> FirewallStats {
        FirewallStats {
            filter: DIRECTIONS
                .iter()
                .map(|d| self.counters[d.index()].snapshot(*d))
                .collect(),
            rules: self.rules.rule_stats(),
            state: self.state.stats(),
            logged: self.logger.logged(),
            log_failed: self.logger.failed(),
        }
    }

    /// Resets packet and rule counters.
    pub fn zero_stats(&self) {
        self.counters.iter().for_each(FilterCounters::zero);
        self.rules.zero_stats();
    }

    /// Decodes and runs one control request.
    pub fn request(&self, kind: u32, payload: &[u8], size: usize) -> Result<Response> {
        let request = Request::decode(kind, payload, size)?;
        debug!(?request, "control request");
        Ok(match request {
            Request::AddRule { text, position } => {
                self.add_rule(&text, position)?;
                Response::Done
            }
            Request::RemoveRule { text } => {
                self.remove_rule(&text)?;
                Response::Done
            }
            Request::Flush(sel) => Response::Count(self.flush(sel.direction, sel.family)),
            Request::ZeroStats => {
                self.zero_stats();
                Response::Done
            }
            Request::FetchStats => Response::Stats(serde_json::to_value(self.stats())?),
            Request::NextRule(cursor) => Response::Rule(
                self.rules
                    .nth_rule(
                        cursor.direction,
                        cursor.family,
                        cursor.group.as_deref(),
                        cursor.index,
                    )
                    .map(|r| r.to_string()),
            ),
            Request::SetTunable { name, value } => {
                self.set_tunable(&name, value)?;
                Response::Done
            }
            Request::GetTunable { name } => Response::Tunable(self.get_tunable(&name)?),
            Request::FlushState => Response::Count(self.flush_state()),
            Request::Reload { text } => {
                let (rules, errors) = self.reload(&text)?;
                Response::Loaded {
                    rules,
                    errors: errors.iter().map(ToString::to_string).collect(),
                }
            }
        })
    }
}
