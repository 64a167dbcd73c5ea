use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use ipfilter_common::{
    CoarseMatch, Direction, Family, PortCmp, PortOp, FI_BAD, FI_BROADCAST, FI_FRAG, FI_MBCAST,
    FI_MULTICAST, FI_OOW, FI_OPTIONS, FI_SHORT, GENERIC_PROTO,
};
use serde::Serialize;

use crate::{
    cidr::{Address, HostMatch},
    encode::{flags_to_text, ipopts_to_text, secclass_to_text},
    resolve::proto_name,
    Tick,
};

/// How a rule constrains the packet's protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProtoMatch {
    #[default]
    Any,
    Number(u8),
    /// Either TCP or UDP.
    TcpUdp,
}

impl ProtoMatch {
    pub fn matches(&self, proto: u8) -> bool {
        match self {
            ProtoMatch::Any => true,
            ProtoMatch::Number(p) => *p == proto,
            ProtoMatch::TcpUdp => proto == ipfilter_common::IPPROTO_TCP || proto == ipfilter_common::IPPROTO_UDP,
        }
    }

    pub fn is_tcp(&self) -> bool {
        *self == ProtoMatch::Number(ipfilter_common::IPPROTO_TCP)
    }

    pub fn allows_ports(&self) -> bool {
        match self {
            ProtoMatch::TcpUdp => true,
            ProtoMatch::Number(p) => {
                *p == ipfilter_common::IPPROTO_TCP || *p == ipfilter_common::IPPROTO_UDP
            }
            ProtoMatch::Any => false,
        }
    }

    pub fn is_icmp(&self) -> bool {
        matches!(
            self,
            ProtoMatch::Number(ipfilter_common::IPPROTO_ICMP)
                | ProtoMatch::Number(ipfilter_common::IPPROTO_ICMPV6)
        )
    }

    pub(crate) fn name(&self) -> Option<&'static str> {
        match self {
            ProtoMatch::Any => None,
            ProtoMatch::TcpUdp => Some("tcp/udp"),
            ProtoMatch::Number(p) => proto_name(*p),
        }
    }
}

impl From<u8> for ProtoMatch {
    fn from(p: u8) -> Self {
        if p == GENERIC_PROTO {
            ProtoMatch::TcpUdp
        } else {
            ProtoMatch::Number(p)
        }
    }
}

/// What a blocked packet gets sent back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockReturn {
    /// TCP reset.
    Rst,
    /// ICMP unreachable with `code`; `as_dest` spoofs the source as the original destination.
    Icmp { code: u8, as_dest: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Action {
    Pass,
    Block(Option<BlockReturn>),
    /// Log only, the decision is left alone.
    Log,
    /// Count only, the decision is left alone.
    Account,
    Auth,
    Preauth,
    /// Do not evaluate the next `n` rules.
    Skip(u32),
    NoMatch,
    /// Hand the packet to a registered function; `now` calls it while scanning.
    Call { func: String, now: bool },
}

impl Action {
    /// Whether a match on this action can become the final decision of a scan.
    pub fn is_decisive(&self) -> bool {
        !matches!(
            self,
            Action::Log | Action::Account | Action::Skip(_) | Action::NoMatch
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Emerg,
    Alert,
    Crit,
    Err,
    Warn,
    Notice,
    Info,
    Debug,
}

const PRIORITIES: &[(&str, Priority)] = &[
    ("emerg", Priority::Emerg),
    ("alert", Priority::Alert),
    ("crit", Priority::Crit),
    ("err", Priority::Err),
    ("warn", Priority::Warn),
    ("notice", Priority::Notice),
    ("info", Priority::Info),
    ("debug", Priority::Debug),
];

impl Priority {
    pub fn from_name(name: &str) -> Option<Self> {
        PRIORITIES.iter().find(|(n, _)| *n == name).map(|(_, p)| *p)
    }

    pub fn name(&self) -> &'static str {
        PRIORITIES
            .iter()
            .find(|(_, p)| p == self)
            .map(|(n, _)| *n)
            .unwrap_or("info")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogLevel {
    pub facility: Option<String>,
    pub priority: Priority,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct LogSpec {
    pub body: bool,
    pub first: bool,
    pub or_block: bool,
    pub level: Option<LogLevel>,
}

/// `dup-to`/`to` destination: an interface and optionally a next hop.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub ifname: String,
    pub addr: Option<Address>,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr {
            Some(addr) => write!(f, "{}:{}", self.ifname, addr),
            None => write!(f, "{}", self.ifname),
        }
    }
}

/// Interface bindings: `on` names the interface the packet is on (and the
/// other side for forwarded packets), `in-via`/`out-via` pin each side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Interfaces {
    pub on: [Option<String>; 2],
    pub in_via: Option<String>,
    pub out_via: Option<String>,
}

impl Interfaces {
    pub fn is_empty(&self) -> bool {
        self.on.iter().all(Option::is_none) && self.in_via.is_none() && self.out_via.is_none()
    }
}

/// Everything a rule says: criteria, action, modifiers and grouping.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleBody {
    pub family: Family,
    pub direction: Direction,
    pub action: Action,
    pub quick: bool,
    pub log: Option<LogSpec>,
    pub ifaces: Interfaces,
    pub dup_to: Option<Target>,
    pub route_to: Option<Target>,
    pub fastroute: bool,
    pub coarse: CoarseMatch,
    pub proto: ProtoMatch,
    pub src: HostMatch,
    pub dst: HostMatch,
    pub sport: PortCmp,
    pub dport: PortCmp,
    pub tcp_flags: u8,
    pub tcp_mask: u8,
    pub icmp: u16,
    pub icmp_mask: u16,
    pub keep_state: bool,
    pub keep_frag: bool,
    pub state_age: Option<(Tick, Tick)>,
    pub pps: Option<u32>,
    pub group: Option<String>,
    pub head: Option<String>,
}

impl RuleBody {
    pub fn new(family: Family, direction: Direction, action: Action) -> Self {
        Self {
            family,
            direction,
            action,
            quick: false,
            log: None,
            ifaces: Interfaces::default(),
            dup_to: None,
            route_to: None,
            fastroute: false,
            coarse: CoarseMatch::new(),
            proto: ProtoMatch::Any,
            src: HostMatch::any(family),
            dst: HostMatch::any(family),
            sport: PortCmp::ANY,
            dport: PortCmp::ANY,
            tcp_flags: 0,
            tcp_mask: 0,
            icmp: 0,
            icmp_mask: 0,
            keep_state: false,
            keep_frag: false,
            state_age: None,
            pps: None,
            group: None,
            head: None,
        }
    }
}

/// Per-rule counters, updated without any lock on the classification path.
#[derive(Debug, Default)]
pub struct RuleCounters {
    hits: AtomicU64,
    bytes: AtomicU64,
    last_pkt: AtomicU64,
    window_start: AtomicU64,
    cur_pps: AtomicU64,
}

impl RuleCounters {
    /// Counts one matching packet.
    pub(crate) fn hit(&self, bytes: u64, now: Tick) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        self.last_pkt.store(now, Ordering::Relaxed);
    }

    /// Counts one decided packet and returns the packets decided in the
    /// current one-second window.
    pub(crate) fn rate(&self, now: Tick, ticks_per_second: u64) -> u64 {
        let start = self.window_start.load(Ordering::Relaxed);
        if start == 0 || now.saturating_sub(start) >= ticks_per_second {
            // Losing this race only means another thread opened the window.
            if self
                .window_start
                .compare_exchange(start, now.max(1), Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                self.cur_pps.store(0, Ordering::Relaxed);
            }
        }
        self.cur_pps.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn zero(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.bytes.store(0, Ordering::Relaxed);
        self.last_pkt.store(0, Ordering::Relaxed);
        self.window_start.store(0, Ordering::Relaxed);
        self.cur_pps.store(0, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

/// Read-only snapshot of a rule's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleStats {
    pub line: usize,
    pub rule: String,
    pub hits: u64,
    pub bytes: u64,
    pub last_packet: Tick,
    pub pps: u64,
}

/// A compiled filter rule.
#[derive(Debug)]
pub struct Rule {
    pub(crate) line: usize,
    pub(crate) body: RuleBody,
    pub(crate) counters: Arc<RuleCounters>,
}

impl Rule {
    pub fn new(line: usize, body: RuleBody) -> Self {
        Self {
            line,
            body,
            counters: Arc::default(),
        }
    }

    /// A rule with `body` sharing this rule's line and counters.
    pub(crate) fn rebuilt(&self, body: RuleBody) -> Rule {
        Rule {
            line: self.line,
            body,
            counters: self.counters.clone(),
        }
    }

    pub(crate) fn renumbered(self, line: usize) -> Rule {
        Rule { line, ..self }
    }

    pub fn body(&self) -> &RuleBody {
        &self.body
    }

    /// Source line the rule was compiled from.
    pub fn line(&self) -> usize {
        self.line
    }

    pub fn action(&self) -> &Action {
        &self.body.action
    }

    pub fn direction(&self) -> Direction {
        self.body.direction
    }

    pub fn family(&self) -> Family {
        self.body.family
    }

    pub fn is_quick(&self) -> bool {
        self.body.quick
    }

    pub fn group(&self) -> Option<&str> {
        self.body.group.as_deref()
    }

    pub fn head(&self) -> Option<&str> {
        self.body.head.as_deref()
    }

    pub fn counters(&self) -> &RuleCounters {
        &self.counters
    }

    pub fn stats(&self) -> RuleStats {
        RuleStats {
            line: self.line,
            rule: self.to_string(),
            hits: self.counters.hits(),
            bytes: self.counters.bytes(),
            last_packet: self.counters.last_pkt.load(Ordering::Relaxed),
            pps: self.counters.cur_pps.load(Ordering::Relaxed),
        }
    }
}

impl PartialEq for Rule {
    fn eq(&self, other: &Self) -> bool {
        self.body == other.body
    }
}

impl Eq for Rule {}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.body.fmt(f)
    }
}

fn write_ports(f: &mut fmt::Formatter<'_>, cmp: &PortCmp) -> fmt::Result {
    match cmp.op() {
        PortOp::Any => Ok(()),
        PortOp::InRange => write!(f, " port {}:{}", cmp.port(), cmp.top()),
        op if op.is_range() => write!(f, " port {} {} {}", cmp.port(), op.symbol(), cmp.top()),
        op => write!(f, " port {} {}", op.symbol(), cmp.port()),
    }
}

const WITH_FLAGS: &[(u32, &str)] = &[
    (FI_OPTIONS, "ipopts"),
    (FI_FRAG, "frag"),
    (FI_SHORT, "short"),
    (FI_MULTICAST, "mcast"),
    (FI_BROADCAST, "bcast"),
    (FI_MBCAST, "mbcast"),
    (FI_OOW, "oow"),
    (FI_BAD, "bad"),
];

pub(crate) fn with_flag_bit(name: &str) -> Option<u32> {
    WITH_FLAGS.iter().find(|(_, n)| *n == name).map(|(b, _)| *b)
}

impl fmt::Display for RuleBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.action {
            Action::Pass => write!(f, "pass")?,
            Action::Block(ret) => {
                write!(f, "block")?;
                match ret {
                    None => {}
                    Some(BlockReturn::Rst) => write!(f, " return-rst")?,
                    Some(BlockReturn::Icmp { code, as_dest }) => {
                        let dest = if *as_dest { "-as-dest" } else { "" };
                        write!(f, " return-icmp{dest}({code})")?
                    }
                }
            }
            Action::Log => write!(f, "log")?,
            Action::Account => write!(f, "count")?,
            Action::Auth => write!(f, "auth")?,
            Action::Preauth => write!(f, "preauth")?,
            Action::Skip(n) => write!(f, "skip {n}")?,
            Action::NoMatch => write!(f, "nomatch")?,
            Action::Call { func, now } => {
                write!(f, "call")?;
                if *now {
                    write!(f, " now")?;
                }
                write!(f, " {func}")?
            }
        }
        write!(f, " {}", self.direction.as_str())?;

        if let Some(log) = &self.log {
            write!(f, " log")?;
            if log.body {
                write!(f, " body")?;
            }
            if log.first {
                write!(f, " first")?;
            }
            if log.or_block {
                write!(f, " or-block")?;
            }
            if let Some(level) = &log.level {
                match &level.facility {
                    Some(fac) => write!(f, " level {}.{}", fac, level.priority.name())?,
                    None => write!(f, " level {}", level.priority.name())?,
                }
            }
        }
        if self.quick {
            write!(f, " quick")?;
        }
        match &self.ifaces.on {
            [Some(a), Some(b)] => write!(f, " on {a},{b}")?,
            [Some(a), None] => write!(f, " on {a}")?,
            _ => {}
        }
        if let Some(t) = &self.dup_to {
            write!(f, " dup-to {t}")?;
        }
        if let Some(t) = &self.route_to {
            write!(f, " to {t}")?;
        }
        if self.fastroute {
            write!(f, " fastroute")?;
        }
        if let Some(i) = &self.ifaces.in_via {
            write!(f, " in-via {i}")?;
        }
        if let Some(i) = &self.ifaces.out_via {
            write!(f, " out-via {i}")?;
        }
        if self.family == Family::V6 {
            write!(f, " family inet6")?;
        }
        if let Some(tos) = self.coarse.tos() {
            write!(f, " tos {tos:#04x}")?;
        }
        if let Some(ttl) = self.coarse.ttl() {
            write!(f, " ttl {ttl}")?;
        }
        match (self.proto.name(), self.proto) {
            (Some(name), _) => write!(f, " proto {name}")?,
            (None, ProtoMatch::Number(p)) => write!(f, " proto {p}")?,
            _ => {}
        }

        if self.src.is_any() && self.dst.is_any() && self.sport.is_any() && self.dport.is_any() {
            write!(f, " all")?;
        } else {
            write!(f, " from {}", self.src)?;
            write_ports(f, &self.sport)?;
            write!(f, " to {}", self.dst)?;
            write_ports(f, &self.dport)?;
        }

        if self.tcp_mask != 0 || self.tcp_flags != 0 {
            write!(f, " flags {}", flags_to_text(self.tcp_flags, self.tcp_mask))?;
        }

        let (flags_set, flags_clear) = self.coarse.flags();
        for (bit, name) in WITH_FLAGS {
            if flags_set & bit != 0 {
                write!(f, " with {name}")?;
            } else if flags_clear & bit != 0 {
                write!(f, " with not {name}")?;
            }
        }
        let (opts_set, opts_clear) = self.coarse.options();
        if opts_set != 0 {
            write!(f, " with opt {}", ipopts_to_text(opts_set))?;
        }
        if opts_clear != 0 {
            write!(f, " with not opt {}", ipopts_to_text(opts_clear))?;
        }
        let (sec_set, sec_clear) = self.coarse.security();
        if sec_set != 0 {
            write!(f, " with opt sec-class {}", secclass_to_text(sec_set))?;
        }
        if sec_clear != 0 {
            write!(f, " with not opt sec-class {}", secclass_to_text(sec_clear))?;
        }

        if self.icmp_mask != 0 {
            write!(f, " icmp-type {}", self.icmp >> 8)?;
            if self.icmp_mask & 0xff != 0 {
                write!(f, " code {}", self.icmp & 0xff)?;
            }
        }
        if self.keep_state {
            write!(f, " keep state")?;
        }
        if self.keep_frag {
            write!(f, " keep frag")?;
        }
        if let Some((lo, hi)) = self.state_age {
            if lo == hi {
                write!(f, " state-age {lo}")?;
            } else {
                write!(f, " state-age {lo}/{hi}")?;
            }
        }
        if let Some(pps) = self.pps {
            write!(f, " pps {pps}")?;
        }
        if let Some(head) = &self.head {
            write!(f, " head {head}")?;
        }
        if let Some(group) = &self.group {
            write!(f, " group {group}")?;
        }
        Ok(())
    }
}
