//! Connection state kept for `keep state` rules.
//!
//! A flow is stored under the key of the packet that opened it. Later packets
//! match either that key (same side) or its reverse (reply side). Each entry
//! sits on one timeout queue, chosen from its protocol and progress.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use ipfilter_common::{
    Direction, Family, IPPROTO_ICMP, IPPROTO_ICMPV6, IPPROTO_TCP, IPPROTO_UDP, TH_ACK, TH_FIN,
    TH_RST, TH_SYN,
};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::debug;

use crate::{
    cidr::Address,
    config::Tunables,
    packet::PacketSummary,
    rule::Rule,
    timeout::{QueueId, QueueStats, TimeoutEntry, TimeoutQueues},
    Error, Result, Tick,
};

/// Addresses, protocol and ports identifying one flow.
///
/// ICMP flows use the query id in place of both ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub family: Family,
    pub proto: u8,
    pub src: Address,
    pub dst: Address,
    pub sport: u16,
    pub dport: u16,
}

impl FlowKey {
    pub fn from_packet(packet: &PacketSummary) -> Self {
        let (sport, dport) = match packet.icmp() {
            Some(icmp) if is_icmp(packet.proto()) => (icmp.id, icmp.id),
            _ => (packet.sport().unwrap_or(0), packet.dport().unwrap_or(0)),
        };
        Self {
            family: packet.family(),
            proto: packet.proto(),
            src: packet.src(),
            dst: packet.dst(),
            sport,
            dport,
        }
    }

    /// Key of the reply flow.
    pub fn reversed(&self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
            sport: self.dport,
            dport: self.sport,
            ..*self
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {},{} > {},{}",
            self.proto, self.src, self.sport, self.dst, self.dport
        )
    }
}

fn is_icmp(proto: u8) -> bool {
    proto == IPPROTO_ICMP || proto == IPPROTO_ICMPV6
}

/// TCP progress of one side of a connection.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, FromPrimitive, Serialize)]
pub enum TcpState {
    Closed = 0,
    Listen = 1,
    SynSent = 2,
    SynReceived = 3,
    Established = 4,
    CloseWait = 5,
    FinWait1 = 6,
    Closing = 7,
    LastAck = 8,
    FinWait2 = 9,
    TimeWait = 10,
    /// Picked up mid-stream, no reply seen yet.
    HalfEstablished = 11,
}

impl TcpState {
    fn from_code(code: u8) -> Self {
        TcpState::from_u8(code).unwrap_or(TcpState::Closed)
    }
}

// `side` sent a segment with `flags`.
fn tcp_transition(states: &mut [TcpState; 2], side: usize, flags: u8) {
    use TcpState::*;
    let other = 1 - side;

    if flags & TH_RST != 0 {
        *states = [Closed, Closed];
        return;
    }
    if flags & TH_SYN != 0 {
        if flags & TH_ACK == 0 {
            states[side] = SynSent;
            if states[other] <= Listen {
                states[other] = Listen;
            }
        } else {
            states[side] = SynReceived;
        }
        return;
    }

    if flags & TH_ACK != 0 {
        match (states[side], states[other]) {
            (SynSent, SynReceived) | (SynReceived, SynSent) => *states = [Established, Established],
            (HalfEstablished, HalfEstablished) if side == 1 => *states = [Established, Established],
            (_, FinWait1) if flags & TH_FIN == 0 => states[other] = FinWait2,
            (_, LastAck) => states[other] = Closed,
            (_, Closing) => states[other] = TimeWait,
            _ => {}
        }
    }

    if flags & TH_FIN != 0 {
        states[side] = match states[side] {
            Established | SynReceived | HalfEstablished => FinWait1,
            CloseWait => LastAck,
            s => s,
        };
        states[other] = match states[other] {
            Established | HalfEstablished => CloseWait,
            FinWait1 => Closing,
            FinWait2 => TimeWait,
            s => s,
        };
    }
}

/// Protocol bucket queues, one per timeout tunable.
#[derive(Debug, Clone, Copy)]
struct SystemQueues {
    tcp_idle: QueueId,
    tcp_close_wait: QueueId,
    tcp_last_ack: QueueId,
    tcp_timeout: QueueId,
    tcp_closed: QueueId,
    tcp_half_closed: QueueId,
    udp: QueueId,
    udp_ack: QueueId,
    icmp: QueueId,
    icmp_ack: QueueId,
    ip: QueueId,
}

impl SystemQueues {
    fn create(queues: &TimeoutQueues<FlowKey>, t: &Tunables) -> Self {
        Self {
            tcp_idle: queues.create_system_queue(t.tcp_idle_timeout),
            tcp_close_wait: queues.create_system_queue(t.tcp_close_wait),
            tcp_last_ack: queues.create_system_queue(t.tcp_last_ack),
            tcp_timeout: queues.create_system_queue(t.tcp_timeout),
            tcp_closed: queues.create_system_queue(t.tcp_closed),
            tcp_half_closed: queues.create_system_queue(t.tcp_half_closed),
            udp: queues.create_system_queue(t.udp_timeout),
            udp_ack: queues.create_system_queue(t.udp_ack_timeout),
            icmp: queues.create_system_queue(t.icmp_timeout),
            icmp_ack: queues.create_system_queue(t.icmp_ack_timeout),
            ip: queues.create_system_queue(t.ip_timeout),
        }
    }

    fn apply(&self, queues: &TimeoutQueues<FlowKey>, t: &Tunables) {
        for (id, ttl) in [
            (self.tcp_idle, t.tcp_idle_timeout),
            (self.tcp_close_wait, t.tcp_close_wait),
            (self.tcp_last_ack, t.tcp_last_ack),
            (self.tcp_timeout, t.tcp_timeout),
            (self.tcp_closed, t.tcp_closed),
            (self.tcp_half_closed, t.tcp_half_closed),
            (self.udp, t.udp_timeout),
            (self.udp_ack, t.udp_ack_timeout),
            (self.icmp, t.icmp_timeout),
            (self.icmp_ack, t.icmp_ack_timeout),
            (self.ip, t.ip_timeout),
        ] {
            queues.set_ttl(id, ttl);
        }
    }

    fn tcp(&self, states: [TcpState; 2]) -> QueueId {
        use TcpState::*;
        match states[0].max(states[1]) {
            Closed => self.tcp_closed,
            Established => self.tcp_idle,
            CloseWait | FinWait1 => self.tcp_half_closed,
            LastAck => self.tcp_last_ack,
            FinWait2 => self.tcp_close_wait,
            Listen | SynSent | SynReceived | Closing | TimeWait | HalfEstablished => {
                self.tcp_timeout
            }
        }
    }

    fn for_proto(&self, proto: u8, replied: bool) -> QueueId {
        match (proto, replied) {
            (IPPROTO_UDP, false) => self.udp,
            (IPPROTO_UDP, true) => self.udp_ack,
            (p, false) if is_icmp(p) => self.icmp,
            (p, true) if is_icmp(p) => self.icmp_ack,
            _ => self.ip,
        }
    }
}

/// One tracked flow.
#[derive(Debug)]
pub struct StateEntry {
    key: FlowKey,
    direction: Direction,
    rule: Arc<Rule>,
    created: Tick,
    timeout: Arc<TimeoutEntry<FlowKey>>,
    /// Queues from the rule's `state-age`, before and after a reply.
    ages: Option<[QueueId; 2]>,
    packets: [AtomicU64; 2],
    bytes: [AtomicU64; 2],
    update: Mutex<()>,
}

impl StateEntry {
    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    /// Direction of the packet that opened the flow.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Rule that created the entry.
    pub fn rule(&self) -> &Arc<Rule> {
        &self.rule
    }

    pub fn created(&self) -> Tick {
        self.created
    }

    pub fn die(&self) -> Tick {
        self.timeout.die()
    }

    pub fn queue(&self) -> Option<QueueId> {
        self.timeout.queue()
    }

    /// Packets seen from the opening side and from the reply side.
    pub fn packets(&self) -> [u64; 2] {
        [
            self.packets[0].load(Ordering::Relaxed),
            self.packets[1].load(Ordering::Relaxed),
        ]
    }

    pub fn bytes(&self) -> [u64; 2] {
        [
            self.bytes[0].load(Ordering::Relaxed),
            self.bytes[1].load(Ordering::Relaxed),
        ]
    }

    pub fn tcp_states(&self) -> Option<[TcpState; 2]> {
        (self.key.proto == IPPROTO_TCP).then(|| {
            let [a, b] = self.timeout.sub_state();
            [TcpState::from_code(a), TcpState::from_code(b)]
        })
    }

    fn count(&self, side: usize, len: u64) {
        self.packets[side].fetch_add(1, Ordering::Relaxed);
        self.bytes[side].fetch_add(len, Ordering::Relaxed);
    }
}

/// Snapshot of the state table for the statistics surface.
#[derive(Debug, Clone, Serialize)]
pub struct StateStats {
    pub active: usize,
    pub max: u64,
    pub added: u64,
    pub expired: u64,
    pub hits: u64,
    pub misses: u64,
    pub full: u64,
    pub queues: Vec<QueueStats>,
}

/// A packet matched to a tracked flow.
#[derive(Debug, Clone)]
pub struct StateMatch {
    pub entry: Arc<StateEntry>,
    /// True when the packet travels the reply way.
    pub reply: bool,
}

#[derive(Debug, Default)]
struct Counters {
    added: AtomicU64,
    expired: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    full: AtomicU64,
}

pub struct StateTable {
    entries: RwLock<HashMap<FlowKey, Arc<StateEntry>>>,
    queues: TimeoutQueues<FlowKey>,
    system: SystemQueues,
    max: AtomicU64,
    counters: Counters,
}

impl StateTable {
    pub fn new(tunables: &Tunables) -> Self {
        let queues = TimeoutQueues::new();
        let system = SystemQueues::create(&queues, tunables);
        Self {
            entries: RwLock::new(HashMap::new()),
            queues,
            system,
            max: AtomicU64::new(tunables.state_max),
            counters: Counters::default(),
        }
    }

    /// Picks up changed timeouts and the table bound.
    pub fn apply(&self, tunables: &Tunables) {
        self.system.apply(&self.queues, tunables);
        self.max.store(tunables.state_max, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn queues(&self) -> &TimeoutQueues<FlowKey> {
        &self.queues
    }

    /// Starts tracking the flow `packet` opens, or returns the entry already
    /// tracking it.
    pub fn add(
        &self,
        dir: Direction,
        packet: &PacketSummary,
        rule: &Arc<Rule>,
        now: Tick,
    ) -> Result<Arc<StateEntry>> {
        let key = FlowKey::from_packet(packet);
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get(&key).or_else(|| entries.get(&key.reversed())) {
            return Ok(entry.clone());
        }
        if entries.len() as u64 >= self.max.load(Ordering::Relaxed) {
            self.counters.full.fetch_add(1, Ordering::Relaxed);
            return Err(Error::StateFull);
        }

        let ages = rule.body().state_age.map(|(lo, hi)| {
            [
                self.queues.get_or_create_queue(lo),
                self.queues.get_or_create_queue(hi),
            ]
        });
        let timeout = TimeoutEntry::new(key, ages.is_some());
        let queue = if key.proto == IPPROTO_TCP {
            let flags = packet.tcp_flags().unwrap_or(0);
            let states = if flags & (TH_SYN | TH_ACK) == TH_SYN {
                [TcpState::SynSent, TcpState::Listen]
            } else {
                [TcpState::HalfEstablished, TcpState::HalfEstablished]
            };
            timeout.set_sub_state([states[0] as u8, states[1] as u8]);
            self.system.tcp(states)
        } else {
            match ages {
                Some([first, _]) => first,
                None => self.system.for_proto(key.proto, false),
            }
        };
        if let Err(e) = self.queues.insert(&timeout, queue, false, now) {
            self.release_ages(ages);
            return Err(e);
        }

        let entry = Arc::new(StateEntry {
            key,
            direction: dir,
            rule: rule.clone(),
            created: now,
            timeout,
            ages,
            packets: Default::default(),
            bytes: Default::default(),
            update: Mutex::new(()),
        });
        entry.count(0, packet.len());
        entries.insert(key, entry.clone());
        self.counters.added.fetch_add(1, Ordering::Relaxed);
        debug!(flow = %key, rule = rule.line(), "state added");
        Ok(entry)
    }

    /// Finds the flow `packet` belongs to and advances it.
    pub fn lookup(&self, dir: Direction, packet: &PacketSummary, now: Tick) -> Option<StateMatch> {
        let key = FlowKey::from_packet(packet);
        let found = {
            let entries = self.entries.read();
            match entries.get(&key) {
                Some(e) if e.direction == dir => Some((e.clone(), false)),
                _ => entries
                    .get(&key.reversed())
                    .filter(|e| e.direction != dir)
                    .map(|e| (e.clone(), true)),
            }
        };
        let Some((entry, reply)) = found else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        self.counters.hits.fetch_add(1, Ordering::Relaxed);

        self.advance(&entry, reply as usize, packet, now);
        Some(StateMatch { entry, reply })
    }

    fn advance(&self, entry: &Arc<StateEntry>, side: usize, packet: &PacketSummary, now: Tick) {
        let _update = entry.update.lock();
        entry.count(side, packet.len());
        let replied = entry.packets[1].load(Ordering::Relaxed) > 0;
        let target = if entry.key.proto == IPPROTO_TCP {
            let [a, b] = entry.timeout.sub_state();
            let mut states = [TcpState::from_code(a), TcpState::from_code(b)];
            tcp_transition(&mut states, side, packet.tcp_flags().unwrap_or(0));
            entry
                .timeout
                .set_sub_state([states[0] as u8, states[1] as u8]);
            self.system.tcp(states)
        } else {
            match entry.ages {
                Some(ages) => ages[replied as usize],
                None => self.system.for_proto(entry.key.proto, replied),
            }
        };

        match entry.timeout.queue() {
            Some(from) if from != target => {
                if let Err(e) = self.queues.move_entry(&entry.timeout, from, target, now) {
                    debug!(flow = %entry.key, "state not moved: {e}");
                    self.queues.touch(&entry.timeout, now);
                }
            }
            Some(_) => {
                self.queues.touch(&entry.timeout, now);
            }
            // already expired, let the next expiry pass drop it
            None => {}
        }
    }

    fn release_ages(&self, ages: Option<[QueueId; 2]>) {
        for id in ages.into_iter().flatten() {
            self.queues.release_queue(id);
        }
    }

    /// Drops flows whose timeout passed, returning how many went.
    pub fn expire(&self, now: Tick) -> usize {
        let expired = self.queues.expire(now);
        if expired.is_empty() {
            return 0;
        }
        let mut entries = self.entries.write();
        let mut count = 0;
        for timeout in expired {
            if let Some(entry) = entries.remove(timeout.parent()) {
                self.release_ages(entry.ages);
                count += 1;
            }
        }
        drop(entries);
        self.counters
            .expired
            .fetch_add(count as u64, Ordering::Relaxed);
        debug!(count, now, "state entries expired");
        count
    }

    pub fn remove(&self, key: &FlowKey) -> Option<Arc<StateEntry>> {
        let entry = self.entries.write().remove(key)?;
        self.queues.remove(&entry.timeout);
        self.release_ages(entry.ages);
        Some(entry)
    }

    /// Forgets every flow.
    pub fn flush(&self) -> usize {
        let drained: Vec<_> = self.entries.write().drain().map(|(_, e)| e).collect();
        for entry in &drained {
            self.queues.remove(&entry.timeout);
            self.release_ages(entry.ages);
        }
        drained.len()
    }

    pub fn get(&self, key: &FlowKey) -> Option<Arc<StateEntry>> {
        self.entries.read().get(key).cloned()
    }

    pub fn stats(&self) -> StateStats {
        StateStats {
            active: self.len(),
            max: self.max.load(Ordering::Relaxed),
            added: self.counters.added.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            full: self.counters.full.load(Ordering::Relaxed),
            queues: self.queues.stats(),
        }
    }
}
