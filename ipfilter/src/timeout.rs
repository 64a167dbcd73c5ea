//! Timeout queues: entries age out in FIFO order per queue.
//!
//! Every queue has a fixed ttl, so appending on each touch keeps a queue
//! sorted by expiry and [TimeoutQueues::expire] only ever looks at heads.
//! Queues live in an arena and entries name their queue by [QueueId].
//! Lock order is manager, then queue, then entry.
mod test;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, trace};

use crate::{Error, Result, Tick};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct QueueId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Fixed protocol bucket, lives as long as the manager.
    System,
    /// Created on demand for a rule's own ttl; freed once unreferenced and empty.
    User,
}

#[derive(Debug, Default)]
struct EntryState {
    queue: Option<QueueId>,
    node: usize,
    die: Tick,
    touched: Tick,
    sub_state: [u8; 2],
}

/// A live entry, owned by whatever tracks `parent`.
#[derive(Debug)]
pub struct TimeoutEntry<K> {
    parent: K,
    rule_based: bool,
    state: Mutex<EntryState>,
}

impl<K> TimeoutEntry<K> {
    pub fn new(parent: K, rule_based: bool) -> Arc<Self> {
        Arc::new(Self {
            parent,
            rule_based,
            state: Mutex::new(EntryState::default()),
        })
    }

    pub fn parent(&self) -> &K {
        &self.parent
    }

    /// Whether the entry ages on a rule's own ttl rather than a protocol bucket.
    pub fn is_rule_based(&self) -> bool {
        self.rule_based
    }

    pub fn queue(&self) -> Option<QueueId> {
        self.state.lock().queue
    }

    /// Tick at which the entry expires.
    pub fn die(&self) -> Tick {
        self.state.lock().die
    }

    pub fn touched(&self) -> Tick {
        self.state.lock().touched
    }

    /// Protocol specific state, one code per side.
    pub fn sub_state(&self) -> [u8; 2] {
        self.state.lock().sub_state
    }

    pub fn set_sub_state(&self, sub_state: [u8; 2]) {
        self.state.lock().sub_state = sub_state;
    }
}

struct Node<K> {
    entry: Arc<TimeoutEntry<K>>,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Doubly linked list over a slab of nodes.
struct EntryList<K> {
    nodes: Vec<Option<Node<K>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl<K> EntryList<K> {
    fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    fn alloc(&mut self, node: Node<K>) -> usize {
        match self.free.pop() {
            Some(i) => {
                self.nodes[i] = Some(node);
                i
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    fn node_mut(&mut self, i: usize) -> Option<&mut Node<K>> {
        self.nodes.get_mut(i).and_then(Option::as_mut)
    }

    fn push_back(&mut self, entry: Arc<TimeoutEntry<K>>) -> usize {
        let i = self.alloc(Node {
            entry,
            prev: self.tail,
            next: None,
        });
        match self.tail.and_then(|t| self.node_mut(t)) {
            Some(tail) => tail.next = Some(i),
            None => self.head = Some(i),
        }
        self.tail = Some(i);
        self.len += 1;
        i
    }

    fn push_front(&mut self, entry: Arc<TimeoutEntry<K>>) -> usize {
        let i = self.alloc(Node {
            entry,
            prev: None,
            next: self.head,
        });
        match self.head.and_then(|h| self.node_mut(h)) {
            Some(head) => head.prev = Some(i),
            None => self.tail = Some(i),
        }
        self.head = Some(i);
        self.len += 1;
        i
    }

    fn unlink(&mut self, i: usize) -> Option<Arc<TimeoutEntry<K>>> {
        let node = self.nodes.get_mut(i)?.take()?;
        match node.prev.and_then(|p| self.node_mut(p)) {
            Some(prev) => prev.next = node.next,
            None => self.head = node.next,
        }
        match node.next.and_then(|n| self.node_mut(n)) {
            Some(next) => next.prev = node.prev,
            None => self.tail = node.prev,
        }
        self.free.push(i);
        self.len -= 1;
        Some(node.entry)
    }

    fn front(&self) -> Option<(usize, &Arc<TimeoutEntry<K>>)> {
        let i = self.head?;
        self.nodes[i].as_ref().map(|n| (i, &n.entry))
    }
}

struct QueueInner<K> {
    refs: usize,
    pending_delete: bool,
    list: EntryList<K>,
}

/// Entries sharing one ttl.
pub struct TimeoutQueue<K> {
    id: QueueId,
    ttl: AtomicU64,
    kind: QueueKind,
    inner: Mutex<QueueInner<K>>,
}

impl<K> TimeoutQueue<K> {
    pub fn id(&self) -> QueueId {
        self.id
    }

    pub fn ttl(&self) -> Tick {
        self.ttl.load(Ordering::Relaxed)
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.inner.lock().list.len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read-only view of one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub id: QueueId,
    pub ttl: Tick,
    pub refs: usize,
    pub entries: usize,
    pub user: bool,
    pub pending_delete: bool,
}

/// Arena of timeout queues.
pub struct TimeoutQueues<K> {
    queues: RwLock<Vec<Option<Arc<TimeoutQueue<K>>>>>,
}

impl<K> Default for TimeoutQueues<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> TimeoutQueues<K> {
    pub fn new() -> Self {
        Self {
            queues: RwLock::new(Vec::new()),
        }
    }

    fn queue(&self, id: QueueId) -> Option<Arc<TimeoutQueue<K>>> {
        self.queues.read().get(id.0).cloned().flatten()
    }

    fn push_queue(slots: &mut Vec<Option<Arc<TimeoutQueue<K>>>>, ttl: Tick, kind: QueueKind) -> QueueId {
        let i = slots.iter().position(Option::is_none).unwrap_or(slots.len());
        let id = QueueId(i);
        let queue = Arc::new(TimeoutQueue {
            id,
            ttl: AtomicU64::new(ttl),
            kind,
            inner: Mutex::new(QueueInner {
                refs: 1,
                pending_delete: false,
                list: EntryList::new(),
            }),
        });
        if i == slots.len() {
            slots.push(Some(queue));
        } else {
            slots[i] = Some(queue);
        }
        id
    }

    /// A protocol bucket queue. Never shared, never freed by aging.
    pub fn create_system_queue(&self, ttl: Tick) -> QueueId {
        Self::push_queue(&mut self.queues.write(), ttl, QueueKind::System)
    }

    /// Returns the user queue with this ttl, taking a reference, or creates one.
    ///
    /// A queue waiting for deletion is revived.
    pub fn get_or_create_queue(&self, ttl: Tick) -> QueueId {
        let mut slots = self.queues.write();
        for q in slots.iter().flatten() {
            if q.kind == QueueKind::User && q.ttl() == ttl {
                let mut inner = q.inner.lock();
                inner.refs += 1;
                inner.pending_delete = false;
                return q.id;
            }
        }
        let id = Self::push_queue(&mut slots, ttl, QueueKind::User);
        debug!(?id, ttl, "created timeout queue");
        id
    }

    /// Drops a reference. An unreferenced user queue becomes pending deletion.
    pub fn release_queue(&self, id: QueueId) {
        if let Some(q) = self.queue(id) {
            let mut inner = q.inner.lock();
            inner.refs = inner.refs.saturating_sub(1);
            if inner.refs == 0 && q.kind == QueueKind::User {
                inner.pending_delete = true;
            }
        }
    }

    pub fn set_ttl(&self, id: QueueId, ttl: Tick) {
        if let Some(q) = self.queue(id) {
            q.ttl.store(ttl, Ordering::Relaxed);
        }
    }

    pub fn ttl(&self, id: QueueId) -> Option<Tick> {
        self.queue(id).map(|q| q.ttl())
    }

    /// Links an unqueued entry into `queue`, expiring `ttl` ticks after `now`.
    ///
    /// An entry that is already queued is moved instead.
    pub fn insert(
        &self,
        entry: &Arc<TimeoutEntry<K>>,
        queue: QueueId,
        at_front: bool,
        now: Tick,
    ) -> Result<()> {
        if let Some(from) = entry.queue() {
            return self.move_entry(entry, from, queue, now).map(|_| ());
        }
        let q = self.queue(queue).ok_or(Error::QueueBusy)?;
        let mut inner = q.inner.lock();
        if inner.pending_delete {
            return Err(Error::QueueBusy);
        }
        let node = if at_front {
            inner.list.push_front(entry.clone())
        } else {
            inner.list.push_back(entry.clone())
        };
        let mut state = entry.state.lock();
        state.queue = Some(queue);
        state.node = node;
        state.die = now + q.ttl();
        state.touched = now;
        Ok(())
    }

    // Locks the entry's current queue and runs `f` with both locked, retrying if
    // the entry moved in between.
    fn with_placement<R>(
        &self,
        entry: &TimeoutEntry<K>,
        f: impl FnOnce(&TimeoutQueue<K>, &mut QueueInner<K>, &mut EntryState) -> R,
    ) -> Option<R> {
        loop {
            let id = entry.queue()?;
            let q = self.queue(id)?;
            let mut inner = q.inner.lock();
            let mut state = entry.state.lock();
            if state.queue == Some(id) {
                return Some(f(&q, &mut inner, &mut state));
            }
        }
    }

    /// Moves the entry to the tail of its queue and restarts its ttl.
    /// Returns false for an entry that is not queued.
    pub fn touch(&self, entry: &Arc<TimeoutEntry<K>>, now: Tick) -> bool {
        self.with_placement(entry, |q, inner, state| {
            inner.list.unlink(state.node);
            state.node = inner.list.push_back(entry.clone());
            state.die = now + q.ttl();
            state.touched = now;
        })
        .is_some()
    }

    /// Moves the entry from `from` to the tail of `to`.
    ///
    /// Returns false if the entry is not in `from`. A queue pending deletion
    /// takes no new entries.
    pub fn move_entry(
        &self,
        entry: &Arc<TimeoutEntry<K>>,
        from: QueueId,
        to: QueueId,
        now: Tick,
    ) -> Result<bool> {
        if from == to {
            return Ok(self.touch(entry, now));
        }
        let target = self.queue(to).ok_or(Error::QueueBusy)?;
        if target.inner.lock().pending_delete {
            return Err(Error::QueueBusy);
        }
        let Some(source) = self.queue(from) else {
            return Ok(false);
        };
        {
            let mut inner = source.inner.lock();
            let mut state = entry.state.lock();
            if state.queue != Some(from) {
                return Ok(false);
            }
            inner.list.unlink(state.node);
            state.queue = None;
        }
        let mut inner = target.inner.lock();
        let node = inner.list.push_back(entry.clone());
        let mut state = entry.state.lock();
        state.queue = Some(to);
        state.node = node;
        state.die = now + target.ttl();
        state.touched = now;
        Ok(true)
    }

    /// Unlinks the entry from whatever queue holds it.
    pub fn remove(&self, entry: &Arc<TimeoutEntry<K>>) -> bool {
        self.with_placement(entry, |_, inner, state| {
            inner.list.unlink(state.node);
            state.queue = None;
        })
        .is_some()
    }

    /// Pops every entry with `die <= now` off the queue heads, then frees user
    /// queues that are pending deletion, unreferenced and empty.
    pub fn expire(&self, now: Tick) -> Vec<Arc<TimeoutEntry<K>>> {
        let queues: Vec<_> = self.queues.read().iter().flatten().cloned().collect();
        let mut expired = Vec::new();
        for q in &queues {
            let mut inner = q.inner.lock();
            while let Some((node, entry)) = inner.list.front() {
                let entry = entry.clone();
                let mut state = entry.state.lock();
                if state.die > now {
                    break;
                }
                state.queue = None;
                drop(state);
                inner.list.unlink(node);
                expired.push(entry);
            }
        }
        if !expired.is_empty() {
            trace!(count = expired.len(), now, "expired timeout entries");
        }

        let mut slots = self.queues.write();
        for slot in slots.iter_mut() {
            let free = slot.as_ref().map_or(false, |q| {
                let inner = q.inner.lock();
                q.kind == QueueKind::User && inner.pending_delete && inner.refs == 0 && inner.list.len == 0
            });
            if free {
                if let Some(q) = slot.take() {
                    debug!(id = ?q.id, "freed timeout queue");
                }
            }
        }
        expired
    }

    /// Frees a queue right away. Fails while it has references or entries.
    pub fn delete_queue(&self, id: QueueId) -> Result<()> {
        let mut slots = self.queues.write();
        let Some(q) = slots.get(id.0).cloned().flatten() else {
            return Ok(());
        };
        {
            let inner = q.inner.lock();
            if inner.refs > 0 || inner.list.len > 0 {
                return Err(Error::QueueBusy);
            }
        }
        slots[id.0] = None;
        Ok(())
    }

    pub fn stats(&self) -> Vec<QueueStats> {
        self.queues
            .read()
            .iter()
            .flatten()
            .map(|q| {
                let inner = q.inner.lock();
                QueueStats {
                    id: q.id,
                    ttl: q.ttl(),
                    refs: inner.refs,
                    entries: inner.list.len,
                    user: q.kind == QueueKind::User,
                    pending_delete: inner.pending_delete,
                }
            })
            .collect()
    }

    /// Number of queues currently allocated.
    pub fn queue_count(&self) -> usize {
        self.queues.read().iter().flatten().count()
    }
}
