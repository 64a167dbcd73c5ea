#![cfg(test)]

use std::{sync::Arc, thread};

use super::{QueueId, TimeoutEntry, TimeoutQueues};
use crate::Error;

fn entry(parent: u32) -> Arc<TimeoutEntry<u32>> {
    TimeoutEntry::new(parent, false)
}

#[test]
fn expires_at_touch_plus_ttl() {
    let queues = TimeoutQueues::new();
    let q = queues.create_system_queue(30);
    let e = entry(1);
    queues.insert(&e, q, false, 100).unwrap();
    assert_eq!(e.die(), 130);

    assert!(queues.expire(129).is_empty());
    assert_eq!(e.queue(), Some(q));

    let expired = queues.expire(130);
    assert_eq!(expired.len(), 1);
    assert_eq!(*expired[0].parent(), 1);
    assert_eq!(e.queue(), None);
}

#[test]
fn expiry_is_fifo() {
    let queues = TimeoutQueues::new();
    let q = queues.create_system_queue(10);
    let entries: Vec<_> = (0..4).map(entry).collect();
    for (i, e) in entries.iter().enumerate() {
        queues.insert(e, q, false, i as u64).unwrap();
    }
    let expired: Vec<_> = queues.expire(12).iter().map(|e| *e.parent()).collect();
    assert_eq!(expired, vec![0, 1, 2]);
    assert_eq!(queues.stats()[0].entries, 1);
}

#[test]
fn touch_moves_to_tail() {
    let queues = TimeoutQueues::new();
    let q = queues.create_system_queue(10);
    let (a, b) = (entry(1), entry(2));
    queues.insert(&a, q, false, 0).unwrap();
    queues.insert(&b, q, false, 1).unwrap();
    assert!(queues.touch(&a, 5));
    assert_eq!(a.die(), 15);
    assert_eq!(a.touched(), 5);

    let expired: Vec<_> = queues.expire(11).iter().map(|e| *e.parent()).collect();
    assert_eq!(expired, vec![2]);
    let expired: Vec<_> = queues.expire(15).iter().map(|e| *e.parent()).collect();
    assert_eq!(expired, vec![1]);
}

#[test]
fn touch_of_unqueued_entry() {
    let queues = TimeoutQueues::<u32>::new();
    assert!(!queues.touch(&entry(1), 5));
}

#[test]
fn insert_at_front() {
    let queues = TimeoutQueues::new();
    let q = queues.create_system_queue(10);
    let (a, b) = (entry(1), entry(2));
    queues.insert(&a, q, false, 0).unwrap();
    queues.insert(&b, q, true, 0).unwrap();
    let expired: Vec<_> = queues.expire(10).iter().map(|e| *e.parent()).collect();
    assert_eq!(expired, vec![2, 1]);
}

#[test]
fn move_between_queues() {
    let queues = TimeoutQueues::new();
    let short = queues.create_system_queue(5);
    let long = queues.create_system_queue(50);
    let e = entry(1);
    queues.insert(&e, short, false, 0).unwrap();

    assert!(queues.move_entry(&e, short, long, 2).unwrap());
    assert_eq!(e.queue(), Some(long));
    assert_eq!(e.die(), 52);
    assert!(queues.expire(10).is_empty());

    // stale source
    assert!(!queues.move_entry(&e, short, long, 3).unwrap());
}

#[test]
fn user_queues_are_shared_by_ttl() {
    let queues = TimeoutQueues::<u32>::new();
    let a = queues.get_or_create_queue(20);
    let b = queues.get_or_create_queue(20);
    let c = queues.get_or_create_queue(40);
    assert_eq!(a, b);
    assert_ne!(a, c);

    let stats = queues.stats();
    let shared = stats.iter().find(|s| s.id == a).unwrap();
    assert_eq!(shared.refs, 2);
    assert!(shared.user);
}

#[test]
fn pending_user_queue_is_freed_once_empty() {
    let queues = TimeoutQueues::new();
    let q = queues.get_or_create_queue(10);
    let e = TimeoutEntry::new(7u32, true);
    queues.insert(&e, q, false, 0).unwrap();
    queues.release_queue(q);

    // no new entries while pending
    assert!(matches!(
        queues.insert(&entry(8), q, false, 0),
        Err(Error::QueueBusy)
    ));
    // still holds an entry
    assert!(queues.expire(5).is_empty());
    assert_eq!(queues.queue_count(), 1);

    assert_eq!(queues.expire(10).len(), 1);
    assert_eq!(queues.queue_count(), 0);
}

#[test]
fn pending_queue_is_revived_by_reuse() {
    let queues = TimeoutQueues::<u32>::new();
    let q = queues.get_or_create_queue(10);
    queues.release_queue(q);
    assert_eq!(queues.get_or_create_queue(10), q);
    queues.expire(100);
    assert_eq!(queues.queue_count(), 1);
    assert!(!queues.stats()[0].pending_delete);
}

#[test]
fn system_queues_survive_release() {
    let queues = TimeoutQueues::<u32>::new();
    let q = queues.create_system_queue(10);
    queues.release_queue(q);
    queues.expire(100);
    assert_eq!(queues.queue_count(), 1);
}

#[test]
fn delete_queue_requires_idle_queue() {
    let queues = TimeoutQueues::new();
    let q = queues.get_or_create_queue(10);
    assert!(matches!(queues.delete_queue(q), Err(Error::QueueBusy)));

    queues.release_queue(q);
    let e = entry(1);
    let other = queues.create_system_queue(10);
    queues.insert(&e, other, false, 0).unwrap();
    assert!(matches!(queues.delete_queue(other), Err(Error::QueueBusy)));

    queues.delete_queue(q).unwrap();
    assert_eq!(queues.queue_count(), 1);
    // already gone
    queues.delete_queue(q).unwrap();
}

#[test]
fn remove_unlinks() {
    let queues = TimeoutQueues::new();
    let q = queues.create_system_queue(10);
    let e = entry(1);
    queues.insert(&e, q, false, 0).unwrap();
    assert!(queues.remove(&e));
    assert!(!queues.remove(&e));
    assert!(queues.expire(100).is_empty());
    assert_eq!(queues.stats()[0].entries, 0);
}

#[test]
fn kinds_and_ttl_updates() {
    let queues = TimeoutQueues::<u32>::new();
    let q = queues.create_system_queue(10);
    queues.set_ttl(q, 25);
    assert_eq!(queues.ttl(q), Some(25));
    let e = entry(1);
    queues.insert(&e, q, false, 0).unwrap();
    assert_eq!(e.die(), 25);
    assert!(!queues.stats()[0].user);
    assert_eq!(queues.stats().len(), 1);
}

#[test]
fn queues_are_shared_between_threads() {
    let queues = TimeoutQueues::new();
    let fast = queues.create_system_queue(10);
    let slow = queues.create_system_queue(1000);
    thread::scope(|s| {
        for t in 0..4u32 {
            let queues = &queues;
            s.spawn(move || {
                for i in 0..250 {
                    let e = entry(t * 1000 + i);
                    queues.insert(&e, fast, false, 0).unwrap();
                    if i % 2 == 0 {
                        assert!(queues.move_entry(&e, fast, slow, 0).unwrap());
                    } else {
                        assert!(queues.touch(&e, 5));
                    }
                }
            });
        }
    });

    let entries = |id: QueueId| {
        let stats = queues.stats();
        stats.into_iter().find(|q| q.id == id).unwrap().entries
    };
    assert_eq!((entries(fast), entries(slow)), (500, 500));
    let expired = queues.expire(15);
    assert_eq!(expired.len(), 500);
    assert!(expired.iter().all(|e| *e.parent() % 2 == 1));
    assert_eq!(entries(fast), 0);
}
