//! Three-bucket priority admission queue for resource opens.
//!
//! Buckets drain strictly Hot before Warm before Cold, FIFO within a bucket.
//! A key is queued at most once; a more urgent request promotes the existing
//! entry to the head of the more urgent bucket.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::key::Key;

/// Priority class of an open request. Lower is more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// The key has at least one subscriber.
    Hot = 0,
    /// The key lost its last subscriber within the idle window.
    Warm = 1,
    /// No subscriber and outside the idle window.
    Cold = 2,
}

impl Priority {
    const fn bucket(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct QueueEntry {
    pub key: Key,
    /// Priority the entry was requested (or promoted) at.
    pub priority: Priority,
    /// Whether a subscriber asked for this open. Survives stale requeues.
    pub urgent: bool,
    pub enqueued_at: Instant,
    /// Failed opens so far for this request.
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EnqueueOutcome {
    Queued,
    Promoted { from: Priority },
    AlreadyQueued,
    Dropped,
}

#[derive(Debug)]
pub(crate) struct AdmissionQueue {
    buckets: [VecDeque<QueueEntry>; 3],
    queued: HashMap<Key, Priority>,
    capacity: usize,
}

impl AdmissionQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            buckets: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            queued: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }

    #[cfg(test)]
    pub fn contains(&self, key: &Key) -> bool {
        self.queued.contains_key(key)
    }

    #[cfg(test)]
    pub fn priority_of(&self, key: &Key) -> Option<Priority> {
        self.queued.get(key).copied()
    }

    pub fn enqueue(&mut self, key: Key, priority: Priority, now: Instant, attempt: u32) -> EnqueueOutcome {
        if let Some(&current) = self.queued.get(&key) {
            if priority >= current {
                return EnqueueOutcome::AlreadyQueued;
            }
            let Some(mut entry) = self.take_from_bucket(&key, current) else {
                // Index and buckets disagree; rebuild the entry rather than lose it.
                self.queued.remove(&key);
                return self.enqueue(key, priority, now, attempt);
            };
            entry.priority = priority;
            entry.urgent |= priority == Priority::Hot;
            self.queued.insert(key, priority);
            self.buckets[priority.bucket()].push_front(entry);
            return EnqueueOutcome::Promoted { from: current };
        }

        if self.queued.len() >= self.capacity {
            return EnqueueOutcome::Dropped;
        }

        self.queued.insert(key.clone(), priority);
        self.buckets[priority.bucket()].push_back(QueueEntry {
            key,
            priority,
            urgent: priority == Priority::Hot,
            enqueued_at: now,
            attempt,
        });
        EnqueueOutcome::Queued
    }

    /// Re-enqueues a popped entry fresh at the tail of `Hot`, keeping its
    /// `urgent` marker and attempt count.
    pub fn requeue_hot(&mut self, entry: QueueEntry, now: Instant) -> EnqueueOutcome {
        if self.queued.contains_key(&entry.key) {
            return EnqueueOutcome::AlreadyQueued;
        }
        if self.queued.len() >= self.capacity {
            return EnqueueOutcome::Dropped;
        }
        self.queued.insert(entry.key.clone(), Priority::Hot);
        self.buckets[Priority::Hot.bucket()].push_back(QueueEntry {
            priority: Priority::Hot,
            enqueued_at: now,
            ..entry
        });
        EnqueueOutcome::Queued
    }

    /// Puts an entry back at the head of its bucket, bypassing the capacity.
    pub fn restore_front(&mut self, entry: QueueEntry) {
        if self.queued.contains_key(&entry.key) {
            return;
        }
        self.queued.insert(entry.key.clone(), entry.priority);
        self.buckets[entry.priority.bucket()].push_front(entry);
    }

    pub fn pop_next(&mut self) -> Option<QueueEntry> {
        let entry = self.buckets.iter_mut().find_map(VecDeque::pop_front)?;
        self.queued.remove(&entry.key);
        Some(entry)
    }

    pub fn remove(&mut self, key: &Key) -> Option<QueueEntry> {
        let priority = self.queued.remove(key)?;
        self.take_from_bucket(key, priority)
    }

    fn take_from_bucket(&mut self, key: &Key, priority: Priority) -> Option<QueueEntry> {
        let bucket = &mut self.buckets[priority.bucket()];
        let idx = bucket.iter().position(|e| &e.key == key)?;
        bucket.remove(idx)
    }
}
