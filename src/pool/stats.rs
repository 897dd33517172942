//! Read-only pool snapshot for observability.

use serde::{Deserialize, Serialize};

use crate::key::Key;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PoolCounters {
    pub dropped_enqueues: u64,
    pub cancelled_jobs: u64,
    pub evictions: u64,
    pub idle_closes: u64,
    pub open_failures: u64,
    pub refused_opens: u64,
    pub listener_panics: u64,
}

/// Point-in-time view of a pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Resources currently open.
    pub open_count: usize,
    /// Opens in flight.
    pub opening_count: usize,
    /// Open requests waiting for admission.
    pub queued_count: usize,
    /// Listener registrations across all keys.
    pub subscriber_count: usize,
    /// Keys with at least one listener.
    pub subscribed_key_count: usize,
    /// Keys with a cached last value.
    pub cached_value_count: usize,
    /// Keys with an open resource, sorted.
    pub open_keys: Vec<Key>,
    /// Open requests shed because the queue was full.
    pub dropped_enqueues: u64,
    /// Resource pushes shed because the worker was saturated.
    pub dropped_pushes: u64,
    /// Queued opens cancelled because nobody wanted the key any more.
    pub cancelled_jobs: u64,
    /// Resources closed to make room under the capacity ceiling.
    pub evictions: u64,
    /// Resources closed after their idle window elapsed.
    pub idle_closes: u64,
    /// Opens the opener reported as failed.
    pub open_failures: u64,
    /// Times an open was refused because no resource could be evicted.
    pub refused_opens: u64,
    /// Listener callbacks that panicked during fanout.
    pub listener_panics: u64,
    /// Queued opens that outlived the queue timeout and were re-enqueued at `Hot`.
    pub stale_requeues: u64,
}
