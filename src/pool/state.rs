//! Pool state machine.
//!
//! `PoolState` owns every pool map (subscribers, open table, queue buckets,
//! timers) and is only ever touched by the pool worker, one transition at a
//! time. Transitions never perform I/O: opening and closing resources is
//! expressed as `Effect`s that the worker executes afterwards.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::{PoolConfig, MAX_IDLE_WINDOW};
use crate::key::Key;
use crate::resource::ResourceError;

use super::listener::{LastValue, Listener, ListenerId};
use super::queue::{AdmissionQueue, EnqueueOutcome, Priority};
use super::stats::{PoolCounters, PoolStats};
use super::timers::{TimerKind, TimerQueue, TimerToken};

pub(crate) type ValueCache = Arc<RwLock<HashMap<Key, LastValue>>>;

/// Work the worker must carry out after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Effect {
    Open { key: Key },
    Close { key: Key },
}

#[derive(Debug, Clone, Copy)]
struct Opening {
    attempt: u32,
}

pub(crate) struct PoolState {
    cfg: PoolConfig,
    subscribers: HashMap<Key, HashMap<ListenerId, Listener>>,
    last_used: HashMap<Key, Instant>,
    warm_until: HashMap<Key, Instant>,
    /// Open resources and when they were opened.
    open: HashMap<Key, Instant>,
    opening: HashMap<Key, Opening>,
    queue: AdmissionQueue,
    timers: TimerQueue,
    idle_timers: HashMap<Key, TimerToken>,
    redeliver_timers: HashMap<(Key, ListenerId), TimerToken>,
    cache: ValueCache,
    effects: Vec<Effect>,
    counters: PoolCounters,
    stale_requeues: u64,
    blocked_on: Option<Key>,
}

impl PoolState {
    pub fn new(cfg: PoolConfig, cache: ValueCache) -> Self {
        let queue = AdmissionQueue::new(cfg.queue_capacity);
        Self {
            cfg,
            subscribers: HashMap::new(),
            last_used: HashMap::new(),
            warm_until: HashMap::new(),
            open: HashMap::new(),
            opening: HashMap::new(),
            queue,
            timers: TimerQueue::default(),
            idle_timers: HashMap::new(),
            redeliver_timers: HashMap::new(),
            cache,
            effects: Vec::new(),
            counters: PoolCounters::default(),
            stale_requeues: 0,
            blocked_on: None,
        }
    }

    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn subscribe(&mut self, key: Key, listener: Listener, replay: bool, now: Instant) {
        let set = self.subscribers.entry(key.clone()).or_default();
        if set.contains_key(&listener.id()) {
            return;
        }
        set.insert(listener.id(), listener.clone());

        self.last_used.insert(key.clone(), now);
        self.warm_until.remove(&key);
        if let Some(token) = self.idle_timers.remove(&key) {
            self.timers.cancel(token);
            debug!(key = %key, "idle close cancelled by re-subscribe");
        }

        if replay {
            if let Some(last) = self.cached(&key) {
                self.deliver(&listener, &last);
            }
        }

        if !self.is_open_or_opening(&key) {
            self.request_open(key, Priority::Hot, now, 0);
        }
    }

    pub fn unsubscribe(&mut self, key: &Key, listener: ListenerId, now: Instant) {
        let Some(set) = self.subscribers.get_mut(key) else {
            return;
        };
        if set.remove(&listener).is_none() {
            return;
        }
        if let Some(token) = self.redeliver_timers.remove(&(key.clone(), listener)) {
            self.timers.cancel(token);
        }
        if !set.is_empty() {
            return;
        }

        self.subscribers.remove(key);
        let deadline = self.idle_deadline(now);
        self.warm_until.insert(key.clone(), deadline);
        self.schedule_idle_close(key, deadline);
        debug!(key = %key, "last subscriber left; key is warm");
    }

    /// Warms `key` for one idle window: it is opened at `Warm` priority and
    /// closed again if nobody subscribes before the window ends.
    pub fn prefetch(&mut self, key: Key, now: Instant) {
        if self.is_open_or_opening(&key) || self.has_subscribers(&key) {
            return;
        }
        let deadline = self.idle_deadline(now);
        self.warm_until.insert(key.clone(), deadline);
        self.schedule_idle_close(&key, deadline);
        self.request_open(key, Priority::Warm, now, 0);
    }

    pub fn redeliver_after(&mut self, key: Key, listener: ListenerId, deadline: Instant) {
        if !self.subscribers.get(&key).is_some_and(|s| s.contains_key(&listener)) {
            return;
        }
        let token = self.timers.schedule(
            deadline,
            TimerKind::Redeliver {
                key: key.clone(),
                listener,
            },
        );
        if let Some(previous) = self.redeliver_timers.insert((key, listener), token) {
            self.timers.cancel(previous);
        }
    }

    pub fn on_push(&mut self, key: Key, value: String, observed_at: DateTime<Utc>) {
        if !self.is_open_or_opening(&key) {
            debug!(key = %key, "ignoring push for a closed resource");
            return;
        }

        let last = LastValue {
            key: key.clone(),
            value,
            observed_at,
        };
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(key.clone(), last.clone());
        }

        let snapshot: Vec<Listener> = self
            .subscribers
            .get(&key)
            .map(|set| set.values().cloned().collect())
            .unwrap_or_default();
        for listener in &snapshot {
            self.deliver(listener, &last);
        }
    }

    pub fn on_open_completed(&mut self, key: Key, result: Result<(), ResourceError>, now: Instant) {
        let Some(opening) = self.opening.remove(&key) else {
            warn!(key = %key, "open completion for a key that was not opening");
            return;
        };

        match result {
            Ok(()) => {
                self.open.insert(key.clone(), now);
                self.last_used.entry(key.clone()).or_insert(now);
                info!(key = %key, open = self.open.len(), "resource opened");
                if !self.has_subscribers(&key) && !self.idle_timers.contains_key(&key) {
                    let deadline = self.idle_deadline(now);
                    self.schedule_idle_close(&key, deadline);
                }
            }
            Err(err) => {
                self.counters.open_failures += 1;
                self.purge_cached(&key);
                if self.has_subscribers(&key) && opening.attempt < self.cfg.max_open_retries {
                    warn!(key = %key, attempt = opening.attempt + 1, error = %err, "resource open failed; retrying");
                    self.request_open(key, Priority::Warm, now, opening.attempt + 1);
                } else {
                    warn!(key = %key, attempt = opening.attempt + 1, error = %err, "resource open failed; giving up");
                    if !self.has_subscribers(&key) && !self.idle_timers.contains_key(&key) {
                        self.forget(&key);
                    }
                }
            }
        }
    }

    pub fn fire_due_timers(&mut self, now: Instant) {
        for (token, kind) in self.timers.pop_due(now) {
            match kind {
                TimerKind::IdleClose { key } => {
                    if self.idle_timers.get(&key) != Some(&token) {
                        continue;
                    }
                    self.idle_timers.remove(&key);
                    self.on_idle_expired(&key);
                }
                TimerKind::Redeliver { key, listener } => {
                    self.redeliver_timers.remove(&(key.clone(), listener));
                    let target = self.subscribers.get(&key).and_then(|s| s.get(&listener)).cloned();
                    if let (Some(target), Some(last)) = (target, self.cached(&key)) {
                        self.deliver(&target, &last);
                    }
                }
            }
        }
    }

    /// Starts queued opens while concurrency allows.
    pub fn drain(&mut self, now: Instant) {
        while self.opening.len() < self.cfg.open_concurrency {
            let Some(entry) = self.queue.pop_next() else {
                break;
            };
            if self.is_open_or_opening(&entry.key) {
                continue;
            }

            let current = self.classify(&entry.key, now);
            if !entry.urgent && current == Priority::Cold {
                self.counters.cancelled_jobs += 1;
                debug!(key = %entry.key, "queued open cancelled; key went cold");
                continue;
            }

            if now.saturating_duration_since(entry.enqueued_at) > self.cfg.queue_timeout {
                self.stale_requeues += 1;
                debug!(key = %entry.key, "queued open timed out; re-enqueueing at hot");
                let key = entry.key.clone();
                if self.queue.requeue_hot(entry, now) == EnqueueOutcome::Dropped {
                    self.counters.dropped_enqueues += 1;
                    warn!(key = %key, "admission queue full; stale open dropped");
                }
                continue;
            }

            if !self.make_room(&entry.key) {
                self.queue.restore_front(entry);
                break;
            }

            debug!(key = %entry.key, priority = ?entry.priority, current = ?current, "starting open");
            self.opening.insert(entry.key.clone(), Opening { attempt: entry.attempt });
            self.effects.push(Effect::Open { key: entry.key });
        }
    }

    /// Closes every resource and forgets all state.
    pub fn shutdown(&mut self) {
        let mut keys: Vec<Key> = self.open.keys().chain(self.opening.keys()).cloned().collect();
        keys.sort();
        for key in keys {
            self.effects.push(Effect::Close { key });
        }
        self.open.clear();
        self.opening.clear();
        self.subscribers.clear();
        self.idle_timers.clear();
        self.redeliver_timers.clear();
        self.timers = TimerQueue::default();
        while self.queue.pop_next().is_some() {}
        if let Ok(mut cache) = self.cache.write() {
            cache.clear();
        }
    }

    pub fn stats(&self, dropped_pushes: u64) -> PoolStats {
        let mut open_keys: Vec<Key> = self.open.keys().cloned().collect();
        open_keys.sort();
        let cached_value_count = self.cache.read().map(|c| c.len()).unwrap_or(0);
        PoolStats {
            open_count: self.open.len(),
            opening_count: self.opening.len(),
            queued_count: self.queue.len(),
            subscriber_count: self.subscribers.values().map(HashMap::len).sum(),
            subscribed_key_count: self.subscribers.len(),
            cached_value_count,
            open_keys,
            dropped_enqueues: self.counters.dropped_enqueues,
            dropped_pushes,
            cancelled_jobs: self.counters.cancelled_jobs,
            evictions: self.counters.evictions,
            idle_closes: self.counters.idle_closes,
            open_failures: self.counters.open_failures,
            refused_opens: self.counters.refused_opens,
            listener_panics: self.counters.listener_panics,
            stale_requeues: self.stale_requeues,
        }
    }

    fn classify(&self, key: &Key, now: Instant) -> Priority {
        if self.has_subscribers(key) {
            Priority::Hot
        } else if self.warm_until.get(key).is_some_and(|until| *until > now) {
            Priority::Warm
        } else {
            Priority::Cold
        }
    }

    fn request_open(&mut self, key: Key, priority: Priority, now: Instant, attempt: u32) {
        match self.queue.enqueue(key.clone(), priority, now, attempt) {
            EnqueueOutcome::Queued => debug!(key = %key, priority = ?priority, "open queued"),
            EnqueueOutcome::Promoted { from } => {
                debug!(key = %key, from = ?from, to = ?priority, "queued open promoted");
            }
            EnqueueOutcome::AlreadyQueued => {}
            EnqueueOutcome::Dropped => {
                self.counters.dropped_enqueues += 1;
                warn!(key = %key, capacity = self.cfg.queue_capacity, "admission queue full; open request dropped");
            }
        }
    }

    /// Evicts idle resources until `key` fits under the capacity ceiling.
    /// Returns false when nothing can be evicted.
    fn make_room(&mut self, key: &Key) -> bool {
        while self.open.len() + self.opening.len() >= self.cfg.max_open_resources {
            let Some(victim) = self.eviction_victim() else {
                if self.blocked_on.as_ref() != Some(key) {
                    self.counters.refused_opens += 1;
                    warn!(
                        key = %key,
                        open = self.open.len(),
                        capacity = self.cfg.max_open_resources,
                        "capacity reached and every open resource is subscribed; open deferred"
                    );
                    self.blocked_on = Some(key.clone());
                }
                return false;
            };
            self.counters.evictions += 1;
            info!(evicted = %victim, for_key = %key, "evicting least recently used resource");
            self.close_resource(&victim);
        }
        self.blocked_on = None;
        true
    }

    /// The unsubscribed open key with the oldest `last_used`.
    fn eviction_victim(&self) -> Option<Key> {
        self.open
            .keys()
            .filter(|k| !self.has_subscribers(k))
            .min_by_key(|k| (self.last_used.get(*k).copied(), *k))
            .cloned()
    }

    fn on_idle_expired(&mut self, key: &Key) {
        if self.has_subscribers(key) {
            return;
        }
        if self.open.contains_key(key) {
            self.counters.idle_closes += 1;
            info!(key = %key, "idle window elapsed; closing resource");
            self.close_resource(key);
            return;
        }
        if self.opening.contains_key(key) {
            // The completion schedules its own idle close.
            return;
        }
        if self.queue.remove(key).is_some() {
            self.counters.cancelled_jobs += 1;
            debug!(key = %key, "idle window elapsed before admission; queued open cancelled");
        }
        self.forget(key);
    }

    /// Drops the bookkeeping of a key that is neither open, opening nor subscribed.
    fn forget(&mut self, key: &Key) {
        self.warm_until.remove(key);
        self.last_used.remove(key);
    }

    fn idle_deadline(&self, now: Instant) -> Instant {
        now.checked_add(self.cfg.idle_window.min(MAX_IDLE_WINDOW)).unwrap_or(now)
    }

    fn close_resource(&mut self, key: &Key) {
        self.open.remove(key);
        self.purge_cached(key);
        if let Some(token) = self.idle_timers.remove(key) {
            self.timers.cancel(token);
        }
        self.warm_until.remove(key);
        if !self.has_subscribers(key) {
            self.last_used.remove(key);
        }
        self.effects.push(Effect::Close { key: key.clone() });
    }

    fn schedule_idle_close(&mut self, key: &Key, deadline: Instant) {
        let token = self.timers.schedule(deadline, TimerKind::IdleClose { key: key.clone() });
        if let Some(previous) = self.idle_timers.insert(key.clone(), token) {
            self.timers.cancel(previous);
        }
    }

    fn deliver(&mut self, listener: &Listener, last: &LastValue) {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            listener.notify(&last.key, &last.value, last.observed_at);
        }));
        if outcome.is_err() {
            self.counters.listener_panics += 1;
            warn!(key = %last.key, listener = ?listener.id(), "listener panicked during fanout");
        }
    }

    fn cached(&self, key: &Key) -> Option<LastValue> {
        self.cache.read().ok()?.get(key).cloned()
    }

    fn purge_cached(&mut self, key: &Key) {
        if let Ok(mut cache) = self.cache.write() {
            cache.remove(key);
        }
    }

    fn has_subscribers(&self, key: &Key) -> bool {
        self.subscribers.get(key).is_some_and(|s| !s.is_empty())
    }

    fn is_open_or_opening(&self, key: &Key) -> bool {
        self.open.contains_key(key) || self.opening.contains_key(key)
    }

    #[cfg(test)]
    pub(crate) fn queued_priority(&self, key: &Key) -> Option<Priority> {
        self.queue.priority_of(key)
    }

    /// Sizes of the per-key recency and warmth maps.
    #[cfg(test)]
    pub(crate) fn tracked_keys(&self) -> (usize, usize) {
        (self.last_used.len(), self.warm_until.len())
    }
}
