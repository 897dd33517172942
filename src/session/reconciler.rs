//! Per-client interest reconciliation.
//!
//! A `SubscriptionReconciler` owns the set of keys one client wants and the
//! set of forwarding listeners it currently holds in the pool. Each interest
//! change mutates the desired set and then diffs desired against active,
//! issuing only the subscribes and unsubscribes the difference needs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::SessionConfig;
use crate::error::{QuoteResult, ValidationError};
use crate::key::{ClientId, Key};
use crate::pool::{KeyedResourcePool, Listener};

/// One value forwarded to a client.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteEvent {
    pub key: Key,
    pub value: String,
    pub observed_at: DateTime<Utc>,
}

/// The pool operations a reconciler drives.
///
/// Implemented by `KeyedResourcePool`; tests substitute a recording fake.
pub trait SubscriptionTarget: Send + Sync {
    /// Subscribe `listener` to `key`, replaying the cached value to it first.
    fn subscribe_with_replay(&self, key: &Key, listener: &Listener);

    /// Remove `listener` from `key`.
    fn unsubscribe(&self, key: &Key, listener: &Listener);

    /// Re-emit the cached value of `key` to `listener` after `delay`.
    fn redeliver_after(&self, key: &Key, listener: &Listener, delay: Duration);
}

impl SubscriptionTarget for KeyedResourcePool {
    fn subscribe_with_replay(&self, key: &Key, listener: &Listener) {
        Self::subscribe_with_replay(self, key, listener);
    }

    fn unsubscribe(&self, key: &Key, listener: &Listener) {
        Self::unsubscribe(self, key, listener);
    }

    fn redeliver_after(&self, key: &Key, listener: &Listener, delay: Duration) {
        Self::redeliver_after(self, key, listener, delay);
    }
}

type Outward = Arc<Mutex<Option<Sender<QuoteEvent>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Keeps one client's pool subscriptions equal to its desired keys.
pub struct SubscriptionReconciler {
    client_id: ClientId,
    target: Arc<dyn SubscriptionTarget>,
    config: SessionConfig,
    desired: Mutex<BTreeSet<Key>>,
    active: Mutex<BTreeMap<Key, Listener>>,
    outward: Outward,
    running: AtomicBool,
    dirty: AtomicBool,
    closed: AtomicBool,
}

impl SubscriptionReconciler {
    /// Creates a reconciler that forwards every received value into `outward`.
    pub fn new(
        client_id: ClientId,
        target: Arc<dyn SubscriptionTarget>,
        config: SessionConfig,
        outward: Sender<QuoteEvent>,
    ) -> Self {
        Self {
            client_id,
            target,
            config,
            desired: Mutex::new(BTreeSet::new()),
            active: Mutex::new(BTreeMap::new()),
            outward: Arc::new(Mutex::new(Some(outward))),
            running: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// The client this reconciler serves.
    #[must_use]
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Whether teardown has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Snapshot of the desired keys.
    #[must_use]
    pub fn interest(&self) -> BTreeSet<Key> {
        lock(&self.desired).clone()
    }

    /// Snapshot of the keys with a live forwarding listener.
    #[must_use]
    pub fn active_keys(&self) -> BTreeSet<Key> {
        lock(&self.active).keys().cloned().collect()
    }

    /// Adds `key` to the desired set and reconciles.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::TooManyKeys` when the key would exceed the
    /// session's interest limit.
    pub fn add_interest(&self, key: &Key) -> QuoteResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        {
            let mut desired = lock(&self.desired);
            if desired.contains(key) {
                return Ok(());
            }
            self.check_limit(desired.len() + 1)?;
            desired.insert(key.clone());
        }
        self.reconcile();
        Ok(())
    }

    /// Removes `key` from the desired set and reconciles.
    pub fn remove_interest(&self, key: &Key) {
        if self.is_closed() {
            return;
        }
        if !lock(&self.desired).remove(key) {
            return;
        }
        self.reconcile();
    }

    /// Replaces the desired set with `keys` and reconciles.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::TooManyKeys` when `keys` exceeds the session's
    /// interest limit; the desired set is left unchanged.
    pub fn declare_initial_interest<I>(&self, keys: I) -> QuoteResult<()>
    where
        I: IntoIterator<Item = Key>,
    {
        if self.is_closed() {
            return Ok(());
        }
        let keys: BTreeSet<Key> = keys.into_iter().collect();
        self.check_limit(keys.len())?;
        *lock(&self.desired) = keys;
        self.reconcile();
        Ok(())
    }

    /// Brings active subscriptions in line with the desired set.
    ///
    /// Calls made while another thread is reconciling are folded into that
    /// pass: it re-reads the desired set before finishing.
    pub fn reconcile(&self) {
        self.dirty.store(true, Ordering::Release);
        loop {
            if self
                .running
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            while self.dirty.swap(false, Ordering::AcqRel) {
                self.reconcile_pass();
            }
            self.running.store(false, Ordering::Release);
            // A caller may have marked dirty after our last swap and bailed
            // out on `running`; pick its change up.
            if !self.dirty.load(Ordering::Acquire) {
                return;
            }
        }
    }

    fn reconcile_pass(&self) {
        let desired = self.interest();
        let mut active = lock(&self.active);
        // Checked under the active lock so no subscribe can follow teardown.
        if self.is_closed() {
            return;
        }

        let stale: Vec<Key> = active.keys().filter(|k| !desired.contains(*k)).cloned().collect();
        for key in stale {
            if let Some(listener) = active.remove(&key) {
                self.target.unsubscribe(&key, &listener);
                debug!(client_id = %self.client_id, key = %key, "interest removed");
            }
        }

        for key in &desired {
            if active.contains_key(key) {
                continue;
            }
            let listener = self.forwarding_listener();
            self.target.subscribe_with_replay(key, &listener);
            active.insert(key.clone(), listener);
            debug!(client_id = %self.client_id, key = %key, "interest added");
        }

        let delay = self.config.effective_redeliver_delay();
        for (key, listener) in active.iter() {
            self.target.redeliver_after(key, listener, delay);
        }
    }

    fn forwarding_listener(&self) -> Listener {
        let outward = Arc::clone(&self.outward);
        Listener::new(move |key, value, observed_at| {
            if let Some(tx) = lock(&outward).as_ref() {
                let _ = tx.send(QuoteEvent {
                    key: key.clone(),
                    value: value.to_string(),
                    observed_at,
                });
            }
        })
    }

    /// Unsubscribes every active key, clears interest and closes the outward
    /// channel. Runs once; later calls return immediately.
    pub fn teardown(&self) {
        let mut active = lock(&self.active);
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let released = active.len();
        for (key, listener) in std::mem::take(&mut *active) {
            self.target.unsubscribe(&key, &listener);
        }
        drop(active);

        lock(&self.desired).clear();
        lock(&self.outward).take();
        info!(client_id = %self.client_id, released, "session torn down");
    }

    fn check_limit(&self, actual: usize) -> Result<(), ValidationError> {
        let max = self.config.max_interest_keys;
        if actual > max {
            return Err(ValidationError::TooManyKeys { max, actual });
        }
        Ok(())
    }
}

impl std::fmt::Debug for SubscriptionReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionReconciler")
            .field("client_id", &self.client_id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    use crossbeam_channel::unbounded;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Subscribe(String),
        Unsubscribe(String),
        Redeliver(String),
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<Call>>,
        inside: AtomicBool,
        overlaps: AtomicUsize,
    }

    impl Recorder {
        fn record(&self, call: Call) {
            if self.inside.swap(true, Ordering::SeqCst) {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            std::thread::yield_now();
            self.calls.lock().unwrap().push(call);
            self.inside.store(false, Ordering::SeqCst);
        }

        fn take(&self) -> Vec<Call> {
            std::mem::take(&mut *self.calls.lock().unwrap())
        }

        fn membership(&self) -> Vec<Call> {
            self.take()
                .into_iter()
                .filter(|c| !matches!(c, Call::Redeliver(_)))
                .collect()
        }
    }

    impl SubscriptionTarget for Recorder {
        fn subscribe_with_replay(&self, key: &Key, _listener: &Listener) {
            self.record(Call::Subscribe(key.to_string()));
        }

        fn unsubscribe(&self, key: &Key, _listener: &Listener) {
            self.record(Call::Unsubscribe(key.to_string()));
        }

        fn redeliver_after(&self, key: &Key, _listener: &Listener, _delay: Duration) {
            self.record(Call::Redeliver(key.to_string()));
        }
    }

    fn key(s: &str) -> Key {
        Key::parse(s).unwrap()
    }

    fn reconciler(max_keys: usize) -> (Arc<Recorder>, SubscriptionReconciler) {
        let recorder = Arc::new(Recorder::default());
        let (tx, _rx) = unbounded();
        let config = SessionConfig {
            max_interest_keys: max_keys,
            ..SessionConfig::default()
        };
        let target: Arc<dyn SubscriptionTarget> = recorder.clone();
        let r = SubscriptionReconciler::new(ClientId::parse("c1").unwrap(), target, config, tx);
        (recorder, r)
    }

    #[test]
    fn diff_is_minimal() {
        let (rec, r) = reconciler(8);
        r.declare_initial_interest([key("A"), key("B")]).unwrap();
        assert_eq!(
            rec.membership(),
            vec![Call::Subscribe("A".into()), Call::Subscribe("B".into())]
        );

        r.declare_initial_interest([key("B"), key("C")]).unwrap();
        assert_eq!(
            rec.membership(),
            vec![Call::Unsubscribe("A".into()), Call::Subscribe("C".into())]
        );
        assert_eq!(r.active_keys(), [key("B"), key("C")].into_iter().collect());
    }

    #[test]
    fn concurrent_changes_converge_without_overlapping_passes() {
        let (rec, r) = reconciler(16);
        let keys: Vec<Key> = ["A", "B", "C", "D", "E"].into_iter().map(key).collect();

        std::thread::scope(|scope| {
            for t in 0..4 {
                let (r, keys) = (&r, &keys);
                scope.spawn(move || {
                    for i in 0..200 {
                        let k = &keys[(t + i) % keys.len()];
                        if (t + i) % 3 == 0 {
                            r.remove_interest(k);
                        } else {
                            r.add_interest(k).unwrap();
                        }
                    }
                });
            }
        });
        r.reconcile();

        assert_eq!(r.active_keys(), r.interest());
        assert_eq!(rec.overlaps.load(Ordering::SeqCst), 0);

        // Per key, membership strictly alternates starting with a subscribe.
        let mut per_key: HashMap<String, Vec<bool>> = HashMap::new();
        for call in rec.membership() {
            match call {
                Call::Subscribe(k) => per_key.entry(k).or_default().push(true),
                Call::Unsubscribe(k) => per_key.entry(k).or_default().push(false),
                Call::Redeliver(_) => {}
            }
        }
        let active = r.active_keys();
        for (k, calls) in &per_key {
            for (i, subscribed) in calls.iter().enumerate() {
                assert_eq!(*subscribed, i % 2 == 0, "{k}: {calls:?}");
            }
            assert_eq!(calls.len() % 2 == 1, active.contains(&key(k)), "{k}: {calls:?}");
        }
        for k in &active {
            assert!(per_key.contains_key(k.as_str()));
        }
    }

    #[test]
    fn reconcile_is_idempotent() {
        let (rec, r) = reconciler(8);
        r.add_interest(&key("A")).unwrap();
        rec.take();
        r.reconcile();
        r.add_interest(&key("A")).unwrap();
        assert!(rec.membership().is_empty());
    }

    #[test]
    fn every_pass_schedules_redelivery_for_active_keys() {
        let (rec, r) = reconciler(8);
        r.declare_initial_interest([key("A"), key("B")]).unwrap();
        let redelivered: Vec<Call> = rec
            .take()
            .into_iter()
            .filter(|c| matches!(c, Call::Redeliver(_)))
            .collect();
        assert_eq!(
            redelivered,
            vec![Call::Redeliver("A".into()), Call::Redeliver("B".into())]
        );
    }

    #[test]
    fn interest_limit_is_enforced() {
        let (rec, r) = reconciler(2);
        r.add_interest(&key("A")).unwrap();
        r.add_interest(&key("B")).unwrap();
        let err = r.add_interest(&key("C")).unwrap_err();
        assert!(err.is_validation());
        // Re-adding a key already desired does not count against the limit.
        r.add_interest(&key("A")).unwrap();

        let err = r
            .declare_initial_interest([key("X"), key("Y"), key("Z")])
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(r.interest(), [key("A"), key("B")].into_iter().collect());
        assert_eq!(
            rec.membership(),
            vec![Call::Subscribe("A".into()), Call::Subscribe("B".into())]
        );
    }

    #[test]
    fn teardown_unsubscribes_everything_once() {
        let (rec, r) = reconciler(8);
        r.declare_initial_interest([key("A"), key("B")]).unwrap();
        rec.take();

        r.teardown();
        r.teardown();
        assert_eq!(
            rec.take(),
            vec![Call::Unsubscribe("A".into()), Call::Unsubscribe("B".into())]
        );
        assert!(r.interest().is_empty());
        assert!(r.active_keys().is_empty());

        // Interest changes after teardown are ignored.
        r.add_interest(&key("C")).unwrap();
        r.remove_interest(&key("A"));
        assert!(rec.take().is_empty());
    }

    #[test]
    fn forwarding_listener_stops_after_teardown() {
        let recorder = Arc::new(Recorder::default());
        let (tx, rx) = unbounded();
        let target: Arc<dyn SubscriptionTarget> = recorder;
        let r = SubscriptionReconciler::new(ClientId::parse("c1").unwrap(), target, SessionConfig::default(), tx);

        let listener = r.forwarding_listener();
        listener.notify(&key("A"), "1", Utc::now());
        assert_eq!(rx.try_recv().unwrap().value, "1");

        r.teardown();
        listener.notify(&key("A"), "2", Utc::now());
        assert!(rx.try_recv().is_err());
        assert!(rx.recv().is_err());
    }
}
