//! Keyed resource pool.
//!
//! The pool keeps at most one open resource per key, fans every push out to
//! the key's listeners, admits opens through a three-bucket priority queue
//! under a concurrency ceiling, and evicts idle resources (LRU) under a
//! capacity ceiling.
//!
//! All pool state lives on one worker thread. The public operations below
//! only enqueue control messages, so none of them block on resource I/O and
//! none of them return errors; they are fire-and-forget.

/// Pool state machine (admission, eviction, fanout).
mod state;
/// Listener identity and cached values.
pub mod listener;
/// Admission queue priorities.
pub mod queue;
/// Observability snapshot.
pub mod stats;
/// Cancellable deadline timers.
mod timers;
/// Pool worker and opener workers.
pub(crate) mod worker;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Sender};
use tracing::debug;

use crate::config::PoolConfig;
use crate::error::{ExecutionError, QuoteError, QuoteResult};
use crate::key::Key;
use crate::resource::ResourceOpener;

pub use listener::{LastValue, Listener, ListenerId};
pub use queue::Priority;
pub use stats::PoolStats;

use self::state::{PoolState, ValueCache};
use self::worker::{worker_loop, ControlMsg, EventMsg, OpenerPool, WorkerContext};

/// A keyed pool of expensive resources with multi-subscriber fanout.
///
/// Share it between sessions with `Arc`. Dropping the last handle shuts the
/// pool down and closes every open resource.
#[derive(Debug)]
pub struct KeyedResourcePool {
    control_tx: Sender<ControlMsg>,
    cache: ValueCache,
    dropped_pushes: Arc<AtomicU64>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl KeyedResourcePool {
    /// Starts a pool backed by `opener`.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an unusable config, or
    /// `ExecutionError::WorkerSpawn` if a thread cannot be started.
    pub fn new(cfg: PoolConfig, opener: Arc<dyn ResourceOpener>) -> QuoteResult<Self> {
        cfg.validate()?;

        let (control_tx, control_rx) = unbounded::<ControlMsg>();
        let (events_tx, events_rx) = bounded::<EventMsg>(cfg.push_queue_capacity);

        let cache = ValueCache::default();
        let dropped_pushes = Arc::new(AtomicU64::new(0));

        let openers = OpenerPool::start(
            cfg.open_concurrency,
            Arc::clone(&opener),
            events_tx.clone(),
            Arc::clone(&dropped_pushes),
        )?;

        let ctx = WorkerContext {
            state: PoolState::new(cfg.clone(), Arc::clone(&cache)),
            cfg,
            opener,
            openers,
            dropped_pushes: Arc::clone(&dropped_pushes),
            events_tx,
        };

        let worker = thread::Builder::new()
            .name("quotepool-worker".to_string())
            .spawn(move || worker_loop(ctx, control_rx, events_rx))
            .map_err(|e| {
                QuoteError::Execution(ExecutionError::WorkerSpawn {
                    name: "quotepool-worker".to_string(),
                    message: e.to_string(),
                })
            })?;

        Ok(Self {
            control_tx,
            cache,
            dropped_pushes,
            worker_id: worker.thread().id(),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Registers `listener` for pushes on `key`, opening the resource if needed.
    ///
    /// Registering the same listener twice for a key is a no-op.
    pub fn subscribe(&self, key: &Key, listener: &Listener) {
        self.send(ControlMsg::Subscribe {
            key: key.clone(),
            listener: listener.clone(),
            replay: false,
        });
    }

    /// Like [`subscribe`](Self::subscribe), and also delivers the cached value
    /// (if any) to this listener, ordered before any later live push.
    pub fn subscribe_with_replay(&self, key: &Key, listener: &Listener) {
        self.send(ControlMsg::Subscribe {
            key: key.clone(),
            listener: listener.clone(),
            replay: true,
        });
    }

    /// Removes `listener` from `key`. Unknown keys and listeners are ignored.
    ///
    /// When the last listener leaves, the resource stays open for the idle
    /// window and is closed afterwards unless someone re-subscribes.
    pub fn unsubscribe(&self, key: &Key, listener: &Listener) {
        self.send(ControlMsg::Unsubscribe {
            key: key.clone(),
            listener: listener.id(),
        });
    }

    /// Opens `key` ahead of demand, keeping it warm for one idle window.
    pub fn prefetch(&self, key: &Key) {
        self.send(ControlMsg::Prefetch { key: key.clone() });
    }

    /// Re-delivers the cached value of `key` to `listener` after `delay`, if
    /// the listener is still subscribed then.
    pub fn redeliver_after(&self, key: &Key, listener: &Listener, delay: Duration) {
        self.send(ControlMsg::Redeliver {
            key: key.clone(),
            listener: listener.id(),
            delay,
        });
    }

    /// The last value pushed for `key`, if its resource is open and has pushed.
    ///
    /// Never blocks on the worker and never triggers an open.
    #[must_use]
    pub fn get_last_value(&self, key: &Key) -> Option<LastValue> {
        self.cache.read().ok()?.get(key).cloned()
    }

    /// A consistent snapshot of the pool, taken on the worker.
    ///
    /// Returns an empty snapshot (only `dropped_pushes` filled in) once the
    /// pool has shut down, or when called from a listener, since listeners
    /// run on the worker and it cannot answer itself.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        if self.on_worker() {
            debug!("stats requested from the pool worker; returning partial snapshot");
            return self.fallback_stats();
        }
        let (reply_tx, reply_rx) = bounded::<PoolStats>(1);
        if self.control_tx.send(ControlMsg::Stats { reply: reply_tx }).is_ok() {
            if let Ok(stats) = reply_rx.recv() {
                return stats;
            }
        }
        self.fallback_stats()
    }

    /// Closes every resource and stops the worker. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.control_tx.send(ControlMsg::Shutdown);
        let handle = match self.worker.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            // A listener may drop the last pool handle from the worker itself.
            if !self.on_worker() {
                let _ = handle.join();
            }
        }
    }

    fn on_worker(&self) -> bool {
        thread::current().id() == self.worker_id
    }

    fn fallback_stats(&self) -> PoolStats {
        PoolStats {
            dropped_pushes: self.dropped_pushes.load(Ordering::Relaxed),
            ..PoolStats::default()
        }
    }

    fn send(&self, msg: ControlMsg) {
        if self.control_tx.send(msg).is_err() {
            debug!("pool worker stopped; control message discarded");
        }
    }
}

impl Drop for KeyedResourcePool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
