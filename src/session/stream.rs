//! Client-facing stream session.
//!
//! A `StreamSession` forwards pool values for its client's keys of interest
//! and releases every subscription on close or drop. `InterestHandle` lets
//! another thread change that interest.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, TryRecvError};
use tracing::info;

use crate::config::SessionConfig;
use crate::error::{QuoteError, QuoteResult};
use crate::key::{ClientId, Key, SessionId};
use crate::pool::KeyedResourcePool;
use crate::request::InterestOp;

use super::reconciler::{QuoteEvent, SubscriptionReconciler, SubscriptionTarget};

const STREAM_PATH: &str = "stream_session";

/// Cloneable handle for changing a session's interest from another thread.
///
/// Operations after the session has been torn down are no-ops.
#[derive(Debug, Clone)]
pub struct InterestHandle {
    reconciler: Arc<SubscriptionReconciler>,
}

impl InterestHandle {
    /// Adds one key.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::TooManyKeys` past the session's key limit.
    pub fn add_interest(&self, key: &Key) -> QuoteResult<()> {
        self.reconciler.add_interest(key)
    }

    /// Removes one key.
    pub fn remove_interest(&self, key: &Key) {
        self.reconciler.remove_interest(key);
    }

    /// Replaces the whole interest set.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::TooManyKeys` past the session's key limit.
    pub fn declare_initial_interest<I>(&self, keys: I) -> QuoteResult<()>
    where
        I: IntoIterator<Item = Key>,
    {
        self.reconciler.declare_initial_interest(keys)
    }

    /// Applies a validated interest change.
    ///
    /// # Errors
    ///
    /// See [`InterestHandle::add_interest`].
    pub fn apply(&self, op: &InterestOp) -> QuoteResult<()> {
        match op {
            InterestOp::Add(key) => self.add_interest(key),
            InterestOp::Remove(key) => {
                self.remove_interest(key);
                Ok(())
            }
        }
    }
}

/// A long-lived per-client stream of quote events.
///
/// Values for every key of interest arrive in order per key. Dropping the
/// session tears it down: all of its pool subscriptions are released.
#[derive(Debug)]
pub struct StreamSession {
    session_id: SessionId,
    reconciler: Arc<SubscriptionReconciler>,
    rx: Receiver<QuoteEvent>,
}

impl StreamSession {
    /// Opens a session against `pool`.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an unusable `config`.
    pub fn open(pool: Arc<KeyedResourcePool>, client_id: ClientId, config: SessionConfig) -> QuoteResult<Self> {
        Self::with_target(pool, client_id, config)
    }

    /// Opens a session against any subscription target.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an unusable `config`.
    pub fn with_target(
        target: Arc<dyn SubscriptionTarget>,
        client_id: ClientId,
        config: SessionConfig,
    ) -> QuoteResult<Self> {
        config.validate()?;
        let (tx, rx) = unbounded::<QuoteEvent>();
        let session_id = SessionId::new();
        info!(session_id = %session_id, client_id = %client_id, "session opened");
        Ok(Self {
            session_id,
            reconciler: Arc::new(SubscriptionReconciler::new(client_id, target, config, tx)),
            rx,
        })
    }

    /// Unique id of this session.
    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// The client this session belongs to.
    #[must_use]
    pub fn client_id(&self) -> &ClientId {
        self.reconciler.client_id()
    }

    /// Snapshot of the keys this client currently wants.
    #[must_use]
    pub fn interest(&self) -> BTreeSet<Key> {
        self.reconciler.interest()
    }

    /// Snapshot of the keys currently subscribed in the pool.
    #[must_use]
    pub fn active_keys(&self) -> BTreeSet<Key> {
        self.reconciler.active_keys()
    }

    /// A handle for mutating interest from another thread.
    #[must_use]
    pub fn interest_handle(&self) -> InterestHandle {
        InterestHandle {
            reconciler: Arc::clone(&self.reconciler),
        }
    }

    /// See [`InterestHandle::add_interest`].
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::TooManyKeys` past the session's key limit.
    pub fn add_interest(&self, key: &Key) -> QuoteResult<()> {
        self.reconciler.add_interest(key)
    }

    /// See [`InterestHandle::remove_interest`].
    pub fn remove_interest(&self, key: &Key) {
        self.reconciler.remove_interest(key);
    }

    /// See [`InterestHandle::declare_initial_interest`].
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::TooManyKeys` past the session's key limit.
    pub fn declare_initial_interest<I>(&self, keys: I) -> QuoteResult<()>
    where
        I: IntoIterator<Item = Key>,
    {
        self.reconciler.declare_initial_interest(keys)
    }

    /// Receive the next event (blocking).
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::Disconnected` once the session is closed and
    /// every already-forwarded event has been received.
    pub fn recv(&self) -> QuoteResult<QuoteEvent> {
        self.rx.recv().map_err(|_| QuoteError::disconnected(STREAM_PATH))
    }

    /// Receive the next event with a timeout.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::Timeout` or `ExecutionError::Disconnected`.
    pub fn recv_timeout(&self, timeout: Duration) -> QuoteResult<QuoteEvent> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => QuoteError::timeout(timeout),
            RecvTimeoutError::Disconnected => QuoteError::disconnected(STREAM_PATH),
        })
    }

    /// Receive an event if one is ready.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::Disconnected` once the session is closed and
    /// drained.
    pub fn try_recv(&self) -> QuoteResult<Option<QuoteEvent>> {
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(QuoteError::disconnected(STREAM_PATH)),
        }
    }

    /// Tears the session down. Idempotent.
    pub fn close(&self) {
        self.reconciler.teardown();
    }

    #[cfg(feature = "async-stream")]
    pub(crate) fn is_closed(&self) -> bool {
        self.reconciler.is_closed()
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.reconciler.teardown();
    }
}
