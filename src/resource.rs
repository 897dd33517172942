//! Resource opener contract.
//!
//! A resource is an expensive, stateful external channel (a browser page, a
//! socket feed, a polling scraper) that, once opened for a key, pushes value
//! updates until closed. How a value is extracted is entirely up to the
//! opener; the pool only manages the open/close lifecycle and fans out pushes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Sender, TrySendError};
use thiserror::Error;

use crate::error::{QuoteError, QuoteResult};
use crate::key::Key;
use crate::pool::worker::EventMsg;

/// Errors reported by a `ResourceOpener`.
///
/// The pool treats all of them uniformly as a failed open.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResourceError {
    /// The resource could not be established.
    #[error("Open failed: {0}")]
    OpenFailed(String),

    /// The upstream source is temporarily unavailable.
    #[error("Resource unavailable: {0}")]
    Unavailable(String),

    /// The opener panicked while opening.
    #[error("Opener panicked: {0}")]
    Panicked(String),
}

/// Opens and closes resources on behalf of the pool.
///
/// # Contract
/// - `open` may block for as long as establishing the resource takes; it runs
///   on a dedicated opener worker, never on the pool worker. Once it returns
///   `Ok`, the resource keeps pushing through `sink` until `close` is called.
///   Pushes may also start before `open` returns.
/// - `close` is best-effort and must not block; it is called on the pool
///   worker. Pushes arriving after close are ignored by the pool.
pub trait ResourceOpener: Send + Sync + 'static {
    /// Establishes the resource for `key`.
    fn open(&self, key: &Key, sink: PushSink) -> Result<(), ResourceError>;

    /// Stops the resource for `key`.
    fn close(&self, key: &Key);
}

/// Push handle given to a resource for one key.
///
/// Pushes are queued into the pool worker without blocking; when the worker
/// is saturated the push is dropped and counted.
#[derive(Debug, Clone)]
pub struct PushSink {
    key: Key,
    tx: Sender<EventMsg>,
    dropped: Arc<AtomicU64>,
}

impl PushSink {
    pub(crate) fn new(key: Key, tx: Sender<EventMsg>, dropped: Arc<AtomicU64>) -> Self {
        Self { key, tx, dropped }
    }

    /// The key this sink pushes for.
    #[must_use]
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Pushes a value observed at `observed_at`.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::Disconnected` once the pool has shut down, so
    /// the resource can stop producing.
    pub fn push(&self, value: impl Into<String>, observed_at: DateTime<Utc>) -> QuoteResult<()> {
        let msg = EventMsg::Push {
            key: self.key.clone(),
            value: value.into(),
            observed_at,
        };
        match self.tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => Err(QuoteError::disconnected("pool_events")),
        }
    }

    /// Pushes a value observed now.
    ///
    /// # Errors
    ///
    /// See [`PushSink::push`].
    pub fn push_now(&self, value: impl Into<String>) -> QuoteResult<()> {
        self.push(value, Utc::now())
    }
}
