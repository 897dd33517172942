//! Listener identity and cached values.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::key::Key;

/// Unique identifier for a listener.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListenerId(Uuid);

impl ListenerId {
    /// Create a new random listener id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

type Callback = dyn Fn(&Key, &str, DateTime<Utc>) + Send + Sync + 'static;

/// A push callback registered with the pool.
///
/// Equality is by identity: clones of one `Listener` are the same listener,
/// two listeners built from identical closures are not. One listener may be
/// registered under many keys at once.
///
/// Callbacks run synchronously on the pool worker. Keep them fast (forward
/// into a queue); a panicking callback is isolated and counted.
#[derive(Clone)]
pub struct Listener {
    id: ListenerId,
    callback: Arc<Callback>,
}

impl Listener {
    /// Wraps a callback with a fresh identity.
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&Key, &str, DateTime<Utc>) + Send + Sync + 'static,
    {
        Self {
            id: ListenerId::new(),
            callback: Arc::new(callback),
        }
    }

    /// The identity of this listener.
    #[must_use]
    pub const fn id(&self) -> ListenerId {
        self.id
    }

    pub(crate) fn notify(&self, key: &Key, value: &str, observed_at: DateTime<Utc>) {
        (self.callback)(key, value, observed_at);
    }
}

impl PartialEq for Listener {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Listener {}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener").field("id", &self.id).finish_non_exhaustive()
    }
}

/// The most recent value pushed for a key.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastValue {
    pub key: Key,
    pub value: String,
    pub observed_at: DateTime<Utc>,
}
