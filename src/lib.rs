//! # quotepool - Shared resource pool for live quote streams
//!
//! quotepool multiplexes many client streams onto a small number of expensive
//! upstream resources (browser pages, socket feeds, scrapers), one per tracked
//! key. Resources are opened on demand under a concurrency ceiling, shared
//! by every interested client, and closed after an idle window or evicted
//! (least recently used) under a capacity ceiling.
//!
//! ## Core Concepts
//!
//! - **Key**: a normalized identifier of a tracked quantity (e.g. `AAPL`)
//! - **Resource**: an opened upstream channel that pushes values for one key
//! - **`KeyedResourcePool`**: owns resources, admits opens by priority
//!   (Hot/Warm/Cold), fans pushes out to listeners, caches the last value
//! - **`StreamSession`**: one client's ordered event stream; its
//!   `SubscriptionReconciler` keeps pool subscriptions equal to the client's
//!   interest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use quotepool::{ClientId, Key, KeyedResourcePool, PoolConfig, SessionConfig, StreamSession};
//!
//! let pool = Arc::new(KeyedResourcePool::new(PoolConfig::default(), Arc::new(MyOpener))?);
//! let session = StreamSession::open(pool, ClientId::parse("web-1")?, SessionConfig::default())?;
//! session.declare_initial_interest([Key::parse("aapl")?, Key::parse("msft")?])?;
//!
//! while let Ok(event) = session.recv() {
//!     println!("{} {} @ {}", event.key, event.value, event.observed_at);
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod key;
pub mod resource;

pub mod pool;
pub mod request;
pub mod session;

pub use config::{PoolConfig, SessionConfig, MAX_IDLE_WINDOW, MAX_REDELIVER_DELAY};
pub use error::{ExecutionError, QuoteError, QuoteResult, ValidationError};
pub use key::{ClientId, Key, SessionId, MAX_CLIENT_ID_LEN, MAX_KEY_LEN};
pub use pool::{KeyedResourcePool, LastValue, Listener, ListenerId, PoolStats, Priority};
pub use request::{InterestAction, InterestChange, InterestOp, StreamRequest, ValidatedStreamRequest};
pub use resource::{PushSink, ResourceError, ResourceOpener};
pub use session::{InterestHandle, QuoteEvent, StreamSession, SubscriptionReconciler, SubscriptionTarget};
