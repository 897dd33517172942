//! Per-client stream sessions.
//!
//! A `StreamSession` is the outward, ordered stream of quote events for one
//! client. Its `SubscriptionReconciler` keeps the client's pool subscriptions
//! in line with the keys the client is interested in.

/// Tokio `Stream` adapter.
#[cfg(feature = "async-stream")]
mod async_stream;
/// Desired/active diffing against the pool.
pub mod reconciler;
/// The session handle and its interest handle.
pub mod stream;

pub use reconciler::{QuoteEvent, SubscriptionReconciler, SubscriptionTarget};
pub use stream::{InterestHandle, StreamSession};
