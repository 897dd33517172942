//! Tokio bridge for `StreamSession`.

use std::time::Duration;

use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use super::reconciler::QuoteEvent;
use super::stream::StreamSession;

/// How often the bridge checks whether the async consumer went away.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

impl StreamSession {
    /// Moves the session onto a blocking task and exposes its events as a
    /// `Stream`.
    ///
    /// The session is torn down when the returned stream is dropped (noticed
    /// within one poll interval) or when the session closes. Must be called
    /// from within a Tokio runtime.
    #[must_use]
    pub fn into_stream(self, buffer: usize) -> ReceiverStream<QuoteEvent> {
        let (tx, rx) = tokio::sync::mpsc::channel::<QuoteEvent>(buffer.max(1));
        let session_id = self.session_id();

        tokio::task::spawn_blocking(move || {
            loop {
                match self.recv_timeout(POLL_INTERVAL) {
                    Ok(event) => {
                        if tx.blocking_send(event).is_err() {
                            break;
                        }
                    }
                    Err(err) if err.is_disconnected() => break,
                    Err(_) => {
                        // Timeout: stop once the consumer is gone.
                        if tx.is_closed() || self.is_closed() {
                            break;
                        }
                    }
                }
            }
            debug!(session_id = %session_id, "async bridge finished");
            self.close();
        });

        ReceiverStream::new(rx)
    }
}
