//! Domain event publishing.
//!
//! Producers such as the file watcher hand event names to an
//! [`EventPublisher`] and never wait for consumers.

use tokio::sync::mpsc;
use tracing::warn;

/// Fire-and-forget sink for named domain events.
pub trait EventPublisher: Send + Sync {
    /// Publish `event`. Must not block and must not fail the caller.
    fn publish(&self, event: &str);
}

/// Publisher forwarding event names over an unbounded tokio channel.
#[derive(Clone)]
pub struct ChannelPublisher {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelPublisher {
    /// Create a publisher and the receiving end consumed by the reconciliation loop.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventPublisher for ChannelPublisher {
    fn publish(&self, event: &str) {
        if self.tx.send(event.to_owned()).is_err() {
            warn!(event, "event consumer gone; dropping event");
        }
    }
}
