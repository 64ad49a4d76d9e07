//! Message broker collaborator used for liveness probes.
//!
//! The [`Broker`] trait is the only surface the liveness monitor needs from
//! the queueing layer. [`ChannelBroker`] delivers JSON-encoded envelopes
//! over a tokio channel to an in-process consumer.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::{AppError, Result};

/// Command name workers answer with a heartbeat.
pub const STATUS_COMMAND: &str = "_status";

/// Delivery semantics of a published command.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    /// Not persisted; dropped if not consumed before expiration.
    Ephemeral,
}

/// Lightweight "are you alive" request addressed to every worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ProbeMessage {
    /// Command the worker should execute.
    pub command: String,
    /// Delivery semantics.
    pub command_type: CommandType,
    /// When the probe was created.
    pub issued_at: DateTime<Utc>,
}

impl ProbeMessage {
    /// Build a status probe stamped with the current time.
    #[must_use]
    pub fn status() -> Self {
        Self {
            command: STATUS_COMMAND.to_owned(),
            command_type: CommandType::Ephemeral,
            issued_at: Utc::now(),
        }
    }
}

/// A message as handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Routing key the message was published with.
    pub routing_key: String,
    /// Time-to-live in milliseconds.
    pub expiration_ms: u64,
    /// JSON-encoded [`ProbeMessage`].
    pub body: String,
}

/// Publishing side of the message broker.
pub trait Broker: Send + Sync {
    /// Publish `message` under `routing_key` with a time-to-live.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Transport`] if the broker is unreachable.
    fn publish<'a>(
        &'a self,
        message: &'a ProbeMessage,
        routing_key: &'a str,
        expiration_ms: u64,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// In-process broker backed by an unbounded tokio channel.
pub struct ChannelBroker {
    tx: mpsc::UnboundedSender<Envelope>,
    connected: AtomicBool,
}

impl ChannelBroker {
    /// Create a connected broker and the receiving end of its queue.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                connected: AtomicBool::new(true),
            },
            rx,
        )
    }

    /// Drop the connection; publishes fail until [`reconnect`](Self::reconnect).
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Restore the connection.
    pub fn reconnect(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }
}

impl Broker for ChannelBroker {
    fn publish<'a>(
        &'a self,
        message: &'a ProbeMessage,
        routing_key: &'a str,
        expiration_ms: u64,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            if !self.connected.load(Ordering::SeqCst) {
                return Err(AppError::Transport("broker connection is down".into()));
            }
            let envelope = Envelope {
                routing_key: routing_key.to_owned(),
                expiration_ms,
                body: serde_json::to_string(message)?,
            };
            self.tx
                .send(envelope)
                .map_err(|_| AppError::Transport("broker queue closed".into()))?;
            debug!(routing_key, expiration_ms, "published probe");
            Ok(())
        })
    }
}
