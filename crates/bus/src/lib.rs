//! Bus client contract for Careline realtime delivery.
//!
//! The relay worker publishes envelopes through [`BusClient::publish`] with a
//! dedupe key, and the streaming gateway opens ordered, replay-capable
//! per-subject subscriptions through [`BusClient::subscribe`]. The production
//! implementation rides NATS JetStream; the in-memory implementation backs
//! tests with the same replay semantics.

mod memory;
mod nats;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;

pub use memory::InMemoryBus;
pub use nats::{NatsBusClient, StreamSpec};

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus publish failed: {0}")]
    Publish(#[source] anyhow::Error),
    #[error("bus subscribe failed: {0}")]
    Subscribe(#[source] anyhow::Error),
}

/// Replay position for a new subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliverPolicy {
    /// Every message retained for the subject, oldest first.
    All,
    /// Only the most recent message per subject, then live delivery.
    LastPerSubject,
    /// Replay starting at the given bus-assigned sequence (inclusive).
    FromSequence(u64),
}

#[derive(Clone, Copy, Debug)]
pub struct SubscribeOptions {
    pub deliver: DeliverPolicy,
}

impl SubscribeOptions {
    pub fn all() -> Self {
        Self {
            deliver: DeliverPolicy::All,
        }
    }

    pub fn last_per_subject() -> Self {
        Self {
            deliver: DeliverPolicy::LastPerSubject,
        }
    }

    pub fn from_sequence(sequence: u64) -> Self {
        Self {
            deliver: DeliverPolicy::FromSequence(sequence),
        }
    }
}

/// Message as observed by a subscription. `sequence` is the bus-assigned
/// position used for transport-level resume; `delivery_tag` is an operator
/// correlation handle, distinct from the publisher's dedupe key.
#[derive(Clone, Debug)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Value,
    pub sequence: u64,
    pub delivery_tag: Option<String>,
}

/// Ordered per-subject message stream with explicit release. Dropping the
/// subscription releases it as well, so scoped acquisition always unwinds.
pub struct BusSubscription {
    messages: BoxStream<'static, Result<BusMessage, BusError>>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl BusSubscription {
    pub fn new(
        messages: BoxStream<'static, Result<BusMessage, BusError>>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            messages,
            release: Some(Box::new(release)),
        }
    }

    pub async fn next(&mut self) -> Option<Result<BusMessage, BusError>> {
        self.messages.next().await
    }

    pub fn unsubscribe(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        self.release_now();
    }
}

#[async_trait]
pub trait BusClient: Send + Sync {
    /// Publishes `payload` on `subject`. `dedupe_key` is the bus idempotency
    /// key: republishing the same logical event must not produce a second
    /// downstream message inside the dedupe window.
    async fn publish(&self, subject: &str, payload: Value, dedupe_key: &str)
        -> Result<(), BusError>;

    /// Opens an ordered, replay-capable subscription on `subject`.
    async fn subscribe(
        &self,
        subject: &str,
        options: SubscribeOptions,
    ) -> Result<BusSubscription, BusError>;
}

pub fn to_value<T: serde::Serialize>(payload: &T) -> Result<Value, BusError> {
    serde_json::to_value(payload).map_err(|e| BusError::Publish(anyhow::Error::new(e)))
}
