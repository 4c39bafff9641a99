//! Durable transactional outbox for outbound realtime delivery.
//!
//! A domain write (a chat message reaching the store) and its outbox entry are
//! committed in one transaction, so the relay worker can later publish the
//! event to the bus without any dual-write window. The outbox is the only
//! shared mutable resource in the pipeline and is mutated exclusively through
//! the operations on [`OutboxStore`].

mod sqlite;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use time::OffsetDateTime;

use careline_core::{MessageRole, MessageView, RealtimeEvent};

pub use sqlite::{sqlite_store, sqlite_store_in_memory, SqliteOutboxStore};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[source] anyhow::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Dispatched,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Dispatched => "dispatched",
            OutboxStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(OutboxStatus::Pending),
            "dispatched" => Some(OutboxStatus::Dispatched),
            "failed" => Some(OutboxStatus::Failed),
            _ => None,
        }
    }
}

/// One pending outbound event. `payload` holds the serialized tagged
/// [`RealtimeEvent`]; `event_type` denormalizes its discriminant for operator
/// queries. `sequence` is strictly increasing per `conversation_id`.
#[derive(Clone, Debug)]
pub struct OutboxEntry {
    pub id: String,
    pub message_id: String,
    pub conversation_id: String,
    pub event_type: String,
    pub sequence: u64,
    pub payload: Value,
    pub status: OutboxStatus,
    pub dedupe_id: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub dispatched_at: Option<OffsetDateTime>,
    pub error_message: Option<String>,
}

/// Input for the domain write side of [`OutboxStore::enqueue_message`].
#[derive(Clone, Debug)]
pub struct NewMessage {
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    pub model: Option<String>,
    pub citations: Option<Value>,
    pub metadata: BTreeMap<String, Value>,
}

/// Result of a successful atomic enqueue.
#[derive(Clone, Debug)]
pub struct EnqueueReceipt {
    pub message_id: String,
    pub sequence: u64,
    pub entry: OutboxEntry,
    pub message: MessageView,
}

/// Stable idempotency key for an outbox row. Republishing the same row always
/// carries the same key, so the bus can suppress the duplicate.
pub fn dedupe_id(event_type: &str, message_id: &str, sequence: u64) -> String {
    format!("{event_type}:{message_id}:{sequence}")
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Inserts the domain message row and its outbox entry as one atomic
    /// unit, assigning the next per-conversation sequence inside the same
    /// transaction. Either both rows exist afterwards or neither does.
    async fn enqueue_message(&self, input: NewMessage) -> Result<EnqueueReceipt, StoreError>;

    /// Enqueues a non-message event (token chunk, lifecycle, presence, ack
    /// request) under the same sequencing rules. `message_id` names the
    /// in-flight message the event belongs to.
    async fn enqueue_event(
        &self,
        conversation_id: &str,
        message_id: &str,
        event: RealtimeEvent,
    ) -> Result<OutboxEntry, StoreError>;

    /// Up to `limit` oldest pending entries in creation order. Read failures
    /// are logged and yield an empty batch; the outbox is an optimization
    /// path and a read hiccup must not take the relay loop down.
    async fn pending(&self, limit: usize) -> Vec<OutboxEntry>;

    /// Transitions `pending → dispatched`. Already-resolved entries are
    /// tolerated silently; duplicate relay ticks can race.
    async fn mark_dispatched(&self, id: &str) -> Result<(), StoreError>;

    /// Transitions `pending → failed`, recording the reason. Terminal for
    /// the relay; recovery is operator work.
    async fn mark_failed(&self, id: &str, reason: &str) -> Result<(), StoreError>;

    /// Failed entries, most recently resolved first, for operator
    /// inspection.
    async fn failed(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError>;

    /// Single entry lookup.
    async fn entry(&self, id: &str) -> Result<Option<OutboxEntry>, StoreError>;
}

pub type SharedOutboxStore = Arc<dyn OutboxStore>;
