use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

/// Wire protocol version stamped on every envelope. Clients reject envelopes
/// carrying any other value.
pub const PROTOCOL_VERSION: &str = "careline.rt.v1";

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("unsupported protocol version `{got}` (expected `{expected}`)")]
    VersionMismatch { expected: &'static str, got: String },
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }
}

impl FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            "system" => Ok(MessageRole::System),
            other => Err(format!("unknown message role `{other}`")),
        }
    }
}

/// Client-facing projection of a stored chat message.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub id: String,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citations: Option<Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamPhase {
    Started,
    Completed,
    Aborted,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Joined,
    Left,
    Typing,
}

/// Closed set of realtime event variants. Gateway and client branches match
/// exhaustively, so adding a variant is a compile-time-checked change.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RealtimeEvent {
    #[serde(rename_all = "camelCase")]
    MessageCreated { message: MessageView },
    #[serde(rename_all = "camelCase")]
    TokenChunk {
        message_id: String,
        token: String,
        is_final: bool,
    },
    #[serde(rename_all = "camelCase")]
    StreamLifecycle {
        message_id: String,
        phase: StreamPhase,
    },
    #[serde(rename_all = "camelCase")]
    Presence {
        participant_id: String,
        status: PresenceStatus,
    },
    #[serde(rename_all = "camelCase")]
    AckRequested { up_to_sequence: u64 },
}

impl RealtimeEvent {
    /// Stable discriminant string, also persisted in the outbox `event_type`
    /// column for operator queries.
    pub fn event_type(&self) -> &'static str {
        match self {
            RealtimeEvent::MessageCreated { .. } => "message_created",
            RealtimeEvent::TokenChunk { .. } => "token_chunk",
            RealtimeEvent::StreamLifecycle { .. } => "stream_lifecycle",
            RealtimeEvent::Presence { .. } => "presence",
            RealtimeEvent::AckRequested { .. } => "ack_requested",
        }
    }

    /// Token chunks ride the low-latency token subject; everything else goes
    /// through the durable event subject.
    pub fn is_token_chunk(&self) -> bool {
        matches!(self, RealtimeEvent::TokenChunk { .. })
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryGuarantee {
    AtLeastOnce,
}

/// Tells the client that this delivery may repeat and how to suppress the
/// duplicate.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryContract {
    pub guarantee: DeliveryGuarantee,
    pub dedupe_key: String,
}

/// Envelope published to the bus by the relay worker and forwarded verbatim
/// to streaming clients. Never persisted by the gateway.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeEnvelope {
    pub version: String,
    pub conversation_id: String,
    pub sequence: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
    pub event: RealtimeEvent,
    pub contract: DeliveryContract,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_tag: Option<String>,
}

impl RealtimeEnvelope {
    pub fn new(
        conversation_id: impl Into<String>,
        sequence: u64,
        event: RealtimeEvent,
        dedupe_key: impl Into<String>,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            conversation_id: conversation_id.into(),
            sequence,
            issued_at: OffsetDateTime::now_utc(),
            event,
            contract: DeliveryContract {
                guarantee: DeliveryGuarantee::AtLeastOnce,
                dedupe_key: dedupe_key.into(),
            },
            delivery_tag: None,
        }
    }

    pub fn ensure_version(&self) -> Result<(), EnvelopeError> {
        if self.version != PROTOCOL_VERSION {
            return Err(EnvelopeError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: self.version.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> MessageView {
        MessageView {
            id: "msg-1".into(),
            conversation_id: "conv-1".into(),
            role: MessageRole::Assistant,
            content: "Your prior authorization was submitted.".into(),
            model: Some("router/default".into()),
            citations: None,
            metadata: BTreeMap::new(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn event_wire_shape_uses_tagged_variants() {
        let event = RealtimeEvent::TokenChunk {
            message_id: "msg-1".into(),
            token: "hel".into(),
            is_final: false,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "token_chunk");
        assert_eq!(value["messageId"], "msg-1");
        assert_eq!(value["isFinal"], false);
    }

    #[test]
    fn envelope_carries_contract_and_version() {
        let envelope = RealtimeEnvelope::new(
            "conv-1",
            7,
            RealtimeEvent::MessageCreated { message: message() },
            "message_created:msg-1",
        );
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["version"], PROTOCOL_VERSION);
        assert_eq!(value["sequence"], 7);
        assert_eq!(value["contract"]["guarantee"], "at-least-once");
        assert_eq!(value["contract"]["dedupeKey"], "message_created:msg-1");
        assert!(value.get("deliveryTag").is_none());
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let mut envelope = RealtimeEnvelope::new(
            "conv-1",
            1,
            RealtimeEvent::AckRequested { up_to_sequence: 1 },
            "ack:1",
        );
        envelope.ensure_version().expect("current version accepted");
        envelope.version = "careline.rt.v0".into();
        let err = envelope.ensure_version().unwrap_err();
        assert!(matches!(err, EnvelopeError::VersionMismatch { .. }));
    }

    #[test]
    fn event_types_match_serde_tags() {
        let event = RealtimeEvent::MessageCreated { message: message() };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], event.event_type());
        assert!(!event.is_token_chunk());
    }
}
