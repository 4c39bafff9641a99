//! Client-side resume protocol for Careline realtime streams.
//!
//! Delivery is at-least-once, so the embedding client owns the last line of
//! defense: [`ResumeState`] tracks the highest applied sequence per
//! conversation, suppresses duplicates by dedupe key and message id, and
//! assembles partial token streams into complete messages. On reconnect the
//! client sends a join frame carrying `resume_from_seq`, and the server-side
//! replay yields only events past that cursor.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use careline_core::{
    EnvelopeError, MessageView, PresenceStatus, RealtimeEnvelope, RealtimeEvent, StreamPhase,
};

/// Frames sent from the client to the server. Join opens (or resumes) a
/// conversation stream, ack answers an ack-requested event, heartbeat keeps
/// the transport's liveness timer fed.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    #[serde(rename_all = "camelCase")]
    Join {
        conversation_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resume_from_seq: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    Ack {
        conversation_id: String,
        up_to_sequence: u64,
    },
    #[serde(rename_all = "camelCase")]
    Heartbeat { conversation_id: String },
}

/// Outcome of applying one envelope to local state.
#[derive(Clone, Debug, PartialEq)]
pub enum Applied {
    MessageAdded(MessageView),
    TokenAppended { message_id: String },
    MessageCompleted { message_id: String, content: String },
    Lifecycle { message_id: String, phase: StreamPhase },
    Presence {
        participant_id: String,
        status: PresenceStatus,
    },
    /// Server asked for an ack; the returned frame should be sent back.
    /// Acks never gate delivery, they only trim the server replay window.
    AckDue(ClientFrame),
    Duplicate,
}

/// Per-conversation client state.
#[derive(Debug)]
pub struct ResumeState {
    conversation_id: String,
    last_sequence: u64,
    token_buffers: HashMap<String, String>,
    seen_keys: HashSet<String>,
    messages: Vec<MessageView>,
}

impl ResumeState {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            last_sequence: 0,
            token_buffers: HashMap::new(),
            seen_keys: HashSet::new(),
            messages: Vec::new(),
        }
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn messages(&self) -> &[MessageView] {
        &self.messages
    }

    /// Accumulated partial content for an in-flight message, if any.
    pub fn partial(&self, message_id: &str) -> Option<&str> {
        self.token_buffers.get(message_id).map(String::as_str)
    }

    /// Join frame for connect or reconnect. `resume_from_seq` is present only
    /// when something was applied before, so a fresh client replays from the
    /// beginning.
    pub fn join_frame(&self) -> ClientFrame {
        ClientFrame::Join {
            conversation_id: self.conversation_id.clone(),
            resume_from_seq: (self.last_sequence > 0).then_some(self.last_sequence),
        }
    }

    pub fn heartbeat_frame(&self) -> ClientFrame {
        ClientFrame::Heartbeat {
            conversation_id: self.conversation_id.clone(),
        }
    }

    /// Applies one envelope. Rejects foreign protocol versions, suppresses
    /// repeats by dedupe key, and keeps message-created idempotent by message
    /// id independently of transport replay.
    pub fn apply(&mut self, envelope: &RealtimeEnvelope) -> Result<Applied, EnvelopeError> {
        envelope.ensure_version()?;
        if !self.seen_keys.insert(envelope.contract.dedupe_key.clone()) {
            return Ok(Applied::Duplicate);
        }

        let applied = match &envelope.event {
            RealtimeEvent::MessageCreated { message } => {
                if self.messages.iter().any(|m| m.id == message.id) {
                    Applied::Duplicate
                } else {
                    self.messages.push(message.clone());
                    Applied::MessageAdded(message.clone())
                }
            }
            RealtimeEvent::TokenChunk {
                message_id,
                token,
                is_final,
            } => {
                let buffer = self.token_buffers.entry(message_id.clone()).or_default();
                buffer.push_str(token);
                if *is_final {
                    let content = self.token_buffers.remove(message_id).unwrap_or_default();
                    if let Some(message) = self.messages.iter_mut().find(|m| m.id == *message_id) {
                        message.content = content.clone();
                    }
                    Applied::MessageCompleted {
                        message_id: message_id.clone(),
                        content,
                    }
                } else {
                    Applied::TokenAppended {
                        message_id: message_id.clone(),
                    }
                }
            }
            RealtimeEvent::StreamLifecycle { message_id, phase } => Applied::Lifecycle {
                message_id: message_id.clone(),
                phase: *phase,
            },
            RealtimeEvent::Presence {
                participant_id,
                status,
            } => Applied::Presence {
                participant_id: participant_id.clone(),
                status: *status,
            },
            RealtimeEvent::AckRequested { up_to_sequence } => Applied::AckDue(ClientFrame::Ack {
                conversation_id: self.conversation_id.clone(),
                up_to_sequence: *up_to_sequence,
            }),
        };

        self.last_sequence = self.last_sequence.max(envelope.sequence);
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use careline_core::{MessageRole, PROTOCOL_VERSION};
    use std::collections::BTreeMap;
    use time::OffsetDateTime;

    fn message(id: &str) -> MessageView {
        MessageView {
            id: id.into(),
            conversation_id: "c1".into(),
            role: MessageRole::Assistant,
            content: String::new(),
            model: None,
            citations: None,
            metadata: BTreeMap::new(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    fn created(seq: u64) -> RealtimeEnvelope {
        RealtimeEnvelope::new(
            "c1",
            seq,
            RealtimeEvent::MessageCreated {
                message: message(&format!("m{seq}")),
            },
            format!("message_created:m{seq}:{seq}"),
        )
    }

    fn chunk(seq: u64, message_id: &str, token: &str, is_final: bool) -> RealtimeEnvelope {
        RealtimeEnvelope::new(
            "c1",
            seq,
            RealtimeEvent::TokenChunk {
                message_id: message_id.into(),
                token: token.into(),
                is_final,
            },
            format!("token_chunk:{message_id}:{seq}"),
        )
    }

    #[test]
    fn join_frame_carries_resume_cursor_only_after_progress() {
        let mut state = ResumeState::new("c1");
        assert_eq!(
            state.join_frame(),
            ClientFrame::Join {
                conversation_id: "c1".into(),
                resume_from_seq: None,
            }
        );
        state.apply(&created(3)).unwrap();
        assert_eq!(
            state.join_frame(),
            ClientFrame::Join {
                conversation_id: "c1".into(),
                resume_from_seq: Some(3),
            }
        );
    }

    #[test]
    fn reconnect_applies_only_events_past_the_cursor() {
        let mut state = ResumeState::new("c1");
        for seq in 1..=5 {
            state.apply(&created(seq)).unwrap();
        }
        assert_eq!(state.last_sequence(), 5);

        // Injected stream holds 4..=8; server-side replay honors the join
        // frame cursor and yields only sequences past it.
        let injected: Vec<_> = (4..=8).map(created).collect();
        let resume_from = match state.join_frame() {
            ClientFrame::Join {
                resume_from_seq, ..
            } => resume_from_seq.unwrap(),
            _ => unreachable!(),
        };
        let mut applied = Vec::new();
        for envelope in injected.iter().filter(|e| e.sequence > resume_from) {
            if let Applied::MessageAdded(m) = state.apply(envelope).unwrap() {
                applied.push(m.id);
            }
        }
        assert_eq!(applied, vec!["m6", "m7", "m8"]);
        assert_eq!(state.last_sequence(), 8);
        assert_eq!(state.messages().len(), 8);
    }

    #[test]
    fn duplicate_dedupe_keys_are_suppressed() {
        let mut state = ResumeState::new("c1");
        let envelope = created(1);
        assert!(matches!(
            state.apply(&envelope).unwrap(),
            Applied::MessageAdded(_)
        ));
        assert_eq!(state.apply(&envelope).unwrap(), Applied::Duplicate);
        assert_eq!(state.messages().len(), 1);
    }

    #[test]
    fn message_ids_dedupe_independently_of_transport_replay() {
        let mut state = ResumeState::new("c1");
        let first = RealtimeEnvelope::new(
            "c1",
            1,
            RealtimeEvent::MessageCreated {
                message: message("m1"),
            },
            "key-a",
        );
        let republished = RealtimeEnvelope::new(
            "c1",
            2,
            RealtimeEvent::MessageCreated {
                message: message("m1"),
            },
            "key-b",
        );
        state.apply(&first).unwrap();
        assert_eq!(state.apply(&republished).unwrap(), Applied::Duplicate);
        assert_eq!(state.messages().len(), 1);
    }

    #[test]
    fn token_chunks_assemble_into_message_content() {
        let mut state = ResumeState::new("c1");
        state.apply(&created(1)).unwrap();
        state.apply(&chunk(2, "m1", "Vaso", false)).unwrap();
        state
            .apply(&chunk(3, "m1", "-occlusive risk is ", false))
            .unwrap();
        assert_eq!(state.partial("m1"), Some("Vaso-occlusive risk is "));

        let done = state.apply(&chunk(4, "m1", "low.", true)).unwrap();
        assert_eq!(
            done,
            Applied::MessageCompleted {
                message_id: "m1".into(),
                content: "Vaso-occlusive risk is low.".into(),
            }
        );
        assert!(state.partial("m1").is_none());
        assert_eq!(state.messages()[0].content, "Vaso-occlusive risk is low.");
    }

    #[test]
    fn ack_requested_yields_an_ack_frame() {
        let mut state = ResumeState::new("c1");
        let envelope = RealtimeEnvelope::new(
            "c1",
            9,
            RealtimeEvent::AckRequested { up_to_sequence: 9 },
            "ack:9",
        );
        let applied = state.apply(&envelope).unwrap();
        assert_eq!(
            applied,
            Applied::AckDue(ClientFrame::Ack {
                conversation_id: "c1".into(),
                up_to_sequence: 9,
            })
        );
    }

    #[test]
    fn foreign_protocol_versions_are_rejected() {
        let mut state = ResumeState::new("c1");
        let mut envelope = created(1);
        envelope.version = "someone-elses.v9".into();
        let err = state.apply(&envelope).unwrap_err();
        assert!(matches!(err, EnvelopeError::VersionMismatch { .. }));
        assert_eq!(state.last_sequence(), 0);
        assert_ne!(envelope.version, PROTOCOL_VERSION);
    }

    #[test]
    fn frames_use_camel_case_wire_fields() {
        let frame = ClientFrame::Join {
            conversation_id: "c1".into(),
            resume_from_seq: Some(5),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "join");
        assert_eq!(value["conversationId"], "c1");
        assert_eq!(value["resumeFromSeq"], 5);
    }
}
