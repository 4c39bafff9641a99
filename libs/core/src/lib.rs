//! Careline realtime contracts shared by the relay worker, the streaming
//! gateway, and embedding clients.
//!
//! This crate defines the wire envelope delivered to browsers, the closed set
//! of realtime event variants, and the canonical bus subject helpers. It holds
//! no I/O; the bus and outbox crates build on top of these types.

pub mod envelope;
pub mod subjects;

pub use envelope::{
    DeliveryContract, DeliveryGuarantee, EnvelopeError, MessageRole, MessageView, PresenceStatus,
    RealtimeEnvelope, RealtimeEvent, StreamPhase, PROTOCOL_VERSION,
};
pub use subjects::{
    event_subject, event_subject_with_prefix, token_subject, token_subject_with_prefix,
    EVENT_SUBJECT_PREFIX, TOKEN_SUBJECT_PREFIX,
};
