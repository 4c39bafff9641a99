use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use metrics::counter;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use careline_bus::{BusClient, SubscribeOptions};
use careline_client::ClientFrame;
use careline_core::{event_subject_with_prefix, token_subject_with_prefix, PROTOCOL_VERSION};

#[derive(Clone)]
pub struct GatewayState {
    pub bus: Arc<dyn BusClient>,
    pub config: GatewayConfig,
}

pub fn build_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/stream/{conversation_id}", get(stream_conversation))
        .route("/stream/{conversation_id}/frames", post(accept_frame))
        .layer(Extension(state))
}

/// One outbound stream element, kept transport-agnostic so tests can assert
/// on it without parsing SSE framing.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamItem {
    pub kind: &'static str,
    pub id: Option<u64>,
    pub data: String,
}

impl StreamItem {
    fn into_sse(self) -> Event {
        let mut event = Event::default().event(self.kind).data(self.data);
        if let Some(id) = self.id {
            event = event.id(id.to_string());
        }
        event
    }
}

/// Per-connection forwarding loop.
///
/// The protocol handshake goes out first, then two bus subscriptions are
/// opened: last-value-per-key on the token subject for low-latency partial
/// output, and full (or resumed) replay on the event subject. Each bus
/// message becomes one tagged item whose id is the bus-assigned sequence, so
/// the SSE transport resumes via `Last-Event-ID` with no application logic.
///
/// Both subscriptions release on every exit path: explicitly after the loop,
/// and through drop when the client disconnects mid-stream.
pub fn conversation_stream(
    state: Arc<GatewayState>,
    conversation_id: String,
    resume_from: Option<u64>,
) -> impl Stream<Item = StreamItem> + Send + 'static {
    async_stream::stream! {
        yield StreamItem {
            kind: "protocol",
            id: None,
            data: PROTOCOL_VERSION.to_string(),
        };

        let token_subject = token_subject_with_prefix(
            &state.config.token_prefix,
            &state.config.env,
            &conversation_id,
        );
        let event_subject = event_subject_with_prefix(
            &state.config.event_prefix,
            &state.config.env,
            &conversation_id,
        );
        let event_policy = match resume_from {
            Some(sequence) => SubscribeOptions::from_sequence(sequence + 1),
            None => SubscribeOptions::all(),
        };

        let mut tokens = match state
            .bus
            .subscribe(&token_subject, SubscribeOptions::last_per_subject())
            .await
        {
            Ok(sub) => sub,
            Err(err) => {
                warn!(%conversation_id, error = %err, "token subscription setup failed");
                yield setup_error_item();
                return;
            }
        };
        let mut events = match state.bus.subscribe(&event_subject, event_policy).await {
            Ok(sub) => sub,
            Err(err) => {
                warn!(%conversation_id, error = %err, "event subscription setup failed");
                tokens.unsubscribe();
                yield setup_error_item();
                return;
            }
        };

        counter!("gateway_stream_opened_total").increment(1);
        info!(%conversation_id, resume_from = ?resume_from, "conversation stream opened");

        loop {
            let (kind, next) = tokio::select! {
                next = tokens.next() => ("token", next),
                next = events.next() => ("event", next),
            };
            match next {
                Some(Ok(message)) => {
                    yield StreamItem {
                        kind,
                        id: Some(message.sequence),
                        data: message.payload.to_string(),
                    };
                }
                Some(Err(err)) => {
                    warn!(%conversation_id, error = %err, "bus subscription error; closing stream");
                    break;
                }
                None => break,
            }
        }

        tokens.unsubscribe();
        events.unsubscribe();
        debug!(%conversation_id, "conversation stream closed");
    }
}

fn setup_error_item() -> StreamItem {
    StreamItem {
        kind: "error",
        id: None,
        data: "subscription setup failed".to_string(),
    }
}

async fn stream_conversation(
    Path(conversation_id): Path<String>,
    Extension(state): Extension<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let resume_from = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let stream = conversation_stream(state, conversation_id, resume_from)
        .map(|item| Ok::<_, Infallible>(item.into_sse()));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Serialize, Debug)]
pub struct FrameAccepted {
    pub status: &'static str,
}

#[derive(Serialize, Debug)]
pub struct ApiError {
    pub error: String,
}

/// Handles one client frame. Protocol failures are rejected for this
/// connection only and never disturb other streams.
pub fn handle_frame(
    conversation_id: &str,
    frame: &ClientFrame,
) -> Result<FrameAccepted, (StatusCode, Json<ApiError>)> {
    let frame_conversation = match frame {
        ClientFrame::Join {
            conversation_id, ..
        }
        | ClientFrame::Ack {
            conversation_id, ..
        }
        | ClientFrame::Heartbeat { conversation_id } => conversation_id.as_str(),
    };
    if frame_conversation != conversation_id {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApiError {
                error: format!(
                    "frame conversation `{frame_conversation}` does not match stream `{conversation_id}`"
                ),
            }),
        ));
    }

    match frame {
        ClientFrame::Join {
            resume_from_seq, ..
        } => {
            debug!(%conversation_id, resume_from_seq = ?resume_from_seq, "join frame received");
            counter!("gateway_frames_total", "kind" => "join").increment(1);
        }
        ClientFrame::Ack { up_to_sequence, .. } => {
            // Acks only inform replay-window trimming; delivery stays push-based.
            debug!(%conversation_id, up_to_sequence = *up_to_sequence, "ack frame received");
            counter!("gateway_frames_total", "kind" => "ack").increment(1);
        }
        ClientFrame::Heartbeat { .. } => {
            counter!("gateway_frames_total", "kind" => "heartbeat").increment(1);
        }
    }
    Ok(FrameAccepted { status: "accepted" })
}

async fn accept_frame(
    Path(conversation_id): Path<String>,
    Json(frame): Json<ClientFrame>,
) -> Result<Json<FrameAccepted>, (StatusCode, Json<ApiError>)> {
    handle_frame(&conversation_id, &frame).map(Json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_for_other_conversations_are_rejected() {
        let frame = ClientFrame::Heartbeat {
            conversation_id: "c2".into(),
        };
        let err = handle_frame("c1", &frame).unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn matching_frames_are_accepted() {
        let frame = ClientFrame::Ack {
            conversation_id: "c1".into(),
            up_to_sequence: 12,
        };
        let accepted = handle_frame("c1", &frame).unwrap();
        assert_eq!(accepted.status, "accepted");
    }
}
