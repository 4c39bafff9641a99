use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};

use crate::{BusClient, BusError, BusMessage, BusSubscription, DeliverPolicy, SubscribeOptions};

/// In-memory bus used in tests. Keeps a per-subject log for replay, a live
/// broadcast channel per subject, and honors publish dedupe keys the way the
/// JetStream duplicate window does.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    inner: Arc<Mutex<State>>,
    active: Arc<AtomicUsize>,
}

#[derive(Default)]
struct State {
    next_sequence: u64,
    logs: HashMap<String, Vec<BusMessage>>,
    seen_keys: HashSet<String>,
    live: HashMap<String, broadcast::Sender<BusMessage>>,
    published: Vec<(String, Value, String)>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every publish attempt in order, duplicates included, as
    /// `(subject, payload, dedupe_key)`. Clears the capture.
    pub async fn take_published(&self) -> Vec<(String, Value, String)> {
        let mut state = self.inner.lock().await;
        std::mem::take(&mut state.published)
    }

    /// Messages retained for `subject` after dedupe.
    pub async fn message_count(&self, subject: &str) -> usize {
        let state = self.inner.lock().await;
        state.logs.get(subject).map(Vec::len).unwrap_or(0)
    }

    /// Number of subscriptions that have been opened and not yet released.
    pub fn active_subscriptions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BusClient for InMemoryBus {
    async fn publish(
        &self,
        subject: &str,
        payload: Value,
        dedupe_key: &str,
    ) -> Result<(), BusError> {
        let mut state = self.inner.lock().await;
        state
            .published
            .push((subject.to_string(), payload.clone(), dedupe_key.to_string()));
        if !state.seen_keys.insert(dedupe_key.to_string()) {
            // Duplicate of an already-accepted publish: idempotent no-op.
            return Ok(());
        }
        state.next_sequence += 1;
        let sequence = state.next_sequence;
        let message = BusMessage {
            subject: subject.to_string(),
            payload,
            sequence,
            delivery_tag: Some(format!("inmemory:{sequence}")),
        };
        state
            .logs
            .entry(subject.to_string())
            .or_default()
            .push(message.clone());
        if let Some(sender) = state.live.get(subject) {
            let _ = sender.send(message);
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        options: SubscribeOptions,
    ) -> Result<BusSubscription, BusError> {
        let mut state = self.inner.lock().await;
        let log = state.logs.get(subject).cloned().unwrap_or_default();
        let replay: Vec<BusMessage> = match options.deliver {
            DeliverPolicy::All => log,
            DeliverPolicy::LastPerSubject => log.last().cloned().into_iter().collect(),
            DeliverPolicy::FromSequence(sequence) => {
                log.into_iter().filter(|m| m.sequence >= sequence).collect()
            }
        };
        // Snapshot and live receiver are taken under one lock so no message
        // can fall between replay and live delivery.
        let mut receiver = state
            .live
            .entry(subject.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .subscribe();
        drop(state);

        self.active.fetch_add(1, Ordering::SeqCst);
        let stream = async_stream::stream! {
            for message in replay {
                yield Ok(message);
            }
            loop {
                match receiver.recv().await {
                    Ok(message) => yield Ok(message),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        yield Err(BusError::Subscribe(anyhow::anyhow!(
                            "in-memory subscription lagged by {skipped}"
                        )));
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };

        let active = Arc::clone(&self.active);
        Ok(BusSubscription::new(Box::pin(stream), move || {
            active.fetch_sub(1, Ordering::SeqCst);
        }))
    }
}
