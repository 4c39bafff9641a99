use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use careline_bus::{to_value, BusClient};
use careline_core::{event_subject_with_prefix, token_subject_with_prefix, RealtimeEnvelope, RealtimeEvent};
use careline_outbox::{OutboxEntry, SharedOutboxStore};

/// Routes an outbox entry to its bus subject: token chunks ride the
/// low-latency token subject, everything else the durable event subject.
#[derive(Clone, Debug)]
pub struct SubjectRouter {
    env: String,
    token_prefix: String,
    event_prefix: String,
}

impl SubjectRouter {
    pub fn new(env: &str, token_prefix: &str, event_prefix: &str) -> Self {
        Self {
            env: env.to_string(),
            token_prefix: token_prefix.to_string(),
            event_prefix: event_prefix.to_string(),
        }
    }

    pub fn subject_for(&self, conversation_id: &str, event: &RealtimeEvent) -> String {
        if event.is_token_chunk() {
            token_subject_with_prefix(&self.token_prefix, &self.env, conversation_id)
        } else {
            event_subject_with_prefix(&self.event_prefix, &self.env, conversation_id)
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct TickOutcome {
    pub dispatched: usize,
    pub failed: usize,
}

enum DispatchOutcome {
    Dispatched,
    Failed,
}

/// Single-process polling worker draining the outbox into the bus.
///
/// One sequential loop: the next timer is armed only after the current tick
/// completes, so two ticks can never overlap and slow ticks naturally
/// throttle the poll rate. Cancellation interrupts the timer wait only; an
/// in-flight tick always runs to completion.
pub struct RelayWorker {
    store: SharedOutboxStore,
    bus: Arc<dyn BusClient>,
    router: SubjectRouter,
    poll_interval: Duration,
    batch_size: usize,
    cancel: CancellationToken,
}

impl RelayWorker {
    pub fn new(
        store: SharedOutboxStore,
        bus: Arc<dyn BusClient>,
        router: SubjectRouter,
        poll_interval: Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            bus,
            router,
            poll_interval,
            batch_size,
            cancel: CancellationToken::new(),
        }
    }

    /// After `stop` returns, the armed timer is cancelled and no further tick
    /// will fire.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    pub async fn run(&self) {
        info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            batch_size = self.batch_size,
            "outbox relay started"
        );
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
            self.tick().await;
        }
        info!("outbox relay stopped");
    }

    /// One poll cycle. Infrastructure errors are resolved through entry
    /// status or retried on the next tick and never escape the scheduling
    /// loop.
    pub async fn tick(&self) -> TickOutcome {
        let batch = self.store.pending(self.batch_size).await;
        let mut outcome = TickOutcome::default();
        for entry in batch {
            match self.dispatch(&entry).await {
                DispatchOutcome::Dispatched => outcome.dispatched += 1,
                DispatchOutcome::Failed => outcome.failed += 1,
            }
        }
        outcome
    }

    async fn dispatch(&self, entry: &OutboxEntry) -> DispatchOutcome {
        let event: RealtimeEvent = match serde_json::from_value(entry.payload.clone()) {
            Ok(event) => event,
            Err(err) => {
                // Retrying cannot fix a row we cannot decode.
                self.resolve_failure(entry, &format!("undecodable payload: {err}"))
                    .await;
                return DispatchOutcome::Failed;
            }
        };

        let subject = self.router.subject_for(&entry.conversation_id, &event);
        let envelope = RealtimeEnvelope::new(
            entry.conversation_id.as_str(),
            entry.sequence,
            event,
            entry.dedupe_id.as_str(),
        );
        let payload = match to_value(&envelope) {
            Ok(payload) => payload,
            Err(err) => {
                self.resolve_failure(entry, &format!("unserializable envelope: {err}"))
                    .await;
                return DispatchOutcome::Failed;
            }
        };

        match self.bus.publish(&subject, payload, &entry.dedupe_id).await {
            Ok(()) => {
                if let Err(err) = self.store.mark_dispatched(&entry.id).await {
                    // Publish landed but the mark did not: the entry stays
                    // pending and is republished next tick under the same
                    // dedupe key.
                    warn!(
                        entry_id = %entry.id,
                        error = %err,
                        "publish succeeded but dispatch mark failed; entry will be republished"
                    );
                }
                counter!("relay_dispatch_total", "event_type" => entry.event_type.clone())
                    .increment(1);
                DispatchOutcome::Dispatched
            }
            Err(err) => {
                error!(
                    entry_id = %entry.id,
                    subject = %subject,
                    error = %err,
                    "failed to publish outbox entry"
                );
                counter!("relay_publish_failure_total", "event_type" => entry.event_type.clone())
                    .increment(1);
                self.resolve_failure(entry, &err.to_string()).await;
                DispatchOutcome::Failed
            }
        }
    }

    async fn resolve_failure(&self, entry: &OutboxEntry, reason: &str) {
        if let Err(mark_err) = self.store.mark_failed(&entry.id, reason).await {
            warn!(
                entry_id = %entry.id,
                error = %mark_err,
                "failed to record failure mark; entry remains pending for retry"
            );
        }
    }
}
