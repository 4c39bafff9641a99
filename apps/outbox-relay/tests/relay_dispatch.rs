use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use careline_bus::{BusClient, BusError, BusSubscription, InMemoryBus, SubscribeOptions};
use careline_core::{
    event_subject, MessageRole, RealtimeEnvelope, RealtimeEvent, EVENT_SUBJECT_PREFIX,
    TOKEN_SUBJECT_PREFIX,
};
use careline_outbox::{
    sqlite_store_in_memory, EnqueueReceipt, NewMessage, OutboxEntry, OutboxStatus, OutboxStore,
    SharedOutboxStore, StoreError,
};
use careline_relay::{RelayWorker, SubjectRouter, TickOutcome};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tokio::sync::Mutex;

fn router() -> SubjectRouter {
    SubjectRouter::new("dev", TOKEN_SUBJECT_PREFIX, EVENT_SUBJECT_PREFIX)
}

fn new_message(content: &str) -> NewMessage {
    NewMessage {
        conversation_id: "c1".into(),
        role: MessageRole::User,
        content: content.into(),
        model: None,
        citations: None,
        metadata: BTreeMap::new(),
    }
}

fn worker(store: SharedOutboxStore, bus: Arc<dyn BusClient>) -> RelayWorker {
    RelayWorker::new(store, bus, router(), Duration::from_millis(20), 25)
}

/// Bus that rejects publishes for one dedupe key and delegates the rest.
struct FailOnKey {
    inner: InMemoryBus,
    fail_key: String,
}

#[async_trait]
impl BusClient for FailOnKey {
    async fn publish(
        &self,
        subject: &str,
        payload: Value,
        dedupe_key: &str,
    ) -> Result<(), BusError> {
        if dedupe_key == self.fail_key {
            return Err(BusError::Publish(anyhow::anyhow!(
                "injected publish failure"
            )));
        }
        self.inner.publish(subject, payload, dedupe_key).await
    }

    async fn subscribe(
        &self,
        subject: &str,
        options: SubscribeOptions,
    ) -> Result<BusSubscription, BusError> {
        self.inner.subscribe(subject, options).await
    }
}

/// Store whose dispatch mark fails a scripted number of times.
struct FlakyMarkStore {
    inner: SharedOutboxStore,
    failing_marks: AtomicUsize,
}

#[async_trait]
impl OutboxStore for FlakyMarkStore {
    async fn enqueue_message(&self, input: NewMessage) -> Result<EnqueueReceipt, StoreError> {
        self.inner.enqueue_message(input).await
    }

    async fn enqueue_event(
        &self,
        conversation_id: &str,
        message_id: &str,
        event: RealtimeEvent,
    ) -> Result<OutboxEntry, StoreError> {
        self.inner
            .enqueue_event(conversation_id, message_id, event)
            .await
    }

    async fn pending(&self, limit: usize) -> Vec<OutboxEntry> {
        self.inner.pending(limit).await
    }

    async fn mark_dispatched(&self, id: &str) -> Result<(), StoreError> {
        if self.failing_marks.load(Ordering::SeqCst) > 0 {
            self.failing_marks.fetch_sub(1, Ordering::SeqCst);
            return Err(StoreError::Database(anyhow::anyhow!(
                "injected mark failure"
            )));
        }
        self.inner.mark_dispatched(id).await
    }

    async fn mark_failed(&self, id: &str, reason: &str) -> Result<(), StoreError> {
        self.inner.mark_failed(id, reason).await
    }

    async fn failed(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError> {
        self.inner.failed(limit).await
    }

    async fn entry(&self, id: &str) -> Result<Option<OutboxEntry>, StoreError> {
        self.inner.entry(id).await
    }
}

/// Hand-scripted store for rows that cannot come out of the real schema.
struct ScriptedStore {
    entries: Mutex<Vec<OutboxEntry>>,
    failures: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl OutboxStore for ScriptedStore {
    async fn enqueue_message(&self, _input: NewMessage) -> Result<EnqueueReceipt, StoreError> {
        unreachable!("scripted store is read-only")
    }

    async fn enqueue_event(
        &self,
        _conversation_id: &str,
        _message_id: &str,
        _event: RealtimeEvent,
    ) -> Result<OutboxEntry, StoreError> {
        unreachable!("scripted store is read-only")
    }

    async fn pending(&self, limit: usize) -> Vec<OutboxEntry> {
        let entries = self.entries.lock().await;
        entries.iter().take(limit).cloned().collect()
    }

    async fn mark_dispatched(&self, id: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        entries.retain(|e| e.id != id);
        Ok(())
    }

    async fn mark_failed(&self, id: &str, reason: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        entries.retain(|e| e.id != id);
        self.failures
            .lock()
            .await
            .push((id.to_string(), reason.to_string()));
        Ok(())
    }

    async fn failed(&self, _limit: usize) -> Result<Vec<OutboxEntry>, StoreError> {
        Ok(Vec::new())
    }

    async fn entry(&self, _id: &str) -> Result<Option<OutboxEntry>, StoreError> {
        Ok(None)
    }
}

#[tokio::test]
async fn three_rapid_enqueues_dispatch_in_sequence_order() {
    let store = sqlite_store_in_memory().unwrap();
    let bus = Arc::new(InMemoryBus::new());
    let worker = worker(store.clone(), bus.clone());

    let mut receipts = Vec::new();
    for n in 0..3 {
        receipts.push(
            store
                .enqueue_message(new_message(&format!("m{n}")))
                .await
                .unwrap(),
        );
    }
    assert_eq!(
        receipts.iter().map(|r| r.sequence).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );

    let outcome = worker.tick().await;
    assert_eq!(
        outcome,
        TickOutcome {
            dispatched: 3,
            failed: 0
        }
    );

    let published = bus.take_published().await;
    assert_eq!(published.len(), 3);
    let keys: HashSet<_> = published.iter().map(|(_, _, key)| key.clone()).collect();
    assert_eq!(keys.len(), 3, "dedupe keys must be distinct");

    for receipt in &receipts {
        let entry = store.entry(&receipt.entry.id).await.unwrap().unwrap();
        assert_eq!(entry.status, OutboxStatus::Dispatched);
        assert!(entry.dispatched_at.is_some());
    }

    let mut sub = bus
        .subscribe(&event_subject("dev", "c1"), SubscribeOptions::all())
        .await
        .unwrap();
    for expected in 1..=3u64 {
        let msg = sub.next().await.unwrap().unwrap();
        let envelope: RealtimeEnvelope = serde_json::from_value(msg.payload).unwrap();
        assert_eq!(envelope.sequence, expected);
        assert_eq!(envelope.conversation_id, "c1");
    }
}

#[tokio::test]
async fn publish_failure_marks_entry_failed_and_sequences_are_not_reused() {
    let store = sqlite_store_in_memory().unwrap();
    let mut receipts = Vec::new();
    for n in 0..3 {
        receipts.push(
            store
                .enqueue_message(new_message(&format!("m{n}")))
                .await
                .unwrap(),
        );
    }

    let bus = Arc::new(FailOnKey {
        inner: InMemoryBus::new(),
        fail_key: receipts[1].entry.dedupe_id.clone(),
    });
    let worker = worker(store.clone(), bus);

    let outcome = worker.tick().await;
    assert_eq!(
        outcome,
        TickOutcome {
            dispatched: 2,
            failed: 1
        }
    );

    let failed = store.entry(&receipts[1].entry.id).await.unwrap().unwrap();
    assert_eq!(failed.status, OutboxStatus::Failed);
    assert!(failed
        .error_message
        .as_deref()
        .unwrap()
        .contains("injected publish failure"));
    for receipt in [&receipts[0], &receipts[2]] {
        let entry = store.entry(&receipt.entry.id).await.unwrap().unwrap();
        assert_eq!(entry.status, OutboxStatus::Dispatched);
    }

    // Failure is terminal and its sequence is never reused.
    let fourth = store.enqueue_message(new_message("m3")).await.unwrap();
    assert_eq!(fourth.sequence, 4);
    let second = worker.tick().await;
    assert_eq!(
        second,
        TickOutcome {
            dispatched: 1,
            failed: 0
        }
    );
}

#[tokio::test]
async fn failed_dispatch_mark_republishes_under_the_same_key() {
    let sqlite = sqlite_store_in_memory().unwrap();
    let store: SharedOutboxStore = Arc::new(FlakyMarkStore {
        inner: sqlite,
        failing_marks: AtomicUsize::new(1),
    });
    let bus = Arc::new(InMemoryBus::new());
    let worker = worker(store.clone(), bus.clone());

    store.enqueue_message(new_message("hello")).await.unwrap();

    let first = worker.tick().await;
    assert_eq!(first.dispatched, 1);
    assert_eq!(
        store.pending(10).await.len(),
        1,
        "entry stays pending when the dispatch mark fails"
    );

    let second = worker.tick().await;
    assert_eq!(second.dispatched, 1);
    assert!(store.pending(10).await.is_empty());

    let published = bus.take_published().await;
    assert_eq!(published.len(), 2, "entry was republished");
    assert_eq!(published[0].2, published[1].2, "same dedupe key both times");
    assert_eq!(
        bus.message_count(&event_subject("dev", "c1")).await,
        1,
        "bus suppressed the duplicate"
    );
}

#[tokio::test]
async fn undecodable_entry_is_failed_not_retried() {
    let now = OffsetDateTime::now_utc();
    let entry = OutboxEntry {
        id: "e1".into(),
        message_id: "m1".into(),
        conversation_id: "c1".into(),
        event_type: "message_created".into(),
        sequence: 1,
        payload: json!({"type": "mystery"}),
        status: OutboxStatus::Pending,
        dedupe_id: "k1".into(),
        created_at: now,
        updated_at: now,
        dispatched_at: None,
        error_message: None,
    };
    let store = Arc::new(ScriptedStore {
        entries: Mutex::new(vec![entry]),
        failures: Mutex::new(Vec::new()),
    });
    let bus = Arc::new(InMemoryBus::new());
    let relay = worker(store.clone(), bus.clone());

    let outcome = relay.tick().await;
    assert_eq!(outcome.failed, 1);
    assert!(bus.take_published().await.is_empty());

    let failures = store.failures.lock().await;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, "e1");
    assert!(failures[0].1.contains("undecodable payload"));
}

#[tokio::test]
async fn stop_cancels_the_timer_and_no_further_tick_fires() {
    let store = sqlite_store_in_memory().unwrap();
    let bus = Arc::new(InMemoryBus::new());
    let relay = Arc::new(worker(store.clone(), bus));
    let handle = Arc::clone(&relay).spawn();

    store.enqueue_message(new_message("first")).await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !store.pending(10).await.is_empty() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "first entry was never dispatched"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    relay.stop();
    handle.await.unwrap();

    store.enqueue_message(new_message("second")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        store.pending(10).await.len(),
        1,
        "no tick may fire after stop"
    );
}
