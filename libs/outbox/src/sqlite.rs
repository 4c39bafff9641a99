use std::sync::{Arc, Mutex as StdMutex};

use rusqlite::{params, Connection, Transaction};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::task::spawn_blocking;
use tracing::{debug, warn};
use uuid::Uuid;

use careline_core::{MessageView, RealtimeEvent};

use super::{
    EnqueueReceipt, NewMessage, OutboxEntry, OutboxStatus, OutboxStore, SharedOutboxStore,
    StoreError,
};

const CREATE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    model TEXT,
    citations TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS conversation_sequences (
    conversation_id TEXT PRIMARY KEY,
    next_sequence INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS outbox_entries (
    id TEXT PRIMARY KEY,
    message_id TEXT NOT NULL,
    conversation_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    payload TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    dedupe_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    dispatched_at TEXT,
    error_message TEXT,
    UNIQUE (conversation_id, sequence)
);
CREATE INDEX IF NOT EXISTS idx_outbox_pending ON outbox_entries (status, created_at);
"#;

const ENTRY_COLUMNS: &str = "id, message_id, conversation_id, event_type, sequence, payload, \
     status, dedupe_id, created_at, updated_at, dispatched_at, error_message";

#[derive(Clone)]
pub struct SqliteOutboxStore {
    conn: Arc<StdMutex<Connection>>,
}

pub fn sqlite_store(path: impl AsRef<std::path::Path>) -> anyhow::Result<SharedOutboxStore> {
    Ok(Arc::new(SqliteOutboxStore::open(path)?))
}

pub fn sqlite_store_in_memory() -> anyhow::Result<SharedOutboxStore> {
    Ok(Arc::new(SqliteOutboxStore::open_in_memory()?))
}

impl SqliteOutboxStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(CREATE_SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(StdMutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(StdMutex::new(conn)),
        })
    }

    async fn with_conn<F, T>(&self, func: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        spawn_blocking(move || {
            let mut guard = conn.lock().unwrap();
            func(&mut guard)
        })
        .await
        .map_err(|err| StoreError::Database(err.into()))?
    }
}

fn db<E: std::error::Error + Send + Sync + 'static>(err: E) -> StoreError {
    StoreError::Database(anyhow::Error::new(err))
}

fn fmt_ts(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339)
        .unwrap_or_else(|_| ts.unix_timestamp().to_string())
}

fn parse_ts(raw: &str) -> Result<OffsetDateTime, StoreError> {
    OffsetDateTime::parse(raw, &Rfc3339).map_err(db)
}

/// Read-then-increment of the per-conversation counter. Runs inside the
/// enclosing transaction, so concurrent enqueues on one conversation can
/// never observe the same value.
fn next_sequence(tx: &Transaction<'_>, conversation_id: &str) -> Result<u64, StoreError> {
    tx.query_row(
        "INSERT INTO conversation_sequences (conversation_id, next_sequence) VALUES (?1, 1)
         ON CONFLICT(conversation_id) DO UPDATE SET next_sequence = next_sequence + 1
         RETURNING next_sequence",
        params![conversation_id],
        |row| row.get::<_, i64>(0),
    )
    .map(|v| v.max(0) as u64)
    .map_err(db)
}

fn insert_entry(
    tx: &Transaction<'_>,
    conversation_id: &str,
    message_id: &str,
    event: &RealtimeEvent,
    now: OffsetDateTime,
) -> Result<OutboxEntry, StoreError> {
    let sequence = next_sequence(tx, conversation_id)?;
    let payload = serde_json::to_value(event).map_err(db)?;
    let event_type = event.event_type();
    let dedupe_id = super::dedupe_id(event_type, message_id, sequence);
    let id = Uuid::new_v4().to_string();
    let ts = fmt_ts(now);
    tx.execute(
        "INSERT INTO outbox_entries \
             (id, message_id, conversation_id, event_type, sequence, payload, status, \
              dedupe_id, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?8, ?8)",
        params![
            id,
            message_id,
            conversation_id,
            event_type,
            sequence as i64,
            payload.to_string(),
            dedupe_id,
            ts
        ],
    )
    .map_err(db)?;
    Ok(OutboxEntry {
        id,
        message_id: message_id.to_string(),
        conversation_id: conversation_id.to_string(),
        event_type: event_type.to_string(),
        sequence,
        payload,
        status: OutboxStatus::Pending,
        dedupe_id,
        created_at: now,
        updated_at: now,
        dispatched_at: None,
        error_message: None,
    })
}

fn entry_from_row(row: &rusqlite::Row<'_>) -> Result<OutboxEntry, StoreError> {
    let payload_raw: String = row.get(5).map_err(db)?;
    let status_raw: String = row.get(6).map_err(db)?;
    let created_raw: String = row.get(8).map_err(db)?;
    let updated_raw: String = row.get(9).map_err(db)?;
    let dispatched_raw: Option<String> = row.get(10).map_err(db)?;
    Ok(OutboxEntry {
        id: row.get(0).map_err(db)?,
        message_id: row.get(1).map_err(db)?,
        conversation_id: row.get(2).map_err(db)?,
        event_type: row.get(3).map_err(db)?,
        sequence: row.get::<_, i64>(4).map(|v| v.max(0) as u64).map_err(db)?,
        payload: serde_json::from_str(&payload_raw).map_err(db)?,
        status: OutboxStatus::parse(&status_raw)
            .ok_or_else(|| StoreError::Database(anyhow::anyhow!("unknown status `{status_raw}`")))?,
        dedupe_id: row.get(7).map_err(db)?,
        created_at: parse_ts(&created_raw)?,
        updated_at: parse_ts(&updated_raw)?,
        dispatched_at: dispatched_raw.as_deref().map(parse_ts).transpose()?,
        error_message: row.get(11).map_err(db)?,
    })
}

fn select_entries(
    conn: &Connection,
    where_clause: &str,
    order_clause: &str,
    limit: usize,
) -> Result<Vec<OutboxEntry>, StoreError> {
    let sql = format!(
        "SELECT {ENTRY_COLUMNS} FROM outbox_entries WHERE {where_clause} \
         ORDER BY {order_clause} LIMIT ?1"
    );
    let mut stmt = conn.prepare(&sql).map_err(db)?;
    let mut rows = stmt.query(params![limit as i64]).map_err(db)?;
    let mut entries = Vec::new();
    while let Some(row) = rows.next().map_err(db)? {
        entries.push(entry_from_row(row)?);
    }
    Ok(entries)
}

#[async_trait::async_trait]
impl OutboxStore for SqliteOutboxStore {
    async fn enqueue_message(&self, input: NewMessage) -> Result<EnqueueReceipt, StoreError> {
        self.with_conn(move |conn| {
            let now = OffsetDateTime::now_utc();
            let message_id = Uuid::new_v4().to_string();
            let tx = conn.transaction().map_err(db)?;

            let citations_raw = input
                .citations
                .as_ref()
                .map(|c| serde_json::to_string(c))
                .transpose()
                .map_err(db)?;
            let metadata_raw = serde_json::to_string(&input.metadata).map_err(db)?;
            tx.execute(
                "INSERT INTO messages \
                     (id, conversation_id, role, content, model, citations, metadata, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    message_id,
                    input.conversation_id,
                    input.role.as_str(),
                    input.content,
                    input.model,
                    citations_raw,
                    metadata_raw,
                    fmt_ts(now)
                ],
            )
            .map_err(db)?;

            let message = MessageView {
                id: message_id.clone(),
                conversation_id: input.conversation_id.clone(),
                role: input.role,
                content: input.content,
                model: input.model,
                citations: input.citations,
                metadata: input.metadata,
                created_at: now,
            };
            let event = RealtimeEvent::MessageCreated {
                message: message.clone(),
            };
            let entry = insert_entry(&tx, &input.conversation_id, &message_id, &event, now)?;
            tx.commit().map_err(db)?;

            Ok(EnqueueReceipt {
                message_id,
                sequence: entry.sequence,
                entry,
                message,
            })
        })
        .await
    }

    async fn enqueue_event(
        &self,
        conversation_id: &str,
        message_id: &str,
        event: RealtimeEvent,
    ) -> Result<OutboxEntry, StoreError> {
        let conversation_id = conversation_id.to_string();
        let message_id = message_id.to_string();
        self.with_conn(move |conn| {
            let now = OffsetDateTime::now_utc();
            let tx = conn.transaction().map_err(db)?;
            let entry = insert_entry(&tx, &conversation_id, &message_id, &event, now)?;
            tx.commit().map_err(db)?;
            Ok(entry)
        })
        .await
    }

    async fn pending(&self, limit: usize) -> Vec<OutboxEntry> {
        let result = self
            .with_conn(move |conn| {
                select_entries(conn, "status = 'pending'", "created_at ASC, rowid ASC", limit)
            })
            .await;
        match result {
            Ok(entries) => entries,
            Err(err) => {
                warn!(error = %err, "failed to read pending outbox entries; returning empty batch");
                Vec::new()
            }
        }
    }

    async fn mark_dispatched(&self, id: &str) -> Result<(), StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let ts = fmt_ts(OffsetDateTime::now_utc());
            let updated = conn
                .execute(
                    "UPDATE outbox_entries \
                     SET status = 'dispatched', dispatched_at = ?2, updated_at = ?2 \
                     WHERE id = ?1 AND status = 'pending'",
                    params![id, ts],
                )
                .map_err(db)?;
            if updated == 0 {
                debug!(entry_id = %id, "outbox entry already resolved; dispatch mark skipped");
            }
            Ok(())
        })
        .await
    }

    async fn mark_failed(&self, id: &str, reason: &str) -> Result<(), StoreError> {
        let id = id.to_string();
        let reason = reason.to_string();
        self.with_conn(move |conn| {
            let ts = fmt_ts(OffsetDateTime::now_utc());
            let updated = conn
                .execute(
                    "UPDATE outbox_entries \
                     SET status = 'failed', error_message = ?3, updated_at = ?2 \
                     WHERE id = ?1 AND status = 'pending'",
                    params![id, ts, reason],
                )
                .map_err(db)?;
            if updated == 0 {
                debug!(entry_id = %id, "outbox entry already resolved; failure mark skipped");
            }
            Ok(())
        })
        .await
    }

    async fn failed(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError> {
        self.with_conn(move |conn| {
            select_entries(conn, "status = 'failed'", "updated_at DESC, rowid DESC", limit)
        })
        .await
    }

    async fn entry(&self, id: &str) -> Result<Option<OutboxEntry>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {ENTRY_COLUMNS} FROM outbox_entries WHERE id = ?1");
            let mut stmt = conn.prepare(&sql).map_err(db)?;
            let mut rows = stmt.query(params![id]).map_err(db)?;
            match rows.next().map_err(db)? {
                Some(row) => Ok(Some(entry_from_row(row)?)),
                None => Ok(None),
            }
        })
        .await
    }
}
