use std::time::Duration;

use anyhow::Result;
use careline_core::{EVENT_SUBJECT_PREFIX, TOKEN_SUBJECT_PREFIX};

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub env: String,
    pub nats_url: String,
    pub db_path: String,
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub token_prefix: String,
    pub event_prefix: String,
}

impl RelayConfig {
    pub fn from_env() -> Result<Self> {
        let env = std::env::var("CARELINE_ENV").unwrap_or_else(|_| "dev".into());
        let nats_url = std::env::var("NATS_URL").unwrap_or_else(|_| "nats://127.0.0.1:4222".into());
        let db_path = std::env::var("CARELINE_DB_PATH").unwrap_or_else(|_| "careline.db".into());
        let poll_interval_ms = std::env::var("OUTBOX_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(250)
            .max(10);
        let batch_size = std::env::var("OUTBOX_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(25)
            .max(1);
        let token_prefix = std::env::var("TOKEN_SUBJECT_PREFIX")
            .unwrap_or_else(|_| TOKEN_SUBJECT_PREFIX.to_string());
        let event_prefix = std::env::var("EVENT_SUBJECT_PREFIX")
            .unwrap_or_else(|_| EVENT_SUBJECT_PREFIX.to_string());

        Ok(Self {
            env,
            nats_url,
            db_path,
            poll_interval: Duration::from_millis(poll_interval_ms),
            batch_size,
            token_prefix,
            event_prefix,
        })
    }
}
