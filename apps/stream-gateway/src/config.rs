use std::net::SocketAddr;

use anyhow::{Context, Result};
use careline_core::{EVENT_SUBJECT_PREFIX, TOKEN_SUBJECT_PREFIX};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub env: String,
    pub nats_url: String,
    pub addr: SocketAddr,
    pub token_prefix: String,
    pub event_prefix: String,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let env = std::env::var("CARELINE_ENV").unwrap_or_else(|_| "dev".into());
        let nats_url = std::env::var("NATS_URL").unwrap_or_else(|_| "nats://127.0.0.1:4222".into());
        let addr = std::env::var("BIND")
            .unwrap_or_else(|_| "0.0.0.0:8090".into())
            .parse()
            .context("invalid gateway bind address")?;
        let token_prefix = std::env::var("TOKEN_SUBJECT_PREFIX")
            .unwrap_or_else(|_| TOKEN_SUBJECT_PREFIX.to_string());
        let event_prefix = std::env::var("EVENT_SUBJECT_PREFIX")
            .unwrap_or_else(|_| EVENT_SUBJECT_PREFIX.to_string());

        Ok(Self {
            env,
            nats_url,
            addr,
            token_prefix,
            event_prefix,
        })
    }
}
