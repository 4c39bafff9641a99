//! Tracing setup for Careline binaries.
//!
//! Filtering comes from `RUST_LOG` (default `info`); set
//! `CARELINE_LOG_JSON=true` for JSON log lines in container environments.

use std::sync::OnceLock;

use anyhow::Result;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

static INIT: OnceLock<()> = OnceLock::new();

/// Installs the shared tracing subscriber. Safe to call more than once; only
/// the first call wins.
pub fn install(service_name: &str) -> Result<()> {
    if INIT.get().is_some() {
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json_logs = std::env::var("CARELINE_LOG_JSON")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let fmt_layer = if json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .ok();

    INIT.set(()).ok();
    tracing::debug!(service = service_name, "telemetry installed");
    Ok(())
}
