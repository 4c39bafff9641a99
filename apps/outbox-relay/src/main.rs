use std::sync::Arc;

use anyhow::Result;
use careline_bus::{NatsBusClient, StreamSpec};
use careline_outbox::sqlite_store;
use careline_relay::{RelayConfig, RelayWorker, SubjectRouter};
use careline_telemetry::install as init_telemetry;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_telemetry("careline-relay")?;

    let config = RelayConfig::from_env()?;
    let store = sqlite_store(&config.db_path)?;
    let client = async_nats::connect(&config.nats_url).await?;
    let bus = NatsBusClient::ensure(
        client,
        StreamSpec::new(
            format!("careline-rt-{}", config.env),
            vec![
                format!("{}.>", config.token_prefix),
                format!("{}.>", config.event_prefix),
            ],
        ),
    )
    .await?;

    let router = SubjectRouter::new(&config.env, &config.token_prefix, &config.event_prefix);
    let worker = Arc::new(RelayWorker::new(
        store,
        Arc::new(bus),
        router,
        config.poll_interval,
        config.batch_size,
    ));

    let handle = Arc::clone(&worker).spawn();
    info!(nats_url = %config.nats_url, db_path = %config.db_path, "careline relay running");

    tokio::signal::ctrl_c().await.ok();
    worker.stop();
    handle.await.ok();
    Ok(())
}
