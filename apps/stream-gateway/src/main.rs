use std::sync::Arc;

use anyhow::Result;
use axum::serve;
use careline_bus::{NatsBusClient, StreamSpec};
use careline_gateway::{build_router, GatewayConfig, GatewayState};
use careline_telemetry::install as init_telemetry;
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_telemetry("careline-gateway")?;

    let config = GatewayConfig::from_env()?;
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

    let state = Arc::new(GatewayState {
        bus: Arc::new(bus),
        config: config.clone(),
    });
    let router = build_router(state);
    let listener = TcpListener::bind(config.addr).await?;
    info!("careline gateway listening on {}", config.addr);

    serve(listener, router)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    Ok(())
}
