use anyhow::Context;

use orderflow_api::app::{build_query_app, shutdown_signal, QueryServices};
use orderflow_infra::event_bus::RedisStreamsEventBus;
use orderflow_infra::QueryServiceConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    orderflow_observability::init("order-query");

    let config = QueryServiceConfig::from_env()?;
    let bus = RedisStreamsEventBus::from_config(&config.broker)
        .context("failed to configure broker")?;

    let (services, applier) =
        QueryServices::start(bus, config.applier.clone()).context("failed to start applier")?;
    let app = build_query_app(services);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;

    tracing::info!(
        addr = %listener.local_addr()?,
        topic = %config.broker.topic,
        group = %config.applier.group,
        consumer = %config.applier.consumer,
        claim_idle = ?config.broker.claim_idle,
        "query service listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop the applier only once no request can reach the store any more.
    tokio::task::spawn_blocking(move || applier.shutdown())
        .await
        .context("applier shutdown task failed")?;

    tracing::info!("query service stopped");
    Ok(())
}
