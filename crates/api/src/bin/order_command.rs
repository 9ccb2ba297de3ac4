use anyhow::Context;

use orderflow_api::app::{build_command_app, shutdown_signal, CommandServices};
use orderflow_infra::CommandServiceConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    orderflow_observability::init("order-command");

    let config = CommandServiceConfig::from_env()?;
    let services = CommandServices::redis(&config).context("failed to configure broker")?;
    let app = build_command_app(services);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;

    tracing::info!(
        addr = %listener.local_addr()?,
        topic = %config.broker.topic,
        "command service listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("command service stopped");
    Ok(())
}
