//! HTTP application wiring (Axum routers + service wiring).
//!
//! - `command.rs`: write-side services (validation + publisher over a broker)
//! - `query.rs`: read-side services (store, read gateway, applier)
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request/response DTOs
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router};
use tower::ServiceBuilder;

pub mod command;
pub mod dto;
pub mod errors;
pub mod query;
pub mod routes;

pub use command::{CommandServices, CreateOrderError};
pub use query::QueryServices;

/// Router of the command service (`POST /orders`, `GET /health`).
pub fn build_command_app(services: CommandServices) -> Router {
    routes::command_router().layer(ServiceBuilder::new().layer(Extension(Arc::new(services))))
}

/// Router of the query service (`GET /orders`, `GET /orders/:id`, `GET /health`, `GET /ready`).
pub fn build_query_app(services: QueryServices) -> Router {
    routes::query_router().layer(ServiceBuilder::new().layer(Extension(Arc::new(services))))
}

/// Resolves on Ctrl-C; used for graceful shutdown of both binaries.
pub async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for Ctrl-C; shutting down");
    }
    tracing::info!("shutdown requested");
}
