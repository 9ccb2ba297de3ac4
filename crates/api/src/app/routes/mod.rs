use axum::routing::{get, post};
use axum::Router;

pub mod orders;
pub mod system;

/// Routes of the command service.
pub fn command_router() -> Router {
    Router::new()
        .route("/health", get(system::health))
        .route("/orders", post(orders::create_order))
}

/// Routes of the query service.
pub fn query_router() -> Router {
    Router::new()
        .route("/health", get(system::applier_health))
        .route("/ready", get(system::ready))
        .route("/orders", get(orders::list_orders))
        .route("/orders/:id", get(orders::get_order))
}
