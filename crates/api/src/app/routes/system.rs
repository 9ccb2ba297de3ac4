use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};

use orderflow_infra::HealthSnapshot;

use crate::app::dto;
use crate::app::query::QueryServices;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// Liveness plus applier status and counters; always 200 while the process runs.
pub async fn applier_health(
    Extension(services): Extension<Arc<QueryServices>>,
) -> Json<HealthSnapshot> {
    Json(services.health().snapshot())
}

pub async fn ready(Extension(services): Extension<Arc<QueryServices>>) -> axum::response::Response {
    let ready = services.health().is_ready();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(dto::ReadinessResponse {
            ready,
            health: services.health().snapshot(),
        }),
    )
        .into_response()
}
