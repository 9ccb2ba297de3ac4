use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::Utc;

use orderflow_core::AggregateId;
use orderflow_infra::projections::OrderView;
use orderflow_orders::CreateOrder;

use crate::app::command::CommandServices;
use crate::app::query::QueryServices;
use crate::app::{dto, errors};

pub async fn create_order(
    Extension(services): Extension<Arc<CommandServices>>,
    body: Result<Json<dto::CreateOrderRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_json", rejection.body_text());
        }
    };

    let order_id = match AggregateId::parse(body.id) {
        Ok(id) => id,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", e.to_string()),
    };

    let command = CreateOrder {
        order_id,
        customer: body.customer,
        occurred_at: Utc::now(),
    };

    // Publishing blocks for up to the retry budget.
    match tokio::task::spawn_blocking(move || services.create_order(command)).await {
        Ok(Ok(order)) => (StatusCode::CREATED, Json(order)).into_response(),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "create order failed");
            errors::create_order_error_to_response(e)
        }
        Err(e) => {
            tracing::error!(error = %e, "create order task failed");
            errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "request failed")
        }
    }
}

pub async fn list_orders(
    Extension(services): Extension<Arc<QueryServices>>,
) -> Json<dto::ListResponse<OrderView>> {
    Json(dto::ListResponse {
        items: services.gateway().list_all(),
    })
}

pub async fn get_order(
    Extension(services): Extension<Arc<QueryServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match AggregateId::parse(id) {
        Ok(id) => id,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", e.to_string()),
    };

    match services.gateway().get_one(&id) {
        Some(order) => Json(order).into_response(),
        None => errors::json_error(StatusCode::NOT_FOUND, "not_found", format!("order {id} not found")),
    }
}
