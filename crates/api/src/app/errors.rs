use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use orderflow_infra::PublishErrorKind;

use crate::app::command::CreateOrderError;

pub fn create_order_error_to_response(err: CreateOrderError) -> axum::response::Response {
    match err {
        CreateOrderError::Validation(e) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string())
        }
        CreateOrderError::Publish(e) => match e.kind {
            PublishErrorKind::Unavailable => {
                json_error(StatusCode::SERVICE_UNAVAILABLE, "broker_unavailable", e.to_string())
            }
            PublishErrorKind::Invalid | PublishErrorKind::Rejected => {
                json_error(StatusCode::INTERNAL_SERVER_ERROR, "publish_error", e.to_string())
            }
        },
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
