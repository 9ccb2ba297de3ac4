use serde::{Deserialize, Serialize};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    pub id: String,
    pub customer: String,
}

// -------------------------
// Response DTOs
// -------------------------

/// Collection envelope; leaves room for paging fields.
#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(flatten)]
    pub health: orderflow_infra::HealthSnapshot,
}
