use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::db::DeliveryQueueRepository;
use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: String,
    /// Retry queue size per status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_queue: Option<BTreeMap<String, i64>>,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (status_code, status, delivery_queue) =
        match DeliveryQueueRepository::count_by_status(&state.db).await {
            Ok(counts) => (
                StatusCode::OK,
                "healthy",
                Some(counts.into_iter().collect::<BTreeMap<_, _>>()),
            ),
            Err(e) => {
                tracing::error!("Health check failed: {:?}", e);
                (StatusCode::SERVICE_UNAVAILABLE, "unhealthy", None)
            }
        };

    let response = HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        delivery_queue,
    };

    (status_code, Json(response))
}
