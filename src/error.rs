use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Webhook {webhook_id} is already subscribed to game {game_id}")]
    DuplicateSubscription { webhook_id: String, game_id: String },

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Discord error: {0}")]
    Discord(String),

    /// Malformed ingestion input. The cycle is aborted and stored state is kept.
    #[error("Invalid snapshot: {0}")]
    SnapshotInvalid(String),

    /// A single outbound message could not be delivered.
    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut details = None;
        let (status, code, message) = match &self {
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            AppError::DuplicateSubscription {
                webhook_id,
                game_id,
            } => {
                details = Some(serde_json::json!({
                    "webhook_id": webhook_id,
                    "game_id": game_id,
                }));
                (
                    StatusCode::CONFLICT,
                    "DUPLICATE_SUBSCRIPTION",
                    self.to_string(),
                )
            }
            AppError::Validation(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "VALIDATION_ERROR",
                msg.clone(),
            ),
            AppError::SnapshotInvalid(msg) => {
                tracing::error!("Invalid snapshot: {}", msg);
                (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "SNAPSHOT_INVALID",
                    msg.clone(),
                )
            }
            AppError::DeliveryFailed(msg) => {
                tracing::warn!("Delivery failed: {}", msg);
                (StatusCode::BAD_GATEWAY, "DELIVERY_FAILED", msg.clone())
            }
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "A database error occurred".to_string(),
                )
            }
            AppError::Discord(msg) => {
                tracing::error!("Discord error: {}", msg);
                (StatusCode::BAD_GATEWAY, "DISCORD_ERROR", msg.clone())
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message,
                details,
            },
        };

        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
