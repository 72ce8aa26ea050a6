use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

pub const TASK_PENDING: &str = "pending";
pub const TASK_PROCESSING: &str = "processing";
pub const TASK_SUCCEEDED: &str = "succeeded";
pub const TASK_DEAD: &str = "dead";

/// A webhook delivery that failed during an ingestion cycle and waits for
/// the retry worker.
///
/// The rendered Discord payload is stored as-is so a retransmit sends exactly
/// what the first attempt sent.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DeliveryTask {
    /// Primary key (UUID)
    pub id: String,

    pub webhook_id: String,

    /// Destination URL captured at enqueue time.
    pub webhook_url: String,

    /// Event kind that produced the message ('campaign_started', 'new_drop', ...)
    pub event_kind: String,

    /// JSON-serialized `WebhookMessage`.
    pub payload_json: String,

    pub attempts: i32,
    pub max_attempts: i32,

    /// Timestamp when the task becomes eligible for the next retry.
    pub next_attempt_at: NaiveDateTime,

    /// If present and <= now, the task is stale and goes straight to 'dead'.
    pub expires_at: Option<NaiveDateTime>,

    pub last_error: Option<String>,

    /// 'pending', 'processing', 'succeeded' or 'dead'
    pub status: String,

    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDeliveryTask {
    pub webhook_id: String,
    pub webhook_url: String,
    pub event_kind: String,
    pub payload_json: String,
    pub last_error: Option<String>,

    /// Defaults to 5 when omitted.
    pub max_attempts: Option<i32>,

    /// Defaults to now when omitted.
    pub next_attempt_at: Option<NaiveDateTime>,

    pub expires_at: Option<NaiveDateTime>,
}
