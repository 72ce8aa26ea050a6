use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A webhook opted into notifications for one game.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct Subscription {
    pub webhook_id: String,
    pub game_id: String,
    pub notify_new_drop: bool,
    pub notify_campaign_live: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSubscription {
    pub game_id: String,
    pub notify_new_drop: Option<bool>,
    pub notify_campaign_live: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UpdateSubscription {
    pub notify_new_drop: Option<bool>,
    pub notify_campaign_live: Option<bool>,
}

/// A subscription joined with the webhook it delivers to.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct SubscriptionTarget {
    pub webhook_id: String,
    pub webhook_name: String,
    pub webhook_url: String,
    pub webhook_created_at: DateTime<Utc>,
    pub game_id: String,
    pub notify_new_drop: bool,
    pub notify_campaign_live: bool,
}
