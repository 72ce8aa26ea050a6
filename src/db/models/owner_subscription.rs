use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A webhook opted into notifications for every game of one organization.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct OwnerSubscription {
    pub webhook_id: String,
    pub organization_id: String,
    pub notify_new_drop: bool,
    pub notify_campaign_live: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOwnerSubscription {
    pub organization_id: String,
    pub notify_new_drop: Option<bool>,
    pub notify_campaign_live: Option<bool>,
}

/// An owner subscription joined with its webhook.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct OwnerSubscriptionTarget {
    pub webhook_id: String,
    pub webhook_name: String,
    pub webhook_url: String,
    pub webhook_created_at: DateTime<Utc>,
    pub organization_id: String,
    pub notify_new_drop: bool,
    pub notify_campaign_live: bool,
}

impl OwnerSubscriptionTarget {
    /// The same webhook and toggles, scoped to one game of the organization.
    pub fn for_game(&self, game_id: &str) -> super::SubscriptionTarget {
        super::SubscriptionTarget {
            webhook_id: self.webhook_id.clone(),
            webhook_name: self.webhook_name.clone(),
            webhook_url: self.webhook_url.clone(),
            webhook_created_at: self.webhook_created_at,
            game_id: game_id.to_string(),
            notify_new_drop: self.notify_new_drop,
            notify_campaign_live: self.notify_campaign_live,
        }
    }
}
