//! Shared fixtures for unit tests.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use crate::db::models::{
    Benefit, CampaignSnapshot, DropCampaign, DropSnapshot, Game, GameSnapshot, SubscriptionTarget,
    TimeBasedDrop,
};
use crate::error::{AppError, AppResult};
use crate::services::delivery::DeliverySink;
use crate::services::discord::WebhookMessage;

/// Midnight UTC on the given day.
pub fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap()
}

pub fn game(id: &str) -> Game {
    Game {
        id: id.to_string(),
        name: format!("Game {}", id),
        slug: Some(format!("game-{}", id)),
        box_art_url: None,
        organization_id: None,
    }
}

pub fn game_snapshot(
    game_id: &str,
    taken_at: DateTime<Utc>,
    campaigns: Vec<CampaignSnapshot>,
) -> GameSnapshot {
    GameSnapshot {
        game: game(game_id),
        organization: None,
        taken_at,
        campaigns,
    }
}

pub fn campaign_entry(
    game_id: &str,
    id: &str,
    starts_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
    drops: Vec<DropSnapshot>,
) -> CampaignSnapshot {
    CampaignSnapshot {
        campaign: DropCampaign {
            id: id.to_string(),
            game_id: game_id.to_string(),
            name: format!("Campaign {}", id),
            description: None,
            status_override: None,
            starts_at,
            ends_at,
            details_url: None,
            account_link_url: None,
            image_url: None,
        },
        drops,
    }
}

pub fn drop_entry(campaign_id: &str, id: &str, minutes: i64, benefits: Vec<Benefit>) -> DropSnapshot {
    DropSnapshot {
        drop: TimeBasedDrop {
            id: id.to_string(),
            campaign_id: campaign_id.to_string(),
            name: format!("Drop {}", id),
            required_minutes_watched: minutes,
        },
        benefits,
    }
}

pub fn benefit(drop_id: &str, id: &str) -> Benefit {
    Benefit {
        id: id.to_string(),
        drop_id: drop_id.to_string(),
        name: format!("Benefit {}", id),
        image_url: None,
        entitlement_limit: None,
    }
}

pub fn target(
    webhook_id: &str,
    game_id: &str,
    notify_new_drop: bool,
    notify_campaign_live: bool,
    webhook_created_at: DateTime<Utc>,
) -> SubscriptionTarget {
    SubscriptionTarget {
        webhook_id: webhook_id.to_string(),
        webhook_name: format!("Webhook {}", webhook_id),
        webhook_url: format!("https://discord.com/api/webhooks/{}/token", webhook_id),
        webhook_created_at,
        game_id: game_id.to_string(),
        notify_new_drop,
        notify_campaign_live,
    }
}

/// Fresh in-memory database with migrations applied.
pub async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

/// Sink that records every call and fails or stalls for configured URLs.
#[derive(Default)]
pub struct RecordingSink {
    pub calls: Mutex<Vec<(String, WebhookMessage)>>,
    failing: HashSet<String>,
    rejecting: HashSet<String>,
    stalling: HashSet<String>,
    delay: Option<Duration>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_for(mut self, url: &str) -> Self {
        self.failing.insert(url.to_string());
        self
    }

    /// Calls to `url` fail the way Discord answers for a deleted webhook.
    pub fn rejecting_for(mut self, url: &str) -> Self {
        self.rejecting.insert(url.to_string());
        self
    }

    /// Calls to `url` never complete.
    pub fn stalling_for(mut self, url: &str) -> Self {
        self.stalling.insert(url.to_string());
        self
    }

    /// Every call sleeps this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn urls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(url, _)| url.clone())
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl DeliverySink for RecordingSink {
    async fn deliver(&self, webhook_url: &str, payload: &WebhookMessage) -> AppResult<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.stalling.contains(webhook_url) {
            futures::future::pending::<()>().await;
        }
        self.calls
            .lock()
            .unwrap()
            .push((webhook_url.to_string(), payload.clone()));
        if self.failing.contains(webhook_url) {
            return Err(AppError::Discord(
                "Discord webhook error (503): unavailable".to_string(),
            ));
        }
        if self.rejecting.contains(webhook_url) {
            return Err(AppError::Discord(
                "Discord webhook error (404): Unknown Webhook".to_string(),
            ));
        }
        Ok(())
    }
}
