use std::time::Duration;

use sqlx::SqlitePool;

use crate::db::models::{
    CreateOwnerSubscription, CreateSubscription, CreateWebhook, OwnerSubscription, Subscription,
    Webhook,
};
use crate::db::{
    OwnerSubscriptionRepository, SnapshotRepository, SubscriptionRepository, WebhookRepository,
};
use crate::error::{AppError, AppResult};
use crate::services::delivery::{deliver_one, DeliverySink};
use crate::services::discord::DiscordWebhookSink;
use crate::services::dispatcher::Dispatcher;
use crate::services::format::mask_webhook_url;

const DISCORD_WEBHOOK_HOSTS: [&str; 6] = [
    "discord.com",
    "ptb.discord.com",
    "canary.discord.com",
    "discordapp.com",
    "ptb.discordapp.com",
    "canary.discordapp.com",
];

const MAX_WEBHOOK_NAME_LEN: usize = 100;

pub struct WebhookService;

impl WebhookService {
    /// Accept only `https://{discord host}/api/webhooks/{id}/{token}` URLs.
    pub fn validate_webhook_url(raw: &str) -> AppResult<()> {
        let url = url::Url::parse(raw.trim())
            .map_err(|_| AppError::Validation("Webhook URL is not a valid URL".to_string()))?;

        if url.scheme() != "https" {
            return Err(AppError::Validation(
                "Webhook URL must use https".to_string(),
            ));
        }

        let host = url.host_str().unwrap_or_default().to_lowercase();
        if !DISCORD_WEBHOOK_HOSTS.contains(&host.as_str()) {
            return Err(AppError::Validation(
                "Webhook URL must point at discord.com".to_string(),
            ));
        }

        let mut segments = url
            .path()
            .strip_prefix("/api/webhooks/")
            .ok_or_else(|| {
                AppError::Validation("Webhook URL path must start with /api/webhooks/".to_string())
            })?
            .split('/')
            .filter(|s| !s.is_empty());
        match (segments.next(), segments.next()) {
            (Some(_id), Some(_token)) => Ok(()),
            _ => Err(AppError::Validation(
                "Webhook URL must contain a webhook id and token".to_string(),
            )),
        }
    }

    /// Validate and store a webhook.
    ///
    /// With `verify` set the URL is fetched first; Discord's name for the
    /// webhook is used when the request has none.
    pub async fn register(
        pool: &SqlitePool,
        discord: &DiscordWebhookSink,
        verify: bool,
        name: Option<String>,
        url: String,
    ) -> AppResult<Webhook> {
        let url = url.trim().to_string();
        Self::validate_webhook_url(&url)?;

        let mut name = name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty());

        if verify {
            let info = discord.fetch_webhook_info(&url).await.map_err(|e| {
                tracing::warn!(
                    "Webhook verification failed for {}: {}",
                    mask_webhook_url(&url),
                    e
                );
                AppError::Validation("Discord did not accept this webhook URL".to_string())
            })?;
            if name.is_none() {
                name = info.name.filter(|n| !n.trim().is_empty());
            }
        }

        let name = name.ok_or_else(|| AppError::Validation("Webhook name is required".to_string()))?;
        if name.chars().count() > MAX_WEBHOOK_NAME_LEN {
            return Err(AppError::Validation(format!(
                "Webhook name must be at most {} characters",
                MAX_WEBHOOK_NAME_LEN
            )));
        }

        let webhook = WebhookRepository::create(pool, CreateWebhook { name, url }).await?;
        tracing::info!(
            "Registered webhook {} ({})",
            webhook.id,
            mask_webhook_url(&webhook.url)
        );
        Ok(webhook)
    }

    pub async fn get(pool: &SqlitePool, webhook_id: &str) -> AppResult<Webhook> {
        WebhookRepository::find_by_id(pool, webhook_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Webhook {} not found", webhook_id)))
    }

    /// Send the test message right away, bypassing the retry queue.
    pub async fn send_test(
        pool: &SqlitePool,
        sink: &dyn DeliverySink,
        dispatcher: &Dispatcher,
        webhook_id: &str,
        timeout: Duration,
    ) -> AppResult<()> {
        let webhook = Self::get(pool, webhook_id).await?;
        let message = dispatcher.test_message(&webhook.name);
        deliver_one(sink, &webhook.url, &message, timeout).await?;
        tracing::info!("Test message sent to webhook {}", webhook.id);
        Ok(())
    }

    /// Subscribe a webhook to a game that has been ingested at least once.
    pub async fn subscribe(
        pool: &SqlitePool,
        snapshots: &dyn SnapshotRepository,
        webhook_id: &str,
        sub: CreateSubscription,
    ) -> AppResult<Subscription> {
        Self::get(pool, webhook_id).await?;

        if sub.game_id.trim().is_empty() {
            return Err(AppError::Validation("game_id is required".to_string()));
        }
        if !snapshots.exists(&sub.game_id).await? {
            return Err(AppError::NotFound(format!("Game {} not found", sub.game_id)));
        }

        SubscriptionRepository::create(pool, webhook_id, sub).await
    }

    /// Subscribe a webhook to every game of an organization that has been
    /// ingested at least once.
    pub async fn subscribe_owner(
        pool: &SqlitePool,
        webhook_id: &str,
        sub: CreateOwnerSubscription,
    ) -> AppResult<OwnerSubscription> {
        Self::get(pool, webhook_id).await?;

        if sub.organization_id.trim().is_empty() {
            return Err(AppError::Validation("organization_id is required".to_string()));
        }
        if !OwnerSubscriptionRepository::organization_exists(pool, &sub.organization_id).await? {
            return Err(AppError::NotFound(format!(
                "Organization {} not found",
                sub.organization_id
            )));
        }

        OwnerSubscriptionRepository::create(pool, webhook_id, sub).await
    }
}
