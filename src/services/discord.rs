use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AppError, AppResult};
use crate::services::delivery::DeliverySink;
use crate::services::format::mask_webhook_url;

/// Rate limits shorter than this are waited out inline, longer ones go back to the caller.
const MAX_INLINE_RETRY_AFTER_SECS: f64 = 2.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscordEmbed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<EmbedThumbnail>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<EmbedAuthor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<EmbedField>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedFooter {
    pub text: String,
    pub icon_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedThumbnail {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedAuthor {
    pub name: String,
    pub url: Option<String>,
    pub icon_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub inline: bool,
}

/// Body of `POST {webhook_url}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookMessage {
    pub content: Option<String>,
    pub username: Option<String>,
    pub avatar_url: Option<String>,
    pub embeds: Option<Vec<DiscordEmbed>>,
}

/// What Discord returns for `GET {webhook_url}`.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscordWebhookInfo {
    pub id: String,
    pub name: Option<String>,
    pub channel_id: Option<String>,
    pub guild_id: Option<String>,
}

impl DiscordEmbed {
    pub fn new() -> Self {
        Self {
            title: None,
            description: None,
            url: None,
            color: None,
            timestamp: None,
            footer: None,
            thumbnail: None,
            author: None,
            fields: None,
        }
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn color(mut self, color: u32) -> Self {
        self.color = Some(color);
        self
    }

    pub fn timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }

    pub fn footer(mut self, text: impl Into<String>, icon_url: Option<String>) -> Self {
        self.footer = Some(EmbedFooter {
            text: text.into(),
            icon_url,
        });
        self
    }

    pub fn thumbnail(mut self, url: impl Into<String>) -> Self {
        self.thumbnail = Some(EmbedThumbnail { url: url.into() });
        self
    }

    pub fn author(
        mut self,
        name: impl Into<String>,
        url: Option<String>,
        icon_url: Option<String>,
    ) -> Self {
        self.author = Some(EmbedAuthor {
            name: name.into(),
            url,
            icon_url,
        });
        self
    }

    pub fn field(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
        inline: bool,
    ) -> Self {
        let field = EmbedField {
            name: name.into(),
            value: value.into(),
            inline,
        };
        match &mut self.fields {
            Some(fields) => fields.push(field),
            None => self.fields = Some(vec![field]),
        }
        self
    }
}

impl Default for DiscordEmbed {
    fn default() -> Self {
        Self::new()
    }
}

// Color constants for embeds
pub mod colors {
    pub const TWITCH_PURPLE: u32 = 0x9146FF;
    pub const SUCCESS: u32 = 0x57F287;
    pub const INFO: u32 = 0x5865F2;
}

/// Delivers rendered messages to Discord webhooks over HTTPS.
#[derive(Clone)]
pub struct DiscordWebhookSink {
    client: reqwest::Client,
}

impl DiscordWebhookSink {
    pub fn new(timeout: Duration) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Discord(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    /// Parse retry_after from a Discord rate limit error response
    fn parse_retry_after(error_text: &str) -> Option<f64> {
        if let Ok(json) = serde_json::from_str::<Value>(error_text) {
            if let Some(retry_after) = json.get("retry_after") {
                return retry_after.as_f64();
            }
        }
        None
    }

    async fn post_once(
        &self,
        webhook_url: &str,
        message: &WebhookMessage,
    ) -> AppResult<Result<(), (reqwest::StatusCode, String)>> {
        let response = self
            .client
            .post(webhook_url)
            .header("Content-Type", "application/json")
            .json(message)
            .send()
            .await
            .map_err(|e| {
                AppError::Discord(format!(
                    "Failed to send webhook message: {}",
                    e.without_url()
                ))
            })?;

        if response.status().is_success() {
            return Ok(Ok(()));
        }

        let status = response.status();
        let error_text = response.text().await.unwrap_or_default();
        Ok(Err((status, error_text)))
    }

    /// Send a message via webhook. A short 429 is waited out and retried once.
    pub async fn send_webhook_message(
        &self,
        webhook_url: &str,
        message: &WebhookMessage,
    ) -> AppResult<()> {
        let mut retried = false;
        loop {
            match self.post_once(webhook_url, message).await? {
                Ok(()) => return Ok(()),
                Err((status, error_text)) => {
                    if status == reqwest::StatusCode::TOO_MANY_REQUESTS && !retried {
                        if let Some(retry_after) = Self::parse_retry_after(&error_text) {
                            if retry_after <= MAX_INLINE_RETRY_AFTER_SECS {
                                tracing::warn!(
                                    "Discord rate limit hit for {}, waiting {:.2}s before retry",
                                    mask_webhook_url(webhook_url),
                                    retry_after
                                );
                                tokio::time::sleep(Duration::from_secs_f64(retry_after.max(0.0)))
                                    .await;
                                retried = true;
                                continue;
                            }
                        }
                    }
                    return Err(AppError::Discord(format!(
                        "Discord webhook error ({}): {}",
                        status.as_u16(),
                        error_text
                    )));
                }
            }
        }
    }

    /// Fetch the webhook object. Fails when the URL does not point at a live webhook.
    pub async fn fetch_webhook_info(&self, webhook_url: &str) -> AppResult<DiscordWebhookInfo> {
        let response = self
            .client
            .get(webhook_url)
            .send()
            .await
            .map_err(|e| AppError::Discord(format!("Failed to fetch webhook: {}", e.without_url())))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::Discord(format!(
                "Discord webhook error ({}): {}",
                status.as_u16(),
                error_text
            )));
        }

        let info = response
            .json::<DiscordWebhookInfo>()
            .await
            .map_err(|e| AppError::Discord(format!("Unexpected webhook response: {}", e)))?;
        Ok(info)
    }
}

#[async_trait]
impl DeliverySink for DiscordWebhookSink {
    async fn deliver(&self, webhook_url: &str, payload: &WebhookMessage) -> AppResult<()> {
        self.send_webhook_message(webhook_url, payload).await
    }
}
