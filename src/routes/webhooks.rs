use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post, MethodRouter},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::models::{
    CreateOwnerSubscription, CreateSubscription, OwnerSubscription, Subscription,
    UpdateSubscription, Webhook,
};
use crate::db::{OwnerSubscriptionRepository, SubscriptionRepository, WebhookRepository};
use crate::error::{AppError, AppResult};
use crate::services::format::mask_webhook_url;
use crate::services::webhooks::WebhookService;
use crate::AppState;

/// `POST /` on its own so it can carry the registration rate limiter.
pub fn create_route() -> MethodRouter<Arc<AppState>> {
    post(create_webhook)
}

pub fn router(create: MethodRouter<Arc<AppState>>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/", create.merge(get(list_webhooks)))
        .route("/:id", delete(delete_webhook))
        .route("/:id/test", post(test_webhook))
        .route(
            "/:id/subscriptions",
            get(list_subscriptions).post(create_subscription),
        )
        .route(
            "/:id/subscriptions/:game_id",
            get(get_subscription)
                .patch(update_subscription)
                .delete(delete_subscription),
        )
        .route("/:id/owners", get(list_owners).post(create_owner))
        .route(
            "/:id/owners/:organization_id",
            get(get_owner).patch(update_owner).delete(delete_owner),
        )
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateWebhookRequest {
    pub name: Option<String>,
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub id: String,
    pub name: String,
    /// Token part replaced, the full URL is a credential.
    pub url: String,
    pub created_at: DateTime<Utc>,
}

impl From<Webhook> for WebhookResponse {
    fn from(webhook: Webhook) -> Self {
        Self {
            url: mask_webhook_url(&webhook.url),
            id: webhook.id,
            name: webhook.name,
            created_at: webhook.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TestWebhookResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub game_id: String,
    pub notify_new_drop: Option<bool>,
    pub notify_campaign_live: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateSubscriptionRequest {
    pub notify_new_drop: Option<bool>,
    pub notify_campaign_live: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    pub game_id: String,
    pub notify_new_drop: bool,
    pub notify_campaign_live: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Subscription> for SubscriptionResponse {
    fn from(sub: Subscription) -> Self {
        Self {
            game_id: sub.game_id,
            notify_new_drop: sub.notify_new_drop,
            notify_campaign_live: sub.notify_campaign_live,
            created_at: sub.created_at,
            updated_at: sub.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateOwnerRequest {
    pub organization_id: String,
    pub notify_new_drop: Option<bool>,
    pub notify_campaign_live: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct OwnerResponse {
    pub organization_id: String,
    pub notify_new_drop: bool,
    pub notify_campaign_live: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<OwnerSubscription> for OwnerResponse {
    fn from(sub: OwnerSubscription) -> Self {
        Self {
            organization_id: sub.organization_id,
            notify_new_drop: sub.notify_new_drop,
            notify_campaign_live: sub.notify_campaign_live,
            created_at: sub.created_at,
            updated_at: sub.updated_at,
        }
    }
}

// ============================================================================
// Webhooks
// ============================================================================

async fn list_webhooks(State(state): State<Arc<AppState>>) -> AppResult<Json<Vec<WebhookResponse>>> {
    let webhooks = WebhookRepository::list(&state.db).await?;
    Ok(Json(webhooks.into_iter().map(Into::into).collect()))
}

async fn create_webhook(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateWebhookRequest>,
) -> AppResult<(StatusCode, Json<WebhookResponse>)> {
    let webhook = WebhookService::register(
        &state.db,
        &state.discord,
        state.config.discord.verify_webhooks,
        req.name,
        req.url,
    )
    .await?;

    Ok((StatusCode::CREATED, Json(webhook.into())))
}

async fn delete_webhook(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    if !WebhookRepository::delete(&state.db, &id).await? {
        return Err(AppError::NotFound(format!("Webhook {} not found", id)));
    }
    tracing::info!("Deleted webhook {}", id);
    Ok(StatusCode::NO_CONTENT)
}

/// Send a test message right away. Delivery failures are reported in the body.
async fn test_webhook(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Json<TestWebhookResponse>> {
    let result = WebhookService::send_test(
        &state.db,
        state.sink.as_ref(),
        state.pipeline.dispatcher(),
        &id,
        Duration::from_secs(state.config.delivery.timeout_seconds),
    )
    .await;

    match result {
        Ok(()) => Ok(Json(TestWebhookResponse {
            success: true,
            message: "Test message sent".to_string(),
        })),
        Err(AppError::DeliveryFailed(msg)) => {
            tracing::warn!("Test message to webhook {} failed: {}", id, msg);
            Ok(Json(TestWebhookResponse {
                success: false,
                message: format!("Failed to send test message: {}", msg),
            }))
        }
        Err(e) => Err(e),
    }
}

// ============================================================================
// Subscriptions
// ============================================================================

async fn list_subscriptions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Json<Vec<SubscriptionResponse>>> {
    WebhookService::get(&state.db, &id).await?;
    let subs = SubscriptionRepository::list_for_webhook(&state.db, &id).await?;
    Ok(Json(subs.into_iter().map(Into::into).collect()))
}

async fn create_subscription(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<CreateSubscriptionRequest>,
) -> AppResult<(StatusCode, Json<SubscriptionResponse>)> {
    let sub = WebhookService::subscribe(
        &state.db,
        state.snapshots.as_ref(),
        &id,
        CreateSubscription {
            game_id: req.game_id.trim().to_string(),
            notify_new_drop: req.notify_new_drop,
            notify_campaign_live: req.notify_campaign_live,
        },
    )
    .await?;

    tracing::info!("Webhook {} subscribed to game {}", id, sub.game_id);
    Ok((StatusCode::CREATED, Json(sub.into())))
}

async fn get_subscription(
    State(state): State<Arc<AppState>>,
    Path((id, game_id)): Path<(String, String)>,
) -> AppResult<Json<SubscriptionResponse>> {
    let sub = SubscriptionRepository::find(&state.db, &id, &game_id)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(format!(
                "Webhook {} is not subscribed to game {}",
                id, game_id
            ))
        })?;

    Ok(Json(sub.into()))
}

async fn update_subscription(
    State(state): State<Arc<AppState>>,
    Path((id, game_id)): Path<(String, String)>,
    Json(req): Json<UpdateSubscriptionRequest>,
) -> AppResult<Json<SubscriptionResponse>> {
    let sub = SubscriptionRepository::update_toggles(
        &state.db,
        &id,
        &game_id,
        UpdateSubscription {
            notify_new_drop: req.notify_new_drop,
            notify_campaign_live: req.notify_campaign_live,
        },
    )
    .await?
    .ok_or_else(|| {
        AppError::NotFound(format!(
            "Webhook {} is not subscribed to game {}",
            id, game_id
        ))
    })?;

    Ok(Json(sub.into()))
}

async fn delete_subscription(
    State(state): State<Arc<AppState>>,
    Path((id, game_id)): Path<(String, String)>,
) -> AppResult<StatusCode> {
    if !SubscriptionRepository::delete(&state.db, &id, &game_id).await? {
        return Err(AppError::NotFound(format!(
            "Webhook {} is not subscribed to game {}",
            id, game_id
        )));
    }
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Owner subscriptions
// ============================================================================

fn owner_not_found(id: &str, organization_id: &str) -> AppError {
    AppError::NotFound(format!(
        "Webhook {} is not subscribed to organization {}",
        id, organization_id
    ))
}

async fn list_owners(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Json<Vec<OwnerResponse>>> {
    WebhookService::get(&state.db, &id).await?;
    let subs = OwnerSubscriptionRepository::list_for_webhook(&state.db, &id).await?;
    Ok(Json(subs.into_iter().map(Into::into).collect()))
}

async fn create_owner(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<CreateOwnerRequest>,
) -> AppResult<(StatusCode, Json<OwnerResponse>)> {
    let sub = WebhookService::subscribe_owner(
        &state.db,
        &id,
        CreateOwnerSubscription {
            organization_id: req.organization_id.trim().to_string(),
            notify_new_drop: req.notify_new_drop,
            notify_campaign_live: req.notify_campaign_live,
        },
    )
    .await?;

    tracing::info!("Webhook {} subscribed to organization {}", id, sub.organization_id);
    Ok((StatusCode::CREATED, Json(sub.into())))
}

async fn get_owner(
    State(state): State<Arc<AppState>>,
    Path((id, organization_id)): Path<(String, String)>,
) -> AppResult<Json<OwnerResponse>> {
    let sub = OwnerSubscriptionRepository::find(&state.db, &id, &organization_id)
        .await?
        .ok_or_else(|| owner_not_found(&id, &organization_id))?;
    Ok(Json(sub.into()))
}

async fn update_owner(
    State(state): State<Arc<AppState>>,
    Path((id, organization_id)): Path<(String, String)>,
    Json(req): Json<UpdateSubscriptionRequest>,
) -> AppResult<Json<OwnerResponse>> {
    let sub = OwnerSubscriptionRepository::update_toggles(
        &state.db,
        &id,
        &organization_id,
        UpdateSubscription {
            notify_new_drop: req.notify_new_drop,
            notify_campaign_live: req.notify_campaign_live,
        },
    )
    .await?
    .ok_or_else(|| owner_not_found(&id, &organization_id))?;

    Ok(Json(sub.into()))
}

async fn delete_owner(
    State(state): State<Arc<AppState>>,
    Path((id, organization_id)): Path<(String, String)>,
) -> AppResult<StatusCode> {
    if !OwnerSubscriptionRepository::delete(&state.db, &id, &organization_id).await? {
        return Err(owner_not_found(&id, &organization_id));
    }
    Ok(StatusCode::NO_CONTENT)
}
