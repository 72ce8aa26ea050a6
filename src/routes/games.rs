use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;

use crate::db::models::{
    Benefit, CampaignSnapshot, CampaignStatus, DropSnapshot, GameSnapshot,
};
use crate::error::{AppError, AppResult};
use crate::services::format::{minutes_to_hours, time_since, time_until};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_games))
        .route("/:game_id", get(get_game))
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct GameSummary {
    pub id: String,
    pub name: String,
    pub box_art_url: String,
    pub twitch_url: String,
    pub organization: Option<String>,
    pub campaigns: Vec<CampaignSummary>,
}

#[derive(Debug, Serialize)]
pub struct CampaignSummary {
    pub id: String,
    pub name: String,
    pub status: CampaignStatus,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    /// Present while the campaign is upcoming.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub starts_in: Option<String>,
    pub ends_in: String,
}

#[derive(Debug, Serialize)]
pub struct GameDetail {
    pub id: String,
    pub name: String,
    pub slug: Option<String>,
    pub box_art_url: String,
    pub twitch_url: String,
    pub organization: Option<String>,
    pub taken_at: DateTime<Utc>,
    /// How long ago the snapshot was taken, e.g. `5 minutes`.
    pub updated: String,
    pub campaigns: Vec<CampaignDetail>,
}

#[derive(Debug, Serialize)]
pub struct CampaignDetail {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub status: CampaignStatus,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub details_url: Option<String>,
    pub account_link_url: Option<String>,
    pub image_url: Option<String>,
    pub drops: Vec<DropDetail>,
}

#[derive(Debug, Serialize)]
pub struct DropDetail {
    pub id: String,
    pub name: String,
    pub required_minutes_watched: i64,
    pub required: String,
    pub benefits: Vec<BenefitDetail>,
}

#[derive(Debug, Serialize)]
pub struct BenefitDetail {
    pub id: String,
    pub name: String,
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
}

impl From<&Benefit> for BenefitDetail {
    fn from(benefit: &Benefit) -> Self {
        Self {
            id: benefit.id.clone(),
            name: benefit.name.clone(),
            image_url: benefit.image_url.clone(),
            limit: benefit.display_limit(),
        }
    }
}

impl From<&DropSnapshot> for DropDetail {
    fn from(entry: &DropSnapshot) -> Self {
        Self {
            id: entry.drop.id.clone(),
            name: entry.drop.name.clone(),
            required_minutes_watched: entry.drop.required_minutes_watched,
            required: minutes_to_hours(entry.drop.required_minutes_watched),
            benefits: entry.benefits.iter().map(Into::into).collect(),
        }
    }
}

// ============================================================================
// Views
// ============================================================================

fn campaign_summary(entry: &CampaignSnapshot, now: DateTime<Utc>) -> CampaignSummary {
    let campaign = &entry.campaign;
    let status = entry.status_at(now);
    CampaignSummary {
        id: campaign.id.clone(),
        name: campaign.name.clone(),
        status,
        starts_at: campaign.starts_at,
        ends_at: campaign.ends_at,
        starts_in: (status == CampaignStatus::Upcoming)
            .then(|| time_until(campaign.starts_at, now)),
        ends_in: time_until(campaign.ends_at, now),
    }
}

/// Games with at least one campaign that has not expired at `now`, most
/// recently started campaign first. Expired campaigns are left out.
pub fn game_list(snapshots: &[GameSnapshot], now: DateTime<Utc>) -> Vec<GameSummary> {
    let mut games: Vec<(DateTime<Utc>, GameSummary)> = snapshots
        .iter()
        .filter_map(|snapshot| {
            let campaigns: Vec<CampaignSummary> = snapshot
                .campaigns
                .iter()
                .filter(|c| c.status_at(now) != CampaignStatus::Expired)
                .map(|c| campaign_summary(c, now))
                .collect();
            let latest_start = campaigns.iter().map(|c| c.starts_at).max()?;

            Some((
                latest_start,
                GameSummary {
                    id: snapshot.game.id.clone(),
                    name: snapshot.game.name.clone(),
                    box_art_url: snapshot.game.box_art().to_string(),
                    twitch_url: snapshot.game.twitch_url(),
                    organization: snapshot
                        .organization
                        .as_ref()
                        .map(|o| o.display_name().to_string()),
                    campaigns,
                },
            ))
        })
        .collect();

    games.sort_by(|(a_start, a), (b_start, b)| b_start.cmp(a_start).then_with(|| a.id.cmp(&b.id)));
    games.into_iter().map(|(_, game)| game).collect()
}

pub fn game_detail(snapshot: &GameSnapshot, now: DateTime<Utc>) -> GameDetail {
    GameDetail {
        id: snapshot.game.id.clone(),
        name: snapshot.game.name.clone(),
        slug: snapshot.game.slug.clone(),
        box_art_url: snapshot.game.box_art().to_string(),
        twitch_url: snapshot.game.twitch_url(),
        organization: snapshot
            .organization
            .as_ref()
            .map(|o| o.display_name().to_string()),
        taken_at: snapshot.taken_at,
        updated: time_since(snapshot.taken_at, now),
        campaigns: snapshot
            .campaigns
            .iter()
            .map(|entry| {
                let campaign = &entry.campaign;
                CampaignDetail {
                    id: campaign.id.clone(),
                    name: campaign.name.clone(),
                    description: campaign.description.clone(),
                    status: entry.status_at(now),
                    starts_at: campaign.starts_at,
                    ends_at: campaign.ends_at,
                    details_url: campaign.details_url.clone(),
                    account_link_url: campaign.separate_account_link().map(str::to_string),
                    image_url: campaign.image_url.clone(),
                    drops: entry.drops.iter().map(Into::into).collect(),
                }
            })
            .collect(),
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn list_games(State(state): State<Arc<AppState>>) -> AppResult<Json<Vec<GameSummary>>> {
    let ids = state.snapshots.list_game_ids().await?;
    let snapshots: Vec<GameSnapshot> = stream::iter(ids)
        .map(|id| {
            let snapshots = state.snapshots.clone();
            async move { snapshots.load(&id).await }
        })
        .buffered(state.config.ingest.load_concurrency)
        .try_collect::<Vec<_>>()
        .await?
        .into_iter()
        .flatten()
        .collect();

    Ok(Json(game_list(&snapshots, Utc::now())))
}

async fn get_game(
    State(state): State<Arc<AppState>>,
    Path(game_id): Path<String>,
) -> AppResult<Json<GameDetail>> {
    let snapshot = state
        .snapshots
        .load(&game_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Game {} not found", game_id)))?;

    Ok(Json(game_detail(&snapshot, Utc::now())))
}
