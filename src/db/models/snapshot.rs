//! The per-game campaign tree that ingestion produces and the change detector diffs.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Benefit, CampaignStatus, DropCampaign, Game, Organization, TimeBasedDrop};
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropSnapshot {
    pub drop: TimeBasedDrop,
    pub benefits: Vec<Benefit>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignSnapshot {
    pub campaign: DropCampaign,
    pub drops: Vec<DropSnapshot>,
}

impl CampaignSnapshot {
    pub fn find_drop(&self, drop_id: &str) -> Option<&DropSnapshot> {
        self.drops.iter().find(|d| d.drop.id == drop_id)
    }

    pub fn status_at(&self, now: DateTime<Utc>) -> CampaignStatus {
        self.campaign.status_at(now)
    }
}

/// Full state of one game's campaigns at `taken_at`.
///
/// `taken_at` is the clock used to evaluate campaign status within this
/// snapshot, which keeps diffing two snapshots independent of the wall clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameSnapshot {
    pub game: Game,
    pub organization: Option<Organization>,
    pub taken_at: DateTime<Utc>,
    pub campaigns: Vec<CampaignSnapshot>,
}

impl GameSnapshot {
    pub fn empty(game: Game, organization: Option<Organization>, taken_at: DateTime<Utc>) -> Self {
        Self {
            game,
            organization,
            taken_at,
            campaigns: Vec::new(),
        }
    }

    pub fn game_id(&self) -> &str {
        &self.game.id
    }

    pub fn find_campaign(&self, campaign_id: &str) -> Option<&CampaignSnapshot> {
        self.campaigns.iter().find(|c| c.campaign.id == campaign_id)
    }

    /// Campaigns by (start, id); drops by (required minutes, id).
    pub fn normalize(&mut self) {
        self.campaigns.sort_by(|a, b| {
            (a.campaign.starts_at, &a.campaign.id).cmp(&(b.campaign.starts_at, &b.campaign.id))
        });
        for campaign in &mut self.campaigns {
            campaign.drops.sort_by(|a, b| {
                (a.drop.required_minutes_watched, &a.drop.id)
                    .cmp(&(b.drop.required_minutes_watched, &b.drop.id))
            });
        }
    }

    /// Check the structural invariants of the tree.
    pub fn validate(&self) -> AppResult<()> {
        let game_id = self.game.id.as_str();
        if game_id.trim().is_empty() {
            return Err(AppError::SnapshotInvalid("game without an id".to_string()));
        }
        if let (Some(org), Some(org_id)) = (&self.organization, &self.game.organization_id) {
            if &org.id != org_id {
                return Err(AppError::SnapshotInvalid(format!(
                    "game {} references organization {} but carries {}",
                    game_id, org_id, org.id
                )));
            }
        }

        let mut campaign_ids = HashSet::new();
        let mut drop_ids = HashSet::new();

        for entry in &self.campaigns {
            let campaign = &entry.campaign;
            if campaign.id.trim().is_empty() {
                return Err(AppError::SnapshotInvalid(format!(
                    "campaign without an id in game {}",
                    game_id
                )));
            }
            if campaign.game_id != game_id {
                return Err(AppError::SnapshotInvalid(format!(
                    "campaign {} belongs to game {}, not {}",
                    campaign.id, campaign.game_id, game_id
                )));
            }
            if !campaign_ids.insert(campaign.id.as_str()) {
                return Err(AppError::SnapshotInvalid(format!(
                    "duplicate campaign {} in game {}",
                    campaign.id, game_id
                )));
            }
            if campaign.starts_at > campaign.ends_at {
                return Err(AppError::SnapshotInvalid(format!(
                    "campaign {} starts after it ends ({} > {})",
                    campaign.id, campaign.starts_at, campaign.ends_at
                )));
            }

            for drop_entry in &entry.drops {
                let drop = &drop_entry.drop;
                if drop.id.trim().is_empty() {
                    return Err(AppError::SnapshotInvalid(format!(
                        "drop without an id in campaign {}",
                        campaign.id
                    )));
                }
                if drop.campaign_id != campaign.id {
                    return Err(AppError::SnapshotInvalid(format!(
                        "drop {} belongs to campaign {}, not {}",
                        drop.id, drop.campaign_id, campaign.id
                    )));
                }
                if !drop_ids.insert(drop.id.as_str()) {
                    return Err(AppError::SnapshotInvalid(format!(
                        "duplicate drop {} in game {}",
                        drop.id, game_id
                    )));
                }
                if drop.required_minutes_watched < 0 {
                    return Err(AppError::SnapshotInvalid(format!(
                        "drop {} requires a negative watch time ({})",
                        drop.id, drop.required_minutes_watched
                    )));
                }

                let mut benefit_ids = HashSet::new();
                for benefit in &drop_entry.benefits {
                    if benefit.drop_id != drop.id {
                        return Err(AppError::SnapshotInvalid(format!(
                            "benefit {} belongs to drop {}, not {}",
                            benefit.id, benefit.drop_id, drop.id
                        )));
                    }
                    if !benefit_ids.insert(benefit.id.as_str()) {
                        return Err(AppError::SnapshotInvalid(format!(
                            "duplicate benefit {} in drop {}",
                            benefit.id, drop.id
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

/// Every game snapshot produced by one ingestion payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotBatch {
    pub taken_at: DateTime<Utc>,
    pub games: Vec<GameSnapshot>,
}

impl SnapshotBatch {
    pub fn validate(&self) -> AppResult<()> {
        let mut game_ids = HashSet::new();
        for snapshot in &self.games {
            if snapshot.taken_at != self.taken_at {
                return Err(AppError::SnapshotInvalid(format!(
                    "game {} was taken at {} but the batch at {}",
                    snapshot.game.id, snapshot.taken_at, self.taken_at
                )));
            }
            if !game_ids.insert(snapshot.game.id.as_str()) {
                return Err(AppError::SnapshotInvalid(format!(
                    "duplicate game {} in batch",
                    snapshot.game.id
                )));
            }
            snapshot.validate()?;
        }
        Ok(())
    }

    pub fn campaign_count(&self) -> usize {
        self.games.iter().map(|g| g.campaigns.len()).sum()
    }
}
