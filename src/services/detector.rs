//! Diffing of two snapshots of one game into notification-worthy events.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::models::{CampaignSnapshot, CampaignStatus, DropSnapshot, GameSnapshot};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeEvent {
    CampaignStarted {
        game_id: String,
        campaign_id: String,
    },
    NewDrop {
        game_id: String,
        campaign_id: String,
        drop_id: String,
    },
    CampaignEnded {
        game_id: String,
        campaign_id: String,
    },
}

impl ChangeEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ChangeEvent::CampaignStarted { .. } => "campaign_started",
            ChangeEvent::NewDrop { .. } => "new_drop",
            ChangeEvent::CampaignEnded { .. } => "campaign_ended",
        }
    }

    pub fn game_id(&self) -> &str {
        match self {
            ChangeEvent::CampaignStarted { game_id, .. }
            | ChangeEvent::NewDrop { game_id, .. }
            | ChangeEvent::CampaignEnded { game_id, .. } => game_id,
        }
    }

    pub fn campaign_id(&self) -> &str {
        match self {
            ChangeEvent::CampaignStarted { campaign_id, .. }
            | ChangeEvent::NewDrop { campaign_id, .. }
            | ChangeEvent::CampaignEnded { campaign_id, .. } => campaign_id,
        }
    }
}

/// Compute the events that lead from `previous` to `next`.
///
/// Campaigns from both snapshots are visited by (start, id); the start is taken
/// from `next` when the campaign still exists there. Per campaign the events
/// come out as started, then new drops by (required minutes, id), then ended.
/// Each side's status is evaluated at that snapshot's own `taken_at`.
pub fn detect<'a>(
    previous: &'a GameSnapshot,
    next: &'a GameSnapshot,
) -> impl Iterator<Item = ChangeEvent> + 'a {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut order: Vec<(DateTime<Utc>, &str)> = Vec::new();

    for entry in next.campaigns.iter().chain(previous.campaigns.iter()) {
        let id = entry.campaign.id.as_str();
        if seen.insert(id) {
            order.push((entry.campaign.starts_at, id));
        }
    }
    order.sort();

    order
        .into_iter()
        .flat_map(move |(_, campaign_id)| campaign_events(previous, next, campaign_id))
}

fn campaign_events(
    previous: &GameSnapshot,
    next: &GameSnapshot,
    campaign_id: &str,
) -> Vec<ChangeEvent> {
    let game_id = next.game.id.as_str();
    let before = previous.find_campaign(campaign_id);
    let after = next.find_campaign(campaign_id);

    let before_status = before.map(|c| c.status_at(previous.taken_at));
    let after_status = after.map(|c| c.status_at(next.taken_at));

    let mut events = Vec::new();

    if matches!(before_status, None | Some(CampaignStatus::Upcoming))
        && after_status == Some(CampaignStatus::Active)
    {
        events.push(ChangeEvent::CampaignStarted {
            game_id: game_id.to_string(),
            campaign_id: campaign_id.to_string(),
        });
    }

    if let Some(after) = after {
        for drop in new_drops(before, after) {
            events.push(ChangeEvent::NewDrop {
                game_id: game_id.to_string(),
                campaign_id: campaign_id.to_string(),
                drop_id: drop.drop.id.clone(),
            });
        }
    }

    if before_status == Some(CampaignStatus::Active)
        && matches!(after_status, None | Some(CampaignStatus::Expired))
    {
        events.push(ChangeEvent::CampaignEnded {
            game_id: game_id.to_string(),
            campaign_id: campaign_id.to_string(),
        });
    }

    events
}

fn new_drops<'a>(
    before: Option<&CampaignSnapshot>,
    after: &'a CampaignSnapshot,
) -> Vec<&'a DropSnapshot> {
    let mut drops: Vec<&DropSnapshot> = after
        .drops
        .iter()
        .filter(|d| before.map_or(true, |b| b.find_drop(&d.drop.id).is_none()))
        .collect();
    drops.sort_by(|a, b| {
        (a.drop.required_minutes_watched, &a.drop.id)
            .cmp(&(b.drop.required_minutes_watched, &b.drop.id))
    });
    drops
}
