use std::collections::HashMap;

use serde::Serialize;

use crate::config::DiscordConfig;
use crate::db::models::{CampaignSnapshot, DropSnapshot, GameSnapshot, SubscriptionTarget};
use crate::services::detector::ChangeEvent;
use crate::services::discord::{colors, DiscordEmbed, WebhookMessage};
use crate::services::format::{discord_timestamp, minutes_to_hours};

/// One rendered message bound for one webhook.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMessage {
    pub event: ChangeEvent,
    pub webhook_id: String,
    #[serde(skip)]
    pub webhook_url: String,
    pub payload: WebhookMessage,
}

impl OutboundMessage {
    pub fn kind(&self) -> &'static str {
        self.event.kind()
    }
}

/// Turns change events into per-subscription messages.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    username: String,
    avatar_url: Option<String>,
    site_url: Option<String>,
}

impl Dispatcher {
    pub fn new(discord: &DiscordConfig, site_url: Option<String>) -> Self {
        Self {
            username: discord.username.clone(),
            avatar_url: discord.avatar_url.clone(),
            site_url,
        }
    }

    /// One message per (event, interested subscription), in event order.
    ///
    /// `snapshots` holds the next snapshot of every game with events; message
    /// content is rendered from it alone. Subscriptions of one event are served
    /// in webhook creation order.
    pub fn dispatch(
        &self,
        events: &[ChangeEvent],
        targets: &[SubscriptionTarget],
        snapshots: &HashMap<String, GameSnapshot>,
    ) -> Vec<OutboundMessage> {
        let mut by_game: HashMap<&str, Vec<&SubscriptionTarget>> = HashMap::new();
        for target in targets {
            by_game.entry(target.game_id.as_str()).or_default().push(target);
        }
        for subs in by_game.values_mut() {
            subs.sort_by(|a, b| {
                (a.webhook_created_at, &a.webhook_id).cmp(&(b.webhook_created_at, &b.webhook_id))
            });
        }

        let mut messages = Vec::new();
        for event in events {
            let Some(subs) = by_game.get(event.game_id()) else {
                continue;
            };
            let interested: Vec<&&SubscriptionTarget> = subs
                .iter()
                .filter(|s| match event {
                    ChangeEvent::NewDrop { .. } => s.notify_new_drop,
                    ChangeEvent::CampaignStarted { .. } => s.notify_campaign_live,
                    ChangeEvent::CampaignEnded { .. } => false,
                })
                .collect();
            if interested.is_empty() {
                continue;
            }

            let Some(payload) = snapshots
                .get(event.game_id())
                .and_then(|snapshot| self.render(event, snapshot))
            else {
                tracing::warn!(
                    "No snapshot data to render {} for game {}",
                    event.kind(),
                    event.game_id()
                );
                continue;
            };

            for sub in interested {
                messages.push(OutboundMessage {
                    event: event.clone(),
                    webhook_id: sub.webhook_id.clone(),
                    webhook_url: sub.webhook_url.clone(),
                    payload: payload.clone(),
                });
            }
        }
        messages
    }

    /// Render the Discord payload for `event` from the game's snapshot.
    pub fn render(&self, event: &ChangeEvent, snapshot: &GameSnapshot) -> Option<WebhookMessage> {
        let campaign = snapshot.find_campaign(event.campaign_id())?;
        match event {
            ChangeEvent::CampaignStarted { .. } => Some(self.campaign_started(snapshot, campaign)),
            ChangeEvent::NewDrop { drop_id, .. } => {
                let drop = campaign.find_drop(drop_id)?;
                Some(self.new_drop(snapshot, campaign, drop))
            }
            ChangeEvent::CampaignEnded { .. } => None,
        }
    }

    /// Message sent by `POST /api/webhooks/:id/test`.
    pub fn test_message(&self, webhook_name: &str) -> WebhookMessage {
        let embed = DiscordEmbed::new()
            .title("Webhook connected")
            .description(format!(
                "**{}** will receive drop notifications for its subscribed games.",
                webhook_name
            ))
            .color(colors::SUCCESS);
        self.message(
            format!("This is a test notification for {}.", webhook_name),
            self.footer(embed),
        )
    }

    fn campaign_started(&self, snapshot: &GameSnapshot, entry: &CampaignSnapshot) -> WebhookMessage {
        let game = &snapshot.game;
        let campaign = &entry.campaign;
        let url = campaign_url(snapshot, entry);
        let description = campaign
            .description
            .as_deref()
            .filter(|d| !d.trim().is_empty())
            .unwrap_or("No description provided.");

        let content = format!(
            "{}: {}\n{}\nStarts: {}\nEnds: {}\n<{}>",
            game.name,
            campaign.name,
            description,
            discord_timestamp(campaign.starts_at),
            discord_timestamp(campaign.ends_at),
            url
        );

        let mut embed = DiscordEmbed::new()
            .title(format!("{} is live", campaign.name))
            .url(url)
            .description(description)
            .color(colors::TWITCH_PURPLE)
            .author(
                game.name.clone(),
                Some(game.twitch_url()),
                Some(game.box_art().to_string()),
            )
            .thumbnail(
                campaign
                    .image_url
                    .clone()
                    .unwrap_or_else(|| game.box_art().to_string()),
            )
            .field("Starts", discord_timestamp(campaign.starts_at), true)
            .field("Ends", discord_timestamp(campaign.ends_at), true)
            .field("Drops", entry.drops.len().to_string(), true)
            .timestamp(campaign.starts_at.to_rfc3339());

        if let Some(link) = campaign.separate_account_link() {
            embed = embed.field("Link account", link, false);
        }

        self.message(content, self.footer(embed))
    }

    fn new_drop(
        &self,
        snapshot: &GameSnapshot,
        entry: &CampaignSnapshot,
        drop: &DropSnapshot,
    ) -> WebhookMessage {
        let game = &snapshot.game;
        let campaign = &entry.campaign;
        let url = campaign_url(snapshot, entry);
        let required = minutes_to_hours(drop.drop.required_minutes_watched);

        let content = format!(
            "{}: new drop {} in {}\nWatch time: {}\nEnds: {}\n<{}>",
            game.name,
            drop.drop.name,
            campaign.name,
            required,
            discord_timestamp(campaign.ends_at),
            url
        );

        let mut embed = DiscordEmbed::new()
            .title(format!("New drop: {}", drop.drop.name))
            .url(url)
            .color(colors::INFO)
            .author(
                game.name.clone(),
                Some(game.twitch_url()),
                Some(game.box_art().to_string()),
            )
            .field("Campaign", campaign.name.clone(), true)
            .field("Watch time", required, true)
            .field("Ends", discord_timestamp(campaign.ends_at), true)
            .timestamp(campaign.starts_at.to_rfc3339());

        if !drop.benefits.is_empty() {
            let rewards: Vec<String> = drop
                .benefits
                .iter()
                .map(|b| match b.display_limit() {
                    Some(limit) => format!("{} (x{})", b.name, limit),
                    None => b.name.clone(),
                })
                .collect();
            embed = embed.field("Rewards", rewards.join("\n"), false);
        }
        if let Some(image) = drop.benefits.iter().find_map(|b| b.image_url.clone()) {
            embed = embed.thumbnail(image);
        }

        self.message(content, self.footer(embed))
    }

    fn footer(&self, embed: DiscordEmbed) -> DiscordEmbed {
        match &self.site_url {
            Some(site) => embed.footer(site.clone(), None),
            None => embed,
        }
    }

    fn message(&self, content: String, embed: DiscordEmbed) -> WebhookMessage {
        WebhookMessage {
            content: Some(content),
            username: Some(self.username.clone()),
            avatar_url: self.avatar_url.clone(),
            embeds: Some(vec![embed]),
        }
    }
}

/// Campaign details page, or the game's Twitch directory when Twitch gave none.
fn campaign_url(snapshot: &GameSnapshot, entry: &CampaignSnapshot) -> String {
    entry
        .campaign
        .details_url
        .clone()
        .filter(|u| !u.trim().is_empty())
        .unwrap_or_else(|| snapshot.game.twitch_url())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::services::detector::detect;
    use crate::test_support::{at, campaign_entry, drop_entry, game_snapshot, target};

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(&Config::default().discord, None)
    }

    fn scenario() -> (GameSnapshot, GameSnapshot) {
        let previous = game_snapshot("g1", at(2024, 1, 5), vec![]);
        let next = game_snapshot(
            "g1",
            at(2024, 1, 5),
            vec![campaign_entry(
                "g1",
                "c1",
                at(2024, 1, 1),
                at(2024, 1, 10),
                vec![drop_entry("c1", "d1", 30, vec![])],
            )],
        );
        (previous, next)
    }

    fn snapshots(list: Vec<GameSnapshot>) -> HashMap<String, GameSnapshot> {
        list.into_iter().map(|s| (s.game.id.clone(), s)).collect()
    }

    #[test]
    fn started_and_new_drop_go_to_subscriber_in_order() {
        let (previous, next) = scenario();
        let events: Vec<_> = detect(&previous, &next).collect();
        let targets = vec![target("w1", "g1", true, true, at(2024, 1, 1))];

        let messages = dispatcher().dispatch(&events, &targets, &snapshots(vec![next]));

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].kind(), "campaign_started");
        assert_eq!(messages[1].kind(), "new_drop");
        assert!(messages.iter().all(|m| m.webhook_id == "w1"));
    }

    #[test]
    fn toggles_off_yield_nothing() {
        let (previous, next) = scenario();
        let events: Vec<_> = detect(&previous, &next).collect();
        let targets = vec![target("w1", "g1", false, false, at(2024, 1, 1))];

        assert!(dispatcher()
            .dispatch(&events, &targets, &snapshots(vec![next]))
            .is_empty());
    }

    #[test]
    fn each_toggle_selects_its_event_kind() {
        let (previous, next) = scenario();
        let events: Vec<_> = detect(&previous, &next).collect();
        let targets = vec![
            target("drops-only", "g1", true, false, at(2024, 1, 1)),
            target("live-only", "g1", false, true, at(2024, 1, 2)),
        ];

        let messages = dispatcher().dispatch(&events, &targets, &snapshots(vec![next]));
        let pairs: Vec<_> = messages
            .iter()
            .map(|m| (m.kind(), m.webhook_id.as_str()))
            .collect();
        assert_eq!(
            pairs,
            vec![("campaign_started", "live-only"), ("new_drop", "drops-only")]
        );
    }

    #[test]
    fn games_without_subscribers_do_not_block_others() {
        let (previous, next) = scenario();
        let mut other_next = next.clone();
        other_next.game = crate::test_support::game("g2");
        for entry in &mut other_next.campaigns {
            entry.campaign.game_id = "g2".to_string();
        }
        let mut other_previous = previous.clone();
        other_previous.game = crate::test_support::game("g2");

        let mut events: Vec<_> = detect(&previous, &next).collect();
        events.extend(detect(&other_previous, &other_next));
        let targets = vec![target("w2", "g2", true, true, at(2024, 1, 1))];

        let messages = dispatcher().dispatch(&events, &targets, &snapshots(vec![next, other_next]));
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| m.event.game_id() == "g2"));
    }

    #[test]
    fn subscribers_are_ordered_by_webhook_creation() {
        let (previous, next) = scenario();
        let events: Vec<_> = detect(&previous, &next).collect();
        let targets = vec![
            target("w-late", "g1", true, true, at(2024, 1, 3)),
            target("w-b", "g1", true, true, at(2024, 1, 1)),
            target("w-a", "g1", true, true, at(2024, 1, 1)),
        ];

        let messages = dispatcher().dispatch(&events[..1], &targets, &snapshots(vec![next]));
        let ids: Vec<_> = messages.iter().map(|m| m.webhook_id.as_str()).collect();
        assert_eq!(ids, vec!["w-a", "w-b", "w-late"]);
    }

    #[test]
    fn ended_campaigns_are_not_announced() {
        let (_, next) = scenario();
        let gone = game_snapshot("g1", at(2024, 1, 6), vec![]);
        let events: Vec<_> = detect(&next, &gone).collect();
        assert_eq!(events.len(), 1);

        let targets = vec![target("w1", "g1", true, true, at(2024, 1, 1))];
        assert!(dispatcher()
            .dispatch(&events, &targets, &snapshots(vec![gone]))
            .is_empty());
    }

    #[test]
    fn new_drop_message_carries_watch_time_and_url() {
        let (previous, mut next) = scenario();
        next.campaigns[0].drops[0].drop.required_minutes_watched = 90;
        next.campaigns[0].campaign.details_url = Some("https://example.com/campaign".to_string());
        let events: Vec<_> = detect(&previous, &next).collect();

        let payload = dispatcher().render(&events[1], &next).unwrap();
        let content = payload.content.unwrap();
        assert!(content.contains("Game g1: new drop Drop d1 in Campaign c1"));
        assert!(content.contains("Watch time: 1h 30m"));
        assert!(content.contains("<https://example.com/campaign>"));
    }

    #[test]
    fn started_message_falls_back_to_directory_url() {
        let (previous, next) = scenario();
        let events: Vec<_> = detect(&previous, &next).collect();

        let payload = dispatcher().render(&events[0], &next).unwrap();
        let content = payload.content.unwrap();
        assert!(content.starts_with("Game g1: Campaign c1\nNo description provided.\n"));
        assert!(content.contains("https://www.twitch.tv/directory/category/game-g1"));
        assert_eq!(payload.username.as_deref(), Some("Twitch Drops"));
    }
}
