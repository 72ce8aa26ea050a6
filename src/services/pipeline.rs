use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::db::models::{GameSnapshot, OwnerSubscriptionTarget, SnapshotBatch, SubscriptionTarget};
use crate::db::{OwnerSubscriptionRepository, SnapshotRepository, SubscriptionRepository};
use crate::error::{AppError, AppResult};
use crate::services::delivery::{deliver_all, DeliverySink};
use crate::services::detector::{detect, ChangeEvent};
use crate::services::dispatcher::Dispatcher;
use crate::services::ingest::parse_payload;
use crate::services::retry::DeliveryRetryService;

/// Counts reported for one ingestion cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    pub taken_at: DateTime<Utc>,
    pub games: usize,
    pub campaigns: usize,
    /// Stored games missing from the batch that were diffed against an empty snapshot.
    pub vanished_games: usize,
    pub events: usize,
    pub messages: usize,
    pub delivered: usize,
    pub failed: usize,
    pub queued: usize,
    pub pruned_games: usize,
}

/// Fold owner subscriptions into per-game targets.
///
/// `game_orgs` maps each game with events to its organization. A webhook that
/// follows both a game and its organization keeps one target for that game,
/// with each toggle on if either subscription has it on.
pub fn merge_owner_targets(
    mut targets: Vec<SubscriptionTarget>,
    owners: &[OwnerSubscriptionTarget],
    game_orgs: &[(String, String)],
) -> Vec<SubscriptionTarget> {
    for (game_id, organization_id) in game_orgs {
        for owner in owners.iter().filter(|o| &o.organization_id == organization_id) {
            match targets
                .iter_mut()
                .find(|t| t.webhook_id == owner.webhook_id && &t.game_id == game_id)
            {
                Some(existing) => {
                    existing.notify_new_drop |= owner.notify_new_drop;
                    existing.notify_campaign_live |= owner.notify_campaign_live;
                }
                None => targets.push(owner.for_game(game_id)),
            }
        }
    }
    targets
}

/// Runs detection, dispatch, delivery and persistence for ingested batches.
///
/// Cycles are serialized: a second call waits until the running one has saved
/// its snapshots.
pub struct IngestionPipeline {
    pool: SqlitePool,
    snapshots: Arc<dyn SnapshotRepository>,
    sink: Arc<dyn DeliverySink>,
    dispatcher: Dispatcher,
    retry: DeliveryRetryService,
    delivery_timeout: Duration,
    delivery_concurrency: usize,
    load_concurrency: usize,
    prune_empty_games: bool,
    lock: Mutex<()>,
}

impl IngestionPipeline {
    pub fn new(
        pool: SqlitePool,
        snapshots: Arc<dyn SnapshotRepository>,
        sink: Arc<dyn DeliverySink>,
        retry: DeliveryRetryService,
        config: &Config,
    ) -> Self {
        Self {
            pool,
            snapshots,
            sink,
            dispatcher: Dispatcher::new(&config.discord, config.server.site_url.clone()),
            retry,
            delivery_timeout: Duration::from_secs(config.delivery.timeout_seconds),
            delivery_concurrency: config.delivery.concurrency,
            load_concurrency: config.ingest.load_concurrency,
            prune_empty_games: config.ingest.prune_empty_games,
            lock: Mutex::new(()),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Parse a raw GQL dump and run a cycle on it.
    pub async fn run_payload(&self, raw: &str, taken_at: DateTime<Utc>) -> AppResult<CycleSummary> {
        let batch = parse_payload(raw, taken_at)?;
        self.run(batch).await
    }

    /// Run one cycle. Nothing is written when the batch is invalid.
    ///
    /// Snapshots are saved only after every message has been delivered or
    /// queued for retry.
    pub async fn run(&self, batch: SnapshotBatch) -> AppResult<CycleSummary> {
        if batch.games.is_empty() {
            return Err(AppError::SnapshotInvalid("batch contains no games".to_string()));
        }
        batch.validate()?;

        let _guard = self.lock.lock().await;
        let taken_at = batch.taken_at;

        tracing::info!(
            "Ingestion cycle started: {} games, {} campaigns, taken at {}",
            batch.games.len(),
            batch.campaign_count(),
            taken_at
        );

        let in_batch: HashSet<&str> = batch.games.iter().map(|g| g.game_id()).collect();
        let vanished_ids: Vec<String> = self
            .snapshots
            .list_game_ids()
            .await?
            .into_iter()
            .filter(|id| !in_batch.contains(id.as_str()))
            .collect();

        let load_ids: Vec<String> = batch
            .games
            .iter()
            .map(|g| g.game.id.clone())
            .chain(vanished_ids.iter().cloned())
            .collect();

        let snapshots = &self.snapshots;
        let mut previous: Vec<Option<GameSnapshot>> = stream::iter(load_ids)
            .map(|id| async move { snapshots.load(&id).await })
            .buffered(self.load_concurrency.max(1))
            .try_collect()
            .await?;
        let previous_vanished = previous.split_off(batch.games.len());

        let mut pairs: Vec<(GameSnapshot, GameSnapshot)> = Vec::new();
        for (next, prev) in batch.games.into_iter().zip(previous) {
            let prev = prev.unwrap_or_else(|| {
                GameSnapshot::empty(next.game.clone(), next.organization.clone(), next.taken_at)
            });
            pairs.push((prev, next));
        }

        let mut vanished_games = 0;
        let mut to_prune: Vec<String> = Vec::new();
        for prev in previous_vanished.into_iter().flatten() {
            if prev.campaigns.is_empty() {
                if self.prune_empty_games {
                    to_prune.push(prev.game.id.clone());
                }
                continue;
            }
            vanished_games += 1;
            let next = GameSnapshot::empty(prev.game.clone(), prev.organization.clone(), taken_at);
            pairs.push((prev, next));
        }

        let events: Vec<ChangeEvent> = pairs
            .iter()
            .flat_map(|(prev, next)| detect(prev, next))
            .collect();

        let mut event_games: Vec<String> = Vec::new();
        for event in &events {
            if !event_games.iter().any(|g| g == event.game_id()) {
                event_games.push(event.game_id().to_string());
            }
        }

        let next_by_game: HashMap<String, GameSnapshot> = pairs
            .iter()
            .map(|(_, next)| (next.game.id.clone(), next.clone()))
            .collect();

        let game_orgs: Vec<(String, String)> = event_games
            .iter()
            .filter_map(|game_id| {
                let org = next_by_game.get(game_id)?.game.organization_id.clone()?;
                Some((game_id.clone(), org))
            })
            .collect();
        let mut organization_ids: Vec<String> =
            game_orgs.iter().map(|(_, org)| org.clone()).collect();
        organization_ids.sort();
        organization_ids.dedup();

        let targets = SubscriptionRepository::targets_for_games(&self.pool, &event_games).await?;
        let owners =
            OwnerSubscriptionRepository::targets_for_organizations(&self.pool, &organization_ids)
                .await?;
        let targets = merge_owner_targets(targets, &owners, &game_orgs);

        let messages = self.dispatcher.dispatch(&events, &targets, &next_by_game);

        let report = deliver_all(
            &messages,
            self.sink.as_ref(),
            self.delivery_timeout,
            self.delivery_concurrency,
        )
        .await;

        let mut queued = 0;
        for failure in &report.failed {
            if self
                .retry
                .enqueue_failure(&messages[failure.index], &failure.error)
                .await?
                .is_some()
            {
                queued += 1;
            }
        }

        let games = pairs.len() - vanished_games;
        let campaigns = pairs.iter().map(|(_, next)| next.campaigns.len()).sum();
        for (_, next) in &pairs {
            self.snapshots.save(next).await?;
        }

        let mut pruned_games = 0;
        for game_id in &to_prune {
            if self.snapshots.delete(game_id).await? {
                tracing::info!("Pruned game {} with no remaining campaigns", game_id);
                pruned_games += 1;
            }
        }

        let summary = CycleSummary {
            taken_at,
            games,
            campaigns,
            vanished_games,
            events: events.len(),
            messages: messages.len(),
            delivered: report.success_count(),
            failed: report.failure_count(),
            queued,
            pruned_games,
        };

        tracing::info!(
            "Ingestion cycle finished: {} events, {} messages, {} delivered, {} failed, {} queued, {} pruned",
            summary.events,
            summary.messages,
            summary.delivered,
            summary.failed,
            summary.queued,
            summary.pruned_games
        );

        Ok(summary)
    }
}
