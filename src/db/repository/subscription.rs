use chrono::Utc;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::db::models::{CreateSubscription, Subscription, SubscriptionTarget, UpdateSubscription};
use crate::error::{AppError, AppResult};

pub struct SubscriptionRepository;

impl SubscriptionRepository {
    /// Subscribe a webhook to a game. Both toggles default to on.
    ///
    /// An existing (webhook, game) pair is rejected with `DuplicateSubscription`
    /// and the stored row is left as it was.
    pub async fn create(
        pool: &SqlitePool,
        webhook_id: &str,
        sub: CreateSubscription,
    ) -> AppResult<Subscription> {
        let now = Utc::now();

        let row = sqlx::query_as::<_, Subscription>(
            r#"
            INSERT INTO subscriptions (
                webhook_id, game_id, notify_new_drop, notify_campaign_live, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(webhook_id, game_id) DO NOTHING
            RETURNING webhook_id, game_id, notify_new_drop, notify_campaign_live, created_at, updated_at
            "#,
        )
        .bind(webhook_id)
        .bind(&sub.game_id)
        .bind(sub.notify_new_drop.unwrap_or(true))
        .bind(sub.notify_campaign_live.unwrap_or(true))
        .bind(now)
        .bind(now)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        row.ok_or_else(|| AppError::DuplicateSubscription {
            webhook_id: webhook_id.to_string(),
            game_id: sub.game_id,
        })
    }

    pub async fn find(
        pool: &SqlitePool,
        webhook_id: &str,
        game_id: &str,
    ) -> AppResult<Option<Subscription>> {
        let row = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT webhook_id, game_id, notify_new_drop, notify_campaign_live, created_at, updated_at
            FROM subscriptions
            WHERE webhook_id = ? AND game_id = ?
            "#,
        )
        .bind(webhook_id)
        .bind(game_id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Change the toggles that are present in `update`; absent ones keep their value.
    pub async fn update_toggles(
        pool: &SqlitePool,
        webhook_id: &str,
        game_id: &str,
        update: UpdateSubscription,
    ) -> AppResult<Option<Subscription>> {
        let now = Utc::now();

        let row = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions
            SET
                notify_new_drop = COALESCE(?, notify_new_drop),
                notify_campaign_live = COALESCE(?, notify_campaign_live),
                updated_at = ?
            WHERE webhook_id = ? AND game_id = ?
            RETURNING webhook_id, game_id, notify_new_drop, notify_campaign_live, created_at, updated_at
            "#,
        )
        .bind(update.notify_new_drop)
        .bind(update.notify_campaign_live)
        .bind(now)
        .bind(webhook_id)
        .bind(game_id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn delete(pool: &SqlitePool, webhook_id: &str, game_id: &str) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM subscriptions WHERE webhook_id = ? AND game_id = ?")
            .bind(webhook_id)
            .bind(game_id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn list_for_webhook(
        pool: &SqlitePool,
        webhook_id: &str,
    ) -> AppResult<Vec<Subscription>> {
        let rows = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT webhook_id, game_id, notify_new_drop, notify_campaign_live, created_at, updated_at
            FROM subscriptions
            WHERE webhook_id = ?
            ORDER BY game_id
            "#,
        )
        .bind(webhook_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    /// Subscriptions for any of `game_ids` joined with their webhook, in webhook
    /// creation order.
    pub async fn targets_for_games(
        pool: &SqlitePool,
        game_ids: &[String],
    ) -> AppResult<Vec<SubscriptionTarget>> {
        if game_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            r#"
            SELECT
                w.id AS webhook_id,
                w.name AS webhook_name,
                w.url AS webhook_url,
                w.created_at AS webhook_created_at,
                s.game_id AS game_id,
                s.notify_new_drop AS notify_new_drop,
                s.notify_campaign_live AS notify_campaign_live
            FROM subscriptions s
            JOIN webhooks w ON w.id = s.webhook_id
            WHERE s.game_id IN (
            "#,
        );
        let mut separated = qb.separated(", ");
        for id in game_ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(") ORDER BY w.created_at, w.id, s.game_id");

        let rows = qb
            .build_query_as::<SubscriptionTarget>()
            .fetch_all(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(rows)
    }
}
