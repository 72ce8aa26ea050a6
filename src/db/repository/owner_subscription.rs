use chrono::Utc;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::db::models::{
    CreateOwnerSubscription, OwnerSubscription, OwnerSubscriptionTarget, UpdateSubscription,
};
use crate::error::{AppError, AppResult};

/// Subscriptions to every game of an organization.
pub struct OwnerSubscriptionRepository;

impl OwnerSubscriptionRepository {
    /// Both toggles default to on. An existing (webhook, organization) pair is
    /// a `Conflict` and the stored row is left as it was.
    pub async fn create(
        pool: &SqlitePool,
        webhook_id: &str,
        sub: CreateOwnerSubscription,
    ) -> AppResult<OwnerSubscription> {
        let now = Utc::now();

        let row = sqlx::query_as::<_, OwnerSubscription>(
            r#"
            INSERT INTO owner_subscriptions (
                webhook_id, organization_id, notify_new_drop, notify_campaign_live, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(webhook_id, organization_id) DO NOTHING
            RETURNING webhook_id, organization_id, notify_new_drop, notify_campaign_live, created_at, updated_at
            "#,
        )
        .bind(webhook_id)
        .bind(&sub.organization_id)
        .bind(sub.notify_new_drop.unwrap_or(true))
        .bind(sub.notify_campaign_live.unwrap_or(true))
        .bind(now)
        .bind(now)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        row.ok_or_else(|| {
            AppError::Conflict(format!(
                "Webhook {} is already subscribed to organization {}",
                webhook_id, sub.organization_id
            ))
        })
    }

    pub async fn find(
        pool: &SqlitePool,
        webhook_id: &str,
        organization_id: &str,
    ) -> AppResult<Option<OwnerSubscription>> {
        let row = sqlx::query_as::<_, OwnerSubscription>(
            r#"
            SELECT webhook_id, organization_id, notify_new_drop, notify_campaign_live, created_at, updated_at
            FROM owner_subscriptions
            WHERE webhook_id = ? AND organization_id = ?
            "#,
        )
        .bind(webhook_id)
        .bind(organization_id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn update_toggles(
        pool: &SqlitePool,
        webhook_id: &str,
        organization_id: &str,
        update: UpdateSubscription,
    ) -> AppResult<Option<OwnerSubscription>> {
        let now = Utc::now();

        let row = sqlx::query_as::<_, OwnerSubscription>(
            r#"
            UPDATE owner_subscriptions
            SET
                notify_new_drop = COALESCE(?, notify_new_drop),
                notify_campaign_live = COALESCE(?, notify_campaign_live),
                updated_at = ?
            WHERE webhook_id = ? AND organization_id = ?
            RETURNING webhook_id, organization_id, notify_new_drop, notify_campaign_live, created_at, updated_at
            "#,
        )
        .bind(update.notify_new_drop)
        .bind(update.notify_campaign_live)
        .bind(now)
        .bind(webhook_id)
        .bind(organization_id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn delete(
        pool: &SqlitePool,
        webhook_id: &str,
        organization_id: &str,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            "DELETE FROM owner_subscriptions WHERE webhook_id = ? AND organization_id = ?",
        )
        .bind(webhook_id)
        .bind(organization_id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn list_for_webhook(
        pool: &SqlitePool,
        webhook_id: &str,
    ) -> AppResult<Vec<OwnerSubscription>> {
        let rows = sqlx::query_as::<_, OwnerSubscription>(
            r#"
            SELECT webhook_id, organization_id, notify_new_drop, notify_campaign_live, created_at, updated_at
            FROM owner_subscriptions
            WHERE webhook_id = ?
            ORDER BY organization_id
            "#,
        )
        .bind(webhook_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    /// Whether the organization has been seen in an ingested dump.
    pub async fn organization_exists(pool: &SqlitePool, organization_id: &str) -> AppResult<bool> {
        let found = sqlx::query_scalar::<_, i64>("SELECT 1 FROM organizations WHERE id = ?")
            .bind(organization_id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?;
        Ok(found.is_some())
    }

    /// Owner subscriptions for any of `organization_ids` joined with their
    /// webhook, in webhook creation order.
    pub async fn targets_for_organizations(
        pool: &SqlitePool,
        organization_ids: &[String],
    ) -> AppResult<Vec<OwnerSubscriptionTarget>> {
        if organization_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            r#"
            SELECT
                w.id AS webhook_id,
                w.name AS webhook_name,
                w.url AS webhook_url,
                w.created_at AS webhook_created_at,
                o.organization_id AS organization_id,
                o.notify_new_drop AS notify_new_drop,
                o.notify_campaign_live AS notify_campaign_live
            FROM owner_subscriptions o
            JOIN webhooks w ON w.id = o.webhook_id
            WHERE o.organization_id IN (
            "#,
        );
        let mut separated = qb.separated(", ");
        for id in organization_ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(") ORDER BY w.created_at, w.id, o.organization_id");

        let rows = qb
            .build_query_as::<OwnerSubscriptionTarget>()
            .fetch_all(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(rows)
    }
}
