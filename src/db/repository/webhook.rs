use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{CreateWebhook, Webhook};
use crate::error::{AppError, AppResult};

pub struct WebhookRepository;

impl WebhookRepository {
    /// Register a webhook. A URL that is already registered is a conflict.
    pub async fn create(pool: &SqlitePool, webhook: CreateWebhook) -> AppResult<Webhook> {
        let existing: Option<String> = sqlx::query_scalar("SELECT id FROM webhooks WHERE url = ?")
            .bind(&webhook.url)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?;
        if existing.is_some() {
            return Err(AppError::Conflict(
                "This webhook is already registered".to_string(),
            ));
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let row = sqlx::query_as::<_, Webhook>(
            r#"
            INSERT INTO webhooks (id, name, url, created_at)
            VALUES (?, ?, ?, ?)
            RETURNING id, name, url, created_at
            "#,
        )
        .bind(id)
        .bind(webhook.name)
        .bind(webhook.url)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(|e| match e {
            // Lost a race with a concurrent registration of the same URL.
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                AppError::Conflict("This webhook is already registered".to_string())
            }
            other => AppError::Database(other),
        })?;

        Ok(row)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<Webhook>> {
        let row = sqlx::query_as::<_, Webhook>(
            "SELECT id, name, url, created_at FROM webhooks WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// All webhooks in creation order.
    pub async fn list(pool: &SqlitePool) -> AppResult<Vec<Webhook>> {
        let rows = sqlx::query_as::<_, Webhook>(
            "SELECT id, name, url, created_at FROM webhooks ORDER BY created_at, id",
        )
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    /// Delete a webhook together with its game and owner subscriptions and its
    /// queued deliveries. Returns whether the webhook existed.
    pub async fn delete(pool: &SqlitePool, id: &str) -> AppResult<bool> {
        let mut tx = pool.begin().await.map_err(AppError::Database)?;

        sqlx::query("DELETE FROM delivery_queue WHERE webhook_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(AppError::Database)?;

        sqlx::query("DELETE FROM subscriptions WHERE webhook_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(AppError::Database)?;

        sqlx::query("DELETE FROM owner_subscriptions WHERE webhook_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(AppError::Database)?;

        let result = sqlx::query("DELETE FROM webhooks WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(AppError::Database)?;

        tx.commit().await.map_err(AppError::Database)?;
        Ok(result.rows_affected() > 0)
    }
}
