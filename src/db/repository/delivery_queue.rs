use chrono::{NaiveDateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{CreateDeliveryTask, DeliveryTask, TASK_PENDING};
use crate::error::{AppError, AppResult};

/// Repository for the persistent delivery retry queue.
///
/// Claiming is a single `UPDATE ... WHERE id = (SELECT id ... LIMIT 1) RETURNING ...`
/// per task, so no transaction is held while the worker delivers. Pending
/// tasks past their `expires_at` are moved to 'dead' before each claim.
pub struct DeliveryQueueRepository;

impl DeliveryQueueRepository {
    /// Queue a failed delivery.
    ///
    /// `max_attempts` defaults to 5 and `next_attempt_at` to now.
    pub async fn create(pool: &SqlitePool, task: CreateDeliveryTask) -> AppResult<DeliveryTask> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();
        let next_attempt_at = task.next_attempt_at.unwrap_or(now);
        let max_attempts = task.max_attempts.unwrap_or(5);

        let row = sqlx::query_as::<_, DeliveryTask>(
            r#"
            INSERT INTO delivery_queue (
                id,
                webhook_id,
                webhook_url,
                event_kind,
                payload_json,
                attempts,
                max_attempts,
                next_attempt_at,
                expires_at,
                last_error,
                status,
                created_at,
                updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING
                id, webhook_id, webhook_url, event_kind, payload_json,
                attempts, max_attempts, next_attempt_at, expires_at,
                last_error, status, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(task.webhook_id)
        .bind(task.webhook_url)
        .bind(task.event_kind)
        .bind(task.payload_json)
        .bind(0i32) // attempts
        .bind(max_attempts)
        .bind(next_attempt_at)
        .bind(task.expires_at)
        .bind(task.last_error)
        .bind(TASK_PENDING)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Retire pending tasks whose `expires_at` has passed. Returns how many
    /// were moved to 'dead'.
    pub async fn expire_overdue_at(pool: &SqlitePool, now: NaiveDateTime) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_queue
            SET status = 'dead', last_error = 'expired', updated_at = ?
            WHERE status = 'pending'
              AND expires_at IS NOT NULL
              AND expires_at <= ?
            "#,
        )
        .bind(now)
        .bind(now)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected())
    }

    /// Claim up to `limit` due, unexpired tasks, oldest schedule first.
    /// Expired ones are retired to 'dead' first.
    pub async fn fetch_and_claim_due(pool: &SqlitePool, limit: i64) -> AppResult<Vec<DeliveryTask>> {
        Self::fetch_and_claim_due_at(pool, limit, Utc::now().naive_utc()).await
    }

    pub(crate) async fn fetch_and_claim_due_at(
        pool: &SqlitePool,
        limit: i64,
        now: NaiveDateTime,
    ) -> AppResult<Vec<DeliveryTask>> {
        let expired = Self::expire_overdue_at(pool, now).await?;
        if expired > 0 {
            tracing::info!("Moved {} expired queued deliveries to DLQ", expired);
        }

        let mut tasks: Vec<DeliveryTask> = Vec::new();
        if limit <= 0 {
            return Ok(tasks);
        }

        for _ in 0..(limit as usize) {
            let claimed = sqlx::query_as::<_, DeliveryTask>(
                r#"
                UPDATE delivery_queue
                SET status = 'processing', updated_at = ?
                WHERE id = (
                    SELECT id FROM delivery_queue
                    WHERE status = 'pending'
                      AND next_attempt_at <= ?
                      AND (expires_at IS NULL OR expires_at > ?)
                    ORDER BY next_attempt_at ASC, created_at ASC
                    LIMIT 1
                )
                RETURNING
                    id, webhook_id, webhook_url, event_kind, payload_json,
                    attempts, max_attempts, next_attempt_at, expires_at,
                    last_error, status, created_at, updated_at
                "#,
            )
            .bind(now)
            .bind(now)
            .bind(now)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?;

            match claimed {
                Some(task) => tasks.push(task),
                None => break,
            }
        }

        Ok(tasks)
    }

    pub async fn mark_succeeded(pool: &SqlitePool, id: &str) -> AppResult<DeliveryTask> {
        let now = Utc::now().naive_utc();
        let row = sqlx::query_as::<_, DeliveryTask>(
            r#"
            UPDATE delivery_queue
            SET status = 'succeeded', last_error = NULL, updated_at = ?
            WHERE id = ?
            RETURNING
                id, webhook_id, webhook_url, event_kind, payload_json,
                attempts, max_attempts, next_attempt_at, expires_at,
                last_error, status, created_at, updated_at
            "#,
        )
        .bind(now)
        .bind(id)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Count a failed attempt and reschedule. A task whose attempts reach
    /// `max_attempts` becomes 'dead' instead of 'pending'.
    pub async fn register_attempt_and_schedule(
        pool: &SqlitePool,
        id: &str,
        next_attempt_at: NaiveDateTime,
        last_error: Option<String>,
    ) -> AppResult<DeliveryTask> {
        let now = Utc::now().naive_utc();
        let row = sqlx::query_as::<_, DeliveryTask>(
            r#"
            UPDATE delivery_queue
            SET
                attempts = attempts + 1,
                next_attempt_at = ?,
                last_error = ?,
                status = CASE WHEN attempts + 1 >= max_attempts THEN 'dead' ELSE 'pending' END,
                updated_at = ?
            WHERE id = ?
            RETURNING
                id, webhook_id, webhook_url, event_kind, payload_json,
                attempts, max_attempts, next_attempt_at, expires_at,
                last_error, status, created_at, updated_at
            "#,
        )
        .bind(next_attempt_at)
        .bind(last_error)
        .bind(now)
        .bind(id)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn mark_dead(
        pool: &SqlitePool,
        id: &str,
        last_error: Option<String>,
    ) -> AppResult<DeliveryTask> {
        let now = Utc::now().naive_utc();
        let row = sqlx::query_as::<_, DeliveryTask>(
            r#"
            UPDATE delivery_queue
            SET status = 'dead', last_error = COALESCE(?, last_error), updated_at = ?
            WHERE id = ?
            RETURNING
                id, webhook_id, webhook_url, event_kind, payload_json,
                attempts, max_attempts, next_attempt_at, expires_at,
                last_error, status, created_at, updated_at
            "#,
        )
        .bind(last_error)
        .bind(now)
        .bind(id)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<DeliveryTask>> {
        let row = sqlx::query_as::<_, DeliveryTask>(
            r#"
            SELECT
                id, webhook_id, webhook_url, event_kind, payload_json,
                attempts, max_attempts, next_attempt_at, expires_at,
                last_error, status, created_at, updated_at
            FROM delivery_queue
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Hand one claimed task back to the queue without counting an attempt.
    pub async fn release(pool: &SqlitePool, id: &str) -> AppResult<bool> {
        let now = Utc::now().naive_utc();
        let result = sqlx::query(
            "UPDATE delivery_queue SET status = 'pending', updated_at = ? WHERE id = ? AND status = 'processing'",
        )
        .bind(now)
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    /// Return tasks left in 'processing' by a previous run to 'pending'.
    pub async fn release_processing(pool: &SqlitePool) -> AppResult<u64> {
        let now = Utc::now().naive_utc();
        let result = sqlx::query(
            "UPDATE delivery_queue SET status = 'pending', updated_at = ? WHERE status = 'processing'",
        )
        .bind(now)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected())
    }

    /// Task counts per status, for the health endpoint.
    pub async fn count_by_status(pool: &SqlitePool) -> AppResult<Vec<(String, i64)>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM delivery_queue GROUP BY status ORDER BY status",
        )
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }
}
