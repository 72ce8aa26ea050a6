use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use sqlx::SqlitePool;

use crate::config::DeliveryRetryConfig;
use crate::db::models::{CreateDeliveryTask, DeliveryTask, TASK_DEAD};
use crate::db::DeliveryQueueRepository;
use crate::error::{AppError, AppResult};
use crate::services::delivery::{deliver_one, is_retryable_error, DeliverySink};
use crate::services::discord::WebhookMessage;
use crate::services::dispatcher::OutboundMessage;
use crate::services::format::mask_webhook_url;

/// Delay before retry number `attempts + 1`: `initial * 2^attempts`, capped at `max`.
pub fn backoff_seconds(initial: u64, max: u64, attempts: u32) -> u64 {
    let mut delay = initial.min(max);
    for _ in 0..attempts {
        delay = delay.saturating_mul(2);
        if delay >= max {
            return max;
        }
    }
    delay
}

/// Moves failed deliveries through the durable queue.
#[derive(Clone)]
pub struct DeliveryRetryService {
    pool: SqlitePool,
    sink: Arc<dyn DeliverySink>,
    config: DeliveryRetryConfig,
    timeout: Duration,
}

impl DeliveryRetryService {
    pub fn new(
        pool: SqlitePool,
        sink: Arc<dyn DeliverySink>,
        config: DeliveryRetryConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            pool,
            sink,
            config,
            timeout,
        }
    }

    /// Queue a message that failed during an ingestion cycle.
    ///
    /// Returns `None` without touching the queue when retries are disabled.
    pub async fn enqueue_failure(
        &self,
        message: &OutboundMessage,
        error: &AppError,
    ) -> AppResult<Option<DeliveryTask>> {
        if !self.config.enabled {
            tracing::warn!(
                "Retries disabled, dropping failed {} for webhook {}",
                message.kind(),
                message.webhook_id
            );
            return Ok(None);
        }

        let payload_json = serde_json::to_string(&message.payload)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to encode payload: {}", e)))?;

        let now = Utc::now().naive_utc();
        let next_attempt_at = now + chrono::Duration::seconds(self.config.initial_backoff_seconds as i64);
        let expires_at = now + chrono::Duration::seconds(self.config.ttl_seconds as i64);

        let task = DeliveryQueueRepository::create(
            &self.pool,
            CreateDeliveryTask {
                webhook_id: message.webhook_id.clone(),
                webhook_url: message.webhook_url.clone(),
                event_kind: message.kind().to_string(),
                payload_json,
                last_error: Some(error.to_string()),
                max_attempts: Some(self.config.max_attempts as i32),
                next_attempt_at: Some(next_attempt_at),
                expires_at: Some(expires_at),
            },
        )
        .await?;

        tracing::info!(
            "Enqueued delivery retry: task={}, webhook={}, next_attempt_at={}, expires_at={}",
            task.id,
            task.webhook_id,
            next_attempt_at,
            expires_at
        );
        Ok(Some(task))
    }

    /// Process a batch of claimed tasks.
    ///
    /// Tasks for the same webhook run one after another in claim order;
    /// different webhooks run concurrently. A task whose processing errors is
    /// released back to 'pending'.
    pub async fn process_claimed(&self, tasks: Vec<DeliveryTask>) {
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<DeliveryTask>> = HashMap::new();
        for task in tasks {
            if !groups.contains_key(&task.webhook_id) {
                order.push(task.webhook_id.clone());
            }
            groups.entry(task.webhook_id.clone()).or_default().push(task);
        }

        let runs = order
            .into_iter()
            .filter_map(|webhook_id| groups.remove(&webhook_id))
            .map(|group| async move {
                for task in group {
                    let id = task.id.clone();
                    if let Err(e) = self.process_queued_task(task).await {
                        tracing::warn!("Delivery retry task {} failed: {:?}", id, e);
                        if let Err(e) = DeliveryQueueRepository::release(&self.pool, &id).await {
                            tracing::error!("Failed to release delivery task {}: {:?}", id, e);
                        }
                    }
                }
            });

        join_all(runs).await;
    }

    /// Redeliver one claimed task and record the outcome.
    ///
    /// Expired tasks and permanent failures go to 'dead'. Transient failures are
    /// rescheduled with exponential backoff until `max_attempts` is reached.
    pub async fn process_queued_task(&self, task: DeliveryTask) -> AppResult<DeliveryTask> {
        let now = Utc::now().naive_utc();

        if let Some(expires_at) = task.expires_at {
            if expires_at <= now {
                tracing::info!("Queued delivery {} expired, moving to DLQ", task.id);
                return DeliveryQueueRepository::mark_dead(
                    &self.pool,
                    &task.id,
                    Some("expired".to_string()),
                )
                .await;
            }
        }

        let payload: WebhookMessage = match serde_json::from_str(&task.payload_json) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("Queued delivery {} has an unreadable payload: {}", task.id, e);
                return DeliveryQueueRepository::mark_dead(
                    &self.pool,
                    &task.id,
                    Some(format!("Invalid payload: {}", e)),
                )
                .await;
            }
        };

        match deliver_one(self.sink.as_ref(), &task.webhook_url, &payload, self.timeout).await {
            Ok(()) => {
                tracing::info!(
                    "Queued {} delivered to webhook {} on attempt {}",
                    task.event_kind,
                    task.webhook_id,
                    task.attempts + 1
                );
                DeliveryQueueRepository::mark_succeeded(&self.pool, &task.id).await
            }
            Err(e) => {
                let err_str = e.to_string();

                if !is_retryable_error(&err_str) {
                    tracing::warn!(
                        "Queued delivery {} to {} failed permanently, moving to DLQ: {}",
                        task.id,
                        mask_webhook_url(&task.webhook_url),
                        err_str
                    );
                    return DeliveryQueueRepository::mark_dead(&self.pool, &task.id, Some(err_str))
                        .await;
                }

                // Enqueueing already waited `initial`, so the first retry waits twice that.
                let delay = backoff_seconds(
                    self.config.initial_backoff_seconds,
                    self.config.max_backoff_seconds,
                    task.attempts.max(0) as u32 + 1,
                );
                let next = now + chrono::Duration::seconds(delay as i64);

                let updated = DeliveryQueueRepository::register_attempt_and_schedule(
                    &self.pool,
                    &task.id,
                    next,
                    Some(err_str),
                )
                .await?;

                if updated.status == TASK_DEAD {
                    tracing::warn!(
                        "Queued delivery {} reached max attempts and moved to DLQ",
                        task.id
                    );
                } else {
                    tracing::info!(
                        "Queued delivery {} rescheduled in {}s (attempt {}/{})",
                        task.id,
                        delay,
                        updated.attempts,
                        updated.max_attempts
                    );
                }
                Ok(updated)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{CreateWebhook, Webhook, TASK_PENDING, TASK_SUCCEEDED};
    use crate::db::WebhookRepository;
    use crate::services::detector::ChangeEvent;
    use crate::test_support::{test_pool, RecordingSink};

    fn retry_config() -> DeliveryRetryConfig {
        DeliveryRetryConfig {
            enabled: true,
            initial_backoff_seconds: 30,
            poll_interval_seconds: 5,
            max_attempts: 3,
            worker_concurrency: 4,
            max_backoff_seconds: 3600,
            ttl_seconds: 86400,
        }
    }

    async fn failed_message(pool: &SqlitePool) -> OutboundMessage {
        let webhook = WebhookRepository::create(
            pool,
            CreateWebhook {
                name: "hook".to_string(),
                url: "https://discord.com/api/webhooks/1/token".to_string(),
            },
        )
        .await
        .unwrap();
        message_for(&webhook, "c1")
    }

    fn message_for(webhook: &Webhook, campaign_id: &str) -> OutboundMessage {
        OutboundMessage {
            event: ChangeEvent::CampaignStarted {
                game_id: "g1".to_string(),
                campaign_id: campaign_id.to_string(),
            },
            webhook_id: webhook.id.clone(),
            webhook_url: webhook.url.clone(),
            payload: WebhookMessage {
                content: Some(format!("Game g1: Campaign {}", campaign_id)),
                username: Some("Twitch Drops".to_string()),
                avatar_url: None,
                embeds: None,
            },
        }
    }

    fn service(pool: &SqlitePool, sink: Arc<RecordingSink>, config: DeliveryRetryConfig) -> DeliveryRetryService {
        DeliveryRetryService::new(pool.clone(), sink, config, Duration::from_secs(5))
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        assert_eq!(backoff_seconds(30, 3600, 0), 30);
        assert_eq!(backoff_seconds(30, 3600, 1), 60);
        assert_eq!(backoff_seconds(30, 3600, 3), 240);
        assert_eq!(backoff_seconds(30, 3600, 10), 3600);
        assert_eq!(backoff_seconds(30, 3600, 200), 3600);
        assert_eq!(backoff_seconds(5000, 3600, 0), 3600);
    }

    #[tokio::test]
    async fn enqueue_stores_the_rendered_payload() {
        let pool = test_pool().await;
        let message = failed_message(&pool).await;
        let svc = service(&pool, Arc::new(RecordingSink::new()), retry_config());

        let task = svc
            .enqueue_failure(&message, &AppError::DeliveryFailed("timed out".to_string()))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(task.status, TASK_PENDING);
        assert_eq!(task.event_kind, "campaign_started");
        assert_eq!(task.max_attempts, 3);
        assert!(task.expires_at.is_some());
        let stored: WebhookMessage = serde_json::from_str(&task.payload_json).unwrap();
        assert_eq!(stored, message.payload);
    }

    #[tokio::test]
    async fn enqueue_is_skipped_when_disabled() {
        let pool = test_pool().await;
        let message = failed_message(&pool).await;
        let mut config = retry_config();
        config.enabled = false;
        let svc = service(&pool, Arc::new(RecordingSink::new()), config);

        let task = svc
            .enqueue_failure(&message, &AppError::DeliveryFailed("timed out".to_string()))
            .await
            .unwrap();
        assert!(task.is_none());
    }

    #[tokio::test]
    async fn successful_retry_marks_task_succeeded() {
        let pool = test_pool().await;
        let message = failed_message(&pool).await;
        let sink = Arc::new(RecordingSink::new());
        let svc = service(&pool, sink.clone(), retry_config());
        let task = svc
            .enqueue_failure(&message, &AppError::DeliveryFailed("timed out".to_string()))
            .await
            .unwrap()
            .unwrap();

        let done = svc.process_queued_task(task).await.unwrap();
        assert_eq!(done.status, TASK_SUCCEEDED);
        assert_eq!(sink.urls(), vec![message.webhook_url.clone()]);
        assert_eq!(sink.calls.lock().unwrap()[0].1, message.payload);
    }

    #[tokio::test]
    async fn transient_failure_is_rescheduled_until_max_attempts() {
        let pool = test_pool().await;
        let message = failed_message(&pool).await;
        let sink = Arc::new(RecordingSink::new().failing_for(&message.webhook_url));
        let svc = service(&pool, sink, retry_config());
        let task = svc
            .enqueue_failure(&message, &AppError::DeliveryFailed("timed out".to_string()))
            .await
            .unwrap()
            .unwrap();

        let first = svc.process_queued_task(task).await.unwrap();
        assert_eq!(first.status, TASK_PENDING);
        assert_eq!(first.attempts, 1);
        assert!(first.next_attempt_at > Utc::now().naive_utc());

        let second = svc.process_queued_task(first).await.unwrap();
        assert_eq!(second.status, TASK_PENDING);
        let third = svc.process_queued_task(second).await.unwrap();
        assert_eq!(third.status, TASK_DEAD);
        assert_eq!(third.attempts, 3);
    }

    #[tokio::test]
    async fn permanent_failure_goes_straight_to_dead() {
        let pool = test_pool().await;
        let message = failed_message(&pool).await;
        let sink = Arc::new(RecordingSink::new().rejecting_for(&message.webhook_url));
        let svc = service(&pool, sink, retry_config());
        let task = svc
            .enqueue_failure(&message, &AppError::DeliveryFailed("timed out".to_string()))
            .await
            .unwrap()
            .unwrap();

        let done = svc.process_queued_task(task).await.unwrap();
        assert_eq!(done.status, TASK_DEAD);
        assert_eq!(done.attempts, 0);
        assert!(done.last_error.unwrap().contains("404"));
    }

    #[tokio::test]
    async fn expired_task_is_not_delivered() {
        let pool = test_pool().await;
        let message = failed_message(&pool).await;
        let sink = Arc::new(RecordingSink::new());
        let svc = service(&pool, sink.clone(), retry_config());
        let mut task = svc
            .enqueue_failure(&message, &AppError::DeliveryFailed("timed out".to_string()))
            .await
            .unwrap()
            .unwrap();
        task.expires_at = Some(Utc::now().naive_utc() - chrono::Duration::seconds(1));

        let done = svc.process_queued_task(task).await.unwrap();
        assert_eq!(done.status, TASK_DEAD);
        assert_eq!(done.last_error.as_deref(), Some("expired"));
        assert_eq!(sink.call_count(), 0);
    }

    #[tokio::test]
    async fn reschedule_waits_double_the_previous_delay() {
        let pool = test_pool().await;
        let message = failed_message(&pool).await;
        let sink = Arc::new(RecordingSink::new().failing_for(&message.webhook_url));
        let svc = service(&pool, sink, retry_config());
        let task = svc
            .enqueue_failure(&message, &AppError::DeliveryFailed("timed out".to_string()))
            .await
            .unwrap()
            .unwrap();
        let first_wait = (task.next_attempt_at - task.created_at).num_seconds();
        assert!((29..=30).contains(&first_wait), "waited {}s", first_wait);

        let before = Utc::now().naive_utc();
        let first = svc.process_queued_task(task).await.unwrap();
        let second_wait = (first.next_attempt_at - before).num_seconds();
        assert!((60..=61).contains(&second_wait), "waited {}s", second_wait);

        let before = Utc::now().naive_utc();
        let second = svc.process_queued_task(first).await.unwrap();
        let third_wait = (second.next_attempt_at - before).num_seconds();
        assert!((120..=121).contains(&third_wait), "waited {}s", third_wait);
    }

    #[tokio::test]
    async fn claimed_tasks_keep_their_order_per_webhook() {
        let pool = test_pool().await;
        let mut webhooks = Vec::new();
        for n in 1..=2 {
            webhooks.push(
                WebhookRepository::create(
                    &pool,
                    CreateWebhook {
                        name: format!("hook {}", n),
                        url: format!("https://discord.com/api/webhooks/{}/token", n),
                    },
                )
                .await
                .unwrap(),
            );
        }

        let sink = Arc::new(RecordingSink::new().with_delay(Duration::from_millis(20)));
        let mut config = retry_config();
        config.initial_backoff_seconds = 0;
        let svc = service(&pool, sink.clone(), config);
        for campaign in ["c1", "c2", "c3"] {
            for webhook in &webhooks {
                svc.enqueue_failure(
                    &message_for(webhook, campaign),
                    &AppError::DeliveryFailed("timed out".to_string()),
                )
                .await
                .unwrap();
            }
        }

        let later = Utc::now().naive_utc() + chrono::Duration::seconds(1);
        let claimed = DeliveryQueueRepository::fetch_and_claim_due_at(&pool, 10, later)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 6);
        svc.process_claimed(claimed).await;

        let calls = sink.calls.lock().unwrap().clone();
        for webhook in &webhooks {
            let contents: Vec<_> = calls
                .iter()
                .filter(|(url, _)| *url == webhook.url)
                .map(|(_, msg)| msg.content.clone().unwrap())
                .collect();
            assert_eq!(
                contents,
                vec!["Game g1: Campaign c1", "Game g1: Campaign c2", "Game g1: Campaign c3"]
            );
        }
        let counts = DeliveryQueueRepository::count_by_status(&pool).await.unwrap();
        assert_eq!(counts, vec![(TASK_SUCCEEDED.to_string(), 6)]);
    }

    #[tokio::test]
    async fn task_that_errors_is_released_to_pending() {
        let pool = test_pool().await;
        let message = failed_message(&pool).await;
        let sink = Arc::new(RecordingSink::new());
        let svc = service(&pool, sink.clone(), retry_config());
        let task = svc
            .enqueue_failure(&message, &AppError::DeliveryFailed("timed out".to_string()))
            .await
            .unwrap()
            .unwrap();
        let later = task.next_attempt_at + chrono::Duration::seconds(1);
        let claimed = DeliveryQueueRepository::fetch_and_claim_due_at(&pool, 1, later)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);

        // Recording the success fails, so the task cannot be settled.
        sqlx::query(
            r#"
            CREATE TRIGGER refuse_success BEFORE UPDATE OF status ON delivery_queue
            WHEN NEW.status = 'succeeded'
            BEGIN
                SELECT RAISE(ABORT, 'disk full');
            END
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();

        svc.process_claimed(claimed).await;

        assert_eq!(sink.call_count(), 1);
        let stored = DeliveryQueueRepository::find_by_id(&pool, &task.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, TASK_PENDING);
        assert_eq!(stored.attempts, 0);
    }
}
