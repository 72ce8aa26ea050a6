use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use crate::error::{AppError, AppResult};
use crate::services::discord::WebhookMessage;
use crate::services::dispatcher::OutboundMessage;
use crate::services::format::mask_webhook_url;

/// Outbound transport for rendered messages.
#[async_trait]
pub trait DeliverySink: Send + Sync + 'static {
    async fn deliver(&self, webhook_url: &str, payload: &WebhookMessage) -> AppResult<()>;
}

#[derive(Debug)]
pub struct DeliveryFailure {
    /// Position of the message in the delivered batch.
    pub index: usize,
    pub error: AppError,
}

/// Per-message outcome of a delivery batch. Indices refer to the input slice.
#[derive(Debug, Default)]
pub struct DeliveryReport {
    pub succeeded: Vec<usize>,
    pub failed: Vec<DeliveryFailure>,
}

impl DeliveryReport {
    pub fn success_count(&self) -> usize {
        self.succeeded.len()
    }

    pub fn failure_count(&self) -> usize {
        self.failed.len()
    }
}

/// Send one message with a deadline. Any failure is reported as `DeliveryFailed`.
pub async fn deliver_one(
    sink: &dyn DeliverySink,
    webhook_url: &str,
    payload: &WebhookMessage,
    timeout: Duration,
) -> AppResult<()> {
    match tokio::time::timeout(timeout, sink.deliver(webhook_url, payload)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(AppError::DeliveryFailed(e.to_string())),
        Err(_) => Err(AppError::DeliveryFailed(format!(
            "timed out after {:?}",
            timeout
        ))),
    }
}

/// Deliver `messages` through `sink`.
///
/// Messages for the same webhook go out one at a time in input order; up to
/// `concurrency` webhooks are served at once. A failed or timed out message
/// does not stop the ones after it.
pub async fn deliver_all(
    messages: &[OutboundMessage],
    sink: &dyn DeliverySink,
    timeout: Duration,
    concurrency: usize,
) -> DeliveryReport {
    let mut groups: Vec<Vec<usize>> = Vec::new();
    let mut group_of: HashMap<&str, usize> = HashMap::new();
    for (index, message) in messages.iter().enumerate() {
        let group = *group_of
            .entry(message.webhook_id.as_str())
            .or_insert_with(|| {
                groups.push(Vec::new());
                groups.len() - 1
            });
        groups[group].push(index);
    }

    let outcomes: Vec<Vec<(usize, AppResult<()>)>> = stream::iter(groups)
        .map(|indices| async move {
            let mut results = Vec::with_capacity(indices.len());
            for index in indices {
                let message = &messages[index];
                let result = deliver_one(sink, &message.webhook_url, &message.payload, timeout).await;
                if let Err(e) = &result {
                    tracing::warn!(
                        "Delivery of {} to webhook {} ({}) failed: {}",
                        message.kind(),
                        message.webhook_id,
                        mask_webhook_url(&message.webhook_url),
                        e
                    );
                }
                results.push((index, result));
            }
            results
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut flat: Vec<(usize, AppResult<()>)> = outcomes.into_iter().flatten().collect();
    flat.sort_by_key(|(index, _)| *index);

    let mut report = DeliveryReport::default();
    for (index, result) in flat {
        match result {
            Ok(()) => report.succeeded.push(index),
            Err(error) => report.failed.push(DeliveryFailure { index, error }),
        }
    }
    report
}

/// Heuristics to decide whether a delivery error is likely transient and should be retried.
/// This inspects common HTTP API messages and network error strings.
pub fn is_retryable_error(err: &str) -> bool {
    let e = err.to_lowercase();

    // Status codes in messages shaped like "Discord webhook error (502): ..."
    if let Some(start) = e.find("discord webhook error (") {
        let rest = &e[start + "discord webhook error (".len()..];
        if let Some(close) = rest.find(')') {
            if let Ok(code) = rest[..close].parse::<u16>() {
                return code == 429 || code >= 500;
            }
        }
    }

    // Common transient indicators
    e.contains("too many requests")
        || e.contains("timeout")
        || e.contains("timed out")
        || e.contains("temporarily unavailable")
        || e.contains("service unavailable")
        || e.contains("bad gateway")
        || e.contains("connection reset")
        || e.contains("connection refused")
        || e.contains("failed to send")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::detector::ChangeEvent;
    use crate::test_support::RecordingSink;

    fn message(webhook: &str, drop_id: &str) -> OutboundMessage {
        OutboundMessage {
            event: ChangeEvent::NewDrop {
                game_id: "g1".to_string(),
                campaign_id: "c1".to_string(),
                drop_id: drop_id.to_string(),
            },
            webhook_id: webhook.to_string(),
            webhook_url: format!("https://discord.com/api/webhooks/{}/token", webhook),
            payload: WebhookMessage {
                content: Some(format!("{} -> {}", drop_id, webhook)),
                username: None,
                avatar_url: None,
                embeds: None,
            },
        }
    }

    fn url(webhook: &str) -> String {
        format!("https://discord.com/api/webhooks/{}/token", webhook)
    }

    #[tokio::test]
    async fn one_failure_does_not_affect_the_rest() {
        let messages = vec![message("w1", "d1"), message("w2", "d1"), message("w3", "d1")];
        let sink = RecordingSink::new().failing_for(&url("w2"));

        let report = deliver_all(&messages, &sink, Duration::from_secs(5), 4).await;

        assert_eq!(report.success_count(), 2);
        assert_eq!(report.failure_count(), 1);
        assert_eq!(report.succeeded, vec![0, 2]);
        assert_eq!(report.failed[0].index, 1);
        assert!(matches!(report.failed[0].error, AppError::DeliveryFailed(_)));
    }

    #[tokio::test]
    async fn messages_for_one_webhook_keep_their_order() {
        let messages = vec![
            message("w1", "d1"),
            message("w2", "d1"),
            message("w1", "d2"),
            message("w2", "d2"),
            message("w1", "d3"),
        ];
        let sink = RecordingSink::new().with_delay(Duration::from_millis(5));

        let report = deliver_all(&messages, &sink, Duration::from_secs(5), 8).await;
        assert_eq!(report.success_count(), 5);

        let calls = sink.calls.lock().unwrap();
        let w1: Vec<_> = calls
            .iter()
            .filter(|(u, _)| u == &url("w1"))
            .map(|(_, p)| p.content.clone().unwrap())
            .collect();
        assert_eq!(w1, vec!["d1 -> w1", "d2 -> w1", "d3 -> w1"]);
    }

    #[tokio::test]
    async fn stalled_webhook_times_out_without_blocking_others() {
        let messages = vec![message("slow", "d1"), message("fast", "d1"), message("slow", "d2")];
        let sink = RecordingSink::new().stalling_for(&url("slow"));

        let report = deliver_all(&messages, &sink, Duration::from_millis(50), 2).await;

        assert_eq!(report.succeeded, vec![1]);
        let failed: Vec<_> = report.failed.iter().map(|f| f.index).collect();
        assert_eq!(failed, vec![0, 2]);
        assert!(report.failed[0].error.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn empty_batch_reports_nothing() {
        let sink = RecordingSink::new();
        let report = deliver_all(&[], &sink, Duration::from_secs(1), 4).await;
        assert_eq!(report.success_count() + report.failure_count(), 0);
        assert_eq!(sink.call_count(), 0);
    }

    #[test]
    fn retryable_errors() {
        assert!(is_retryable_error(
            "Delivery failed: Discord error: Discord webhook error (503): unavailable"
        ));
        assert!(is_retryable_error("Discord webhook error (429): slow down"));
        assert!(is_retryable_error("Delivery failed: timed out after 10s"));
        assert!(!is_retryable_error(
            "Discord error: Discord webhook error (404): Unknown Webhook"
        ));
        assert!(!is_retryable_error("Invalid payload"));
    }
}
