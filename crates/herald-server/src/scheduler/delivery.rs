//! Delivery scheduler tick: claim every due delivery and send it.
//!
//! Claims are made lazily, one per free send slot, so at most `concurrency`
//! deliveries sit in `sending` on behalf of this process at any instant.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};

use herald_core::{CollaboratorError, Delivery, RetryPolicy, Sender};
use herald_db::{DbError, JobStore};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
    /// Sends whose claim was lost before the result could be recorded.
    pub lost: usize,
}

impl DispatchReport {
    fn record(&mut self, outcome: SendOutcome) {
        match outcome {
            SendOutcome::Sent => self.sent += 1,
            SendOutcome::Retried => self.retried += 1,
            SendOutcome::Failed => self.failed += 1,
            SendOutcome::Lost => self.lost += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendOutcome {
    Sent,
    Retried,
    Failed,
    Lost,
}

pub struct DeliveryDispatcher {
    store: Arc<dyn JobStore>,
    sender: Arc<dyn Sender>,
    policy: RetryPolicy,
    worker_id: String,
    concurrency: usize,
    send_timeout: Duration,
}

impl DeliveryDispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        sender: Arc<dyn Sender>,
        policy: RetryPolicy,
        worker_id: impl Into<String>,
        concurrency: usize,
        send_timeout: Duration,
    ) -> Self {
        Self {
            store,
            sender,
            policy,
            worker_id: worker_id.into(),
            concurrency: concurrency.max(1),
            send_timeout,
        }
    }

    /// Claims every delivery due by `due_by` and sends them with bounded
    /// concurrency.
    ///
    /// `due_by` is fixed for the whole pass; each claim is stamped with the
    /// wall-clock instant it is taken, so a long backlog never hands the
    /// reaper a claim that already looks stale.
    pub async fn tick(&self, due_by: DateTime<Utc>) -> DispatchReport {
        let mut report = DispatchReport::default();
        let mut in_flight = FuturesUnordered::new();
        let mut drained = false;

        loop {
            while !drained && in_flight.len() < self.concurrency {
                match self.claim_next(due_by).await {
                    Some(delivery) => in_flight.push(self.send_one(delivery)),
                    None => drained = true,
                }
            }

            match in_flight.next().await {
                Some(outcome) => report.record(outcome),
                None => break,
            }
        }

        report
    }

    async fn claim_next(&self, due_by: DateTime<Utc>) -> Option<Delivery> {
        match self
            .store
            .claim_due_delivery(&self.worker_id, due_by, Utc::now())
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                tracing::error!(
                    worker_id = %self.worker_id,
                    error = %e,
                    "delivery: claim failed; ending tick"
                );
                None
            }
        }
    }

    async fn send_one(&self, delivery: Delivery) -> SendOutcome {
        let send = self.sender.send(&delivery);
        let result = match tokio::time::timeout(self.send_timeout, send).await {
            Ok(result) => result,
            Err(_) => Err(CollaboratorError::timeout(self.send_timeout)),
        };

        match result {
            Ok(receipt_id) => self.record_sent(&delivery, &receipt_id).await,
            Err(err) => self.record_failure(&delivery, &err).await,
        }
    }

    async fn record_sent(&self, delivery: &Delivery, receipt_id: &str) -> SendOutcome {
        match self
            .store
            .mark_delivery_sent(delivery.id, &self.worker_id, receipt_id, Utc::now())
            .await
        {
            Ok(_) => {
                tracing::info!(
                    delivery_id = %delivery.id,
                    recipient_id = %delivery.recipient_id,
                    receipt_id,
                    "delivery: sent"
                );
                SendOutcome::Sent
            }
            Err(e) => {
                Self::log_store_error(delivery, &e, "delivery: sent but could not record it");
                SendOutcome::Lost
            }
        }
    }

    async fn record_failure(&self, delivery: &Delivery, err: &CollaboratorError) -> SendOutcome {
        match self
            .store
            .fail_delivery(
                delivery.id,
                &self.worker_id,
                err.class,
                &err.message,
                &self.policy,
                Utc::now(),
            )
            .await
        {
            Ok(updated) if updated.status.is_terminal() => {
                tracing::error!(
                    delivery_id = %delivery.id,
                    retry_count = updated.retry_count,
                    error = %err,
                    "delivery: send failed permanently"
                );
                SendOutcome::Failed
            }
            Ok(updated) => {
                tracing::warn!(
                    delivery_id = %delivery.id,
                    retry_count = updated.retry_count,
                    not_before = ?updated.not_before,
                    error = %err,
                    "delivery: send failed; will retry"
                );
                SendOutcome::Retried
            }
            Err(e) => {
                Self::log_store_error(delivery, &e, "delivery: could not record send failure");
                SendOutcome::Lost
            }
        }
    }

    fn log_store_error(delivery: &Delivery, err: &DbError, message: &'static str) {
        if matches!(err, DbError::ClaimLost { .. }) {
            tracing::warn!(delivery_id = %delivery.id, error = %err, "{message}");
        } else {
            tracing::error!(delivery_id = %delivery.id, error = %err, "{message}");
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;
    use herald_core::{DeliveryStatus, NewGenerationJob};
    use herald_db::InMemoryJobStore;
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::test_support::{t0, RecordingSender};

    async fn seed_delivery(store: &InMemoryJobStore, artifact: &str, deliver_at: DateTime<Utc>) {
        let job = store
            .create_job(NewGenerationJob::manual(Uuid::new_v4(), json!({}), 3, false), t0())
            .await
            .unwrap()
            .created()
            .cloned()
            .unwrap();
        store.claim_next_pending("w", t0()).await.unwrap();
        store
            .complete_job(job.id, "w", artifact, deliver_at, 2, t0())
            .await
            .unwrap();
    }

    fn dispatcher(store: &InMemoryJobStore, sender: Arc<dyn Sender>) -> DeliveryDispatcher {
        DeliveryDispatcher::new(
            Arc::new(store.clone()),
            sender,
            RetryPolicy::default(),
            "delivery-test",
            2,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn tick_sends_every_due_delivery_and_nothing_early() {
        let store = InMemoryJobStore::default();
        for i in 0..5 {
            seed_delivery(&store, &format!("due-{i}"), t0()).await;
        }
        seed_delivery(&store, "later", t0() + TimeDelta::hours(1)).await;
        let sender = Arc::new(RecordingSender::default());

        let report = dispatcher(&store, sender.clone()).tick(t0()).await;

        assert_eq!(report.sent, 5);
        assert_eq!(sender.sent().await.len(), 5);
        let deliveries = store.deliveries();
        let sent = deliveries
            .iter()
            .filter(|d| d.status == DeliveryStatus::Sent)
            .count();
        assert_eq!(sent, 5);
        let later = deliveries
            .iter()
            .find(|d| d.artifact_ref == "later")
            .unwrap();
        assert_eq!(later.status, DeliveryStatus::Pending);
        assert!(deliveries
            .iter()
            .filter(|d| d.status == DeliveryStatus::Sent)
            .all(|d| d.provider_receipt_id.is_some() && d.sent_at.is_some()));
    }

    #[tokio::test]
    async fn retryable_send_failure_requeues_then_fails() {
        let store = InMemoryJobStore::default();
        seed_delivery(&store, "flaky", t0()).await;
        let sender = Arc::new(RecordingSender::failing(CollaboratorError::retryable(
            "HTTP 503",
        )));
        let dispatcher = dispatcher(&store, sender);

        let first = dispatcher.tick(t0()).await;
        assert_eq!(first.retried, 1);
        let pending = store.deliveries().remove(0);
        assert_eq!(pending.status, DeliveryStatus::Pending);
        assert_eq!(pending.retry_count, 1);

        let second = dispatcher
            .tick(pending.not_before.expect("backoff sets not_before"))
            .await;
        assert_eq!(second.failed, 1);
        let failed = store.deliveries().remove(0);
        assert_eq!(failed.status, DeliveryStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("HTTP 503"));
    }

    #[tokio::test]
    async fn backlog_claims_are_stamped_when_taken() {
        let store = InMemoryJobStore::default();
        for i in 0..3 {
            seed_delivery(&store, &format!("backlog-{i}"), t0()).await;
        }
        let sender = Arc::new(RecordingSender::slow(Duration::from_millis(100)));
        let dispatcher = Arc::new(DeliveryDispatcher::new(
            Arc::new(store.clone()),
            sender.clone(),
            RetryPolicy::default(),
            "delivery-test",
            1,
            Duration::from_secs(5),
        ));

        let running = tokio::spawn({
            let dispatcher = Arc::clone(&dispatcher);
            async move { dispatcher.tick(t0()).await }
        });

        tokio::time::sleep(Duration::from_millis(250)).await;
        let now = Utc::now();
        let reaped = store
            .reap_stale_deliveries(
                now - TimeDelta::milliseconds(200),
                &RetryPolicy::default(),
                now,
            )
            .await
            .unwrap();
        assert!(reaped.is_empty(), "in-flight claim was reaped: {reaped:?}");

        let report = running.await.expect("tick task");
        assert_eq!(report.sent, 3);
        assert_eq!(report.lost, 0);
        assert_eq!(sender.sent().await.len(), 3);
        assert!(store
            .deliveries()
            .iter()
            .all(|d| d.status == DeliveryStatus::Sent && d.retry_count == 0));
    }

    #[tokio::test]
    async fn fatal_send_failure_fails_immediately() {
        let store = InMemoryJobStore::default();
        seed_delivery(&store, "bad", t0()).await;
        let sender = Arc::new(RecordingSender::failing(CollaboratorError::fatal(
            "recipient unsubscribed",
        )));

        let report = dispatcher(&store, sender).tick(t0()).await;
        assert_eq!(report.failed, 1);
        assert_eq!(store.deliveries()[0].retry_count, 0);
    }
}
