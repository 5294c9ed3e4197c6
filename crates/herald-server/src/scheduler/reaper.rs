//! Stale-claim reaper tick.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};

use herald_core::RetryPolicy;
use herald_db::{JobStore, ReapReport};

pub struct Reaper {
    store: Arc<dyn JobStore>,
    policy: RetryPolicy,
    stale_job_after: TimeDelta,
    stale_delivery_after: TimeDelta,
}

impl Reaper {
    pub fn new(
        store: Arc<dyn JobStore>,
        policy: RetryPolicy,
        stale_job_after: TimeDelta,
        stale_delivery_after: TimeDelta,
    ) -> Self {
        Self {
            store,
            policy,
            stale_job_after,
            stale_delivery_after,
        }
    }

    /// Recovers running jobs and sending deliveries whose claims have outlived
    /// their thresholds. Returns `(jobs, deliveries)`; a store failure on one
    /// side is logged and reported as an empty pass.
    pub async fn tick(&self, now: DateTime<Utc>) -> (ReapReport, ReapReport) {
        let jobs = match self
            .store
            .reap_stale_jobs(now - self.stale_job_after, &self.policy, now)
            .await
        {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(error = %e, "reaper: stale job pass failed");
                ReapReport::default()
            }
        };
        log_report("jobs", &jobs);

        let deliveries = match self
            .store
            .reap_stale_deliveries(now - self.stale_delivery_after, &self.policy, now)
            .await
        {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(error = %e, "reaper: stale delivery pass failed");
                ReapReport::default()
            }
        };
        log_report("deliveries", &deliveries);

        (jobs, deliveries)
    }
}

fn log_report(kind: &'static str, report: &ReapReport) {
    if report.is_empty() {
        tracing::debug!(kind, "reaper: nothing stale");
        return;
    }
    for id in &report.requeued {
        tracing::warn!(kind, %id, "reaper: stale claim returned to pending");
    }
    for id in &report.failed {
        tracing::error!(kind, %id, "reaper: stale claim exhausted retries; marked failed");
    }
}

#[cfg(test)]
mod tests {
    use herald_core::{JobStatus, NewGenerationJob};
    use herald_db::InMemoryJobStore;
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::test_support::t0;

    fn reaper(store: &InMemoryJobStore) -> Reaper {
        Reaper::new(
            Arc::new(store.clone()),
            RetryPolicy::default(),
            TimeDelta::minutes(20),
            TimeDelta::minutes(5),
        )
    }

    #[tokio::test]
    async fn abandoned_job_returns_to_pending_after_threshold() {
        let store = InMemoryJobStore::default();
        let job = store
            .create_job(NewGenerationJob::manual(Uuid::new_v4(), json!({}), 3, false), t0())
            .await
            .unwrap()
            .created()
            .cloned()
            .unwrap();
        store.claim_next_pending("crashed", t0()).await.unwrap();

        let (early, _) = reaper(&store).tick(t0() + TimeDelta::minutes(19)).await;
        assert!(early.is_empty());

        let (late, deliveries) = reaper(&store).tick(t0() + TimeDelta::minutes(21)).await;
        assert_eq!(late.requeued, vec![job.id]);
        assert!(deliveries.is_empty());

        let reaped = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(reaped.status, JobStatus::Pending);
        assert_eq!(reaped.retry_count, 1);
        assert!(reaped.claimed_by.is_none());
    }

    #[tokio::test]
    async fn abandoned_delivery_is_reaped_on_its_own_threshold() {
        let store = InMemoryJobStore::default();
        let job = store
            .create_job(NewGenerationJob::manual(Uuid::new_v4(), json!({}), 3, true), t0())
            .await
            .unwrap()
            .created()
            .cloned()
            .unwrap();
        store.claim_next_pending("w1", t0()).await.unwrap();
        store.complete_job(job.id, "w1", "art-1", t0(), 3, t0()).await.unwrap();
        let delivery = store.claim_due_delivery("d1", t0(), t0()).await.unwrap().unwrap();

        let (_, deliveries) = reaper(&store).tick(t0() + TimeDelta::minutes(6)).await;
        assert_eq!(deliveries.requeued, vec![delivery.id]);
    }
}
