//! Generation scheduler tick: enqueue one job per due recipient.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use herald_core::{DueRecipients, NewGenerationJob};
use herald_db::{EnqueueOutcome, JobStore};

/// What one tick did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueReport {
    pub enqueued: usize,
    /// Recipients skipped because a job already covers them.
    pub skipped: usize,
    pub errors: usize,
}

pub struct GenerationScheduler {
    store: Arc<dyn JobStore>,
    due: Arc<dyn DueRecipients>,
    max_retries: i32,
}

impl GenerationScheduler {
    pub fn new(store: Arc<dyn JobStore>, due: Arc<dyn DueRecipients>, max_retries: i32) -> Self {
        Self {
            store,
            due,
            max_retries,
        }
    }

    /// Enqueues a job for each recipient due at `now`.
    ///
    /// Re-running a tick for the same instant is harmless: the store refuses
    /// a second job for the same `(recipient, period)` and while a recipient
    /// still has a pending or running job. A failure for one recipient does
    /// not stop the others.
    pub async fn tick(&self, now: DateTime<Utc>) -> EnqueueReport {
        let mut report = EnqueueReport::default();

        let due = match self.due.due_recipients(now).await {
            Ok(due) => due,
            Err(e) => {
                tracing::error!(error = %e, "scheduler: failed to list due recipients");
                report.errors += 1;
                return report;
            }
        };

        if due.is_empty() {
            tracing::debug!("scheduler: no recipients due");
            return report;
        }

        for recipient in due {
            let recipient_id = recipient.recipient_id;
            let job = NewGenerationJob::scheduled(
                recipient_id,
                recipient.spec,
                self.max_retries,
                recipient.period,
            );
            match self.store.create_job(job, now).await {
                Ok(EnqueueOutcome::Created(job)) => {
                    tracing::info!(
                        job_id = %job.id,
                        %recipient_id,
                        period = %recipient.period,
                        "scheduler: enqueued generation job"
                    );
                    report.enqueued += 1;
                }
                Ok(
                    EnqueueOutcome::AlreadyActive(existing)
                    | EnqueueOutcome::AlreadyScheduled(existing),
                ) => {
                    tracing::debug!(
                        job_id = %existing,
                        %recipient_id,
                        "scheduler: recipient already has a job; skipping"
                    );
                    report.skipped += 1;
                }
                Err(e) => {
                    tracing::error!(%recipient_id, error = %e, "scheduler: failed to enqueue job");
                    report.errors += 1;
                }
            }
        }

        report
    }
}
