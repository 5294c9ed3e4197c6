//! Generation worker: claim a pending job, generate, complete or fail it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use herald_core::{CollaboratorError, GenerationJob, Generator, RecipientPreferences, RetryPolicy};
use herald_db::{DbError, JobStore};

use super::poll::PollBackoff;

/// Result of processing one claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkOutcome {
    Completed {
        job_id: Uuid,
        /// `false` when a delivery for the artifact already existed.
        new_delivery: bool,
    },
    Retrying {
        job_id: Uuid,
        retry_count: i32,
    },
    Failed {
        job_id: Uuid,
    },
    /// The outcome could not be recorded; the reaper will recover the job.
    Unrecorded {
        job_id: Uuid,
    },
}

/// Per-worker counters, logged when the worker stops.
#[derive(Debug, Default)]
struct Tally {
    completed: u64,
    duplicate_artifacts: u64,
    retried: u64,
    failed: u64,
    unrecorded: u64,
}

impl Tally {
    fn record(&mut self, worker_id: &str, outcome: &WorkOutcome) {
        match *outcome {
            WorkOutcome::Completed {
                job_id,
                new_delivery,
            } => {
                self.completed += 1;
                if !new_delivery {
                    self.duplicate_artifacts += 1;
                }
                tracing::debug!(worker_id, %job_id, "generation worker: finished job");
            }
            WorkOutcome::Retrying {
                job_id,
                retry_count,
            } => {
                self.retried += 1;
                tracing::debug!(worker_id, %job_id, retry_count, "generation worker: job requeued");
            }
            WorkOutcome::Failed { job_id } => {
                self.failed += 1;
                tracing::debug!(worker_id, %job_id, "generation worker: job failed");
            }
            WorkOutcome::Unrecorded { job_id } => {
                self.unrecorded += 1;
                tracing::debug!(worker_id, %job_id, "generation worker: leaving job to the reaper");
            }
        }
    }
}

pub struct GenerationWorker {
    id: String,
    store: Arc<dyn JobStore>,
    generator: Arc<dyn Generator>,
    preferences: Arc<dyn RecipientPreferences>,
    policy: RetryPolicy,
    generation_timeout: Duration,
    delivery_max_retries: i32,
}

impl GenerationWorker {
    pub fn new(
        id: impl Into<String>,
        store: Arc<dyn JobStore>,
        generator: Arc<dyn Generator>,
        preferences: Arc<dyn RecipientPreferences>,
        policy: RetryPolicy,
        generation_timeout: Duration,
        delivery_max_retries: i32,
    ) -> Self {
        Self {
            id: id.into(),
            store,
            generator,
            preferences,
            policy,
            generation_timeout,
            delivery_max_retries,
        }
    }

    /// Polls for work until `cancel` fires. A job already claimed is always
    /// driven to an outcome before the loop checks for cancellation again.
    pub async fn run(self, mut poll: PollBackoff, cancel: CancellationToken) {
        tracing::info!(worker_id = %self.id, "generation worker: started");
        let mut tally = Tally::default();

        while !cancel.is_cancelled() {
            match self.run_once().await {
                Ok(Some(outcome)) => {
                    tally.record(&self.id, &outcome);
                    poll.reset();
                    continue;
                }
                Ok(None) => tracing::debug!(worker_id = %self.id, "generation worker: idle"),
                Err(e) => {
                    tracing::error!(
                        worker_id = %self.id,
                        error = %e,
                        "generation worker: claim failed"
                    );
                }
            }

            let delay = poll.next_delay();
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!(
            worker_id = %self.id,
            completed = tally.completed,
            duplicate_artifacts = tally.duplicate_artifacts,
            retried = tally.retried,
            failed = tally.failed,
            unrecorded = tally.unrecorded,
            "generation worker: stopped"
        );
    }

    /// Claims and processes at most one job.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] only when the claim itself fails. Failures after a
    /// successful claim are recorded on the job.
    pub async fn run_once(&self) -> Result<Option<WorkOutcome>, DbError> {
        let Some(job) = self.store.claim_next_pending(&self.id, Utc::now()).await? else {
            return Ok(None);
        };
        tracing::info!(
            worker_id = %self.id,
            job_id = %job.id,
            recipient_id = %job.recipient_id,
            retry_count = job.retry_count,
            "generation worker: claimed job"
        );
        Ok(Some(self.process(&job).await))
    }

    async fn process(&self, job: &GenerationJob) -> WorkOutcome {
        let generate = self.generator.generate(&job.spec);
        let generated = match tokio::time::timeout(self.generation_timeout, generate).await {
            Ok(result) => result,
            Err(_) => Err(CollaboratorError::timeout(self.generation_timeout)),
        };
        let artifact = match generated {
            Ok(artifact) => artifact,
            Err(err) => return self.record_failure(job, &err).await,
        };

        let now = Utc::now();
        let deliver_at = if job.immediate_delivery {
            now
        } else {
            match self.preferences.delivery_preference(job.recipient_id).await {
                // A late scheduled job still delivers for its own period;
                // the next period has a job of its own.
                Ok(preference) => match job.scheduling_period {
                    Some(period) => preference.slot_on(period).max(now),
                    None => preference.next_delivery_at(now),
                },
                Err(err) => return self.record_failure(job, &err).await,
            }
        };

        let outcome = match self
            .store
            .complete_job(
                job.id,
                &self.id,
                &artifact.artifact_ref,
                deliver_at,
                self.delivery_max_retries,
                now,
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                self.log_unrecorded(job, &e, "generation worker: could not record completion");
                return WorkOutcome::Unrecorded { job_id: job.id };
            }
        };

        let delivery = outcome.delivery();
        if outcome.is_new() {
            tracing::info!(
                worker_id = %self.id,
                job_id = %job.id,
                delivery_id = %delivery.id,
                artifact_ref = %artifact.artifact_ref,
                deliver_at = %delivery.deliver_at,
                "generation worker: job completed"
            );
        } else {
            tracing::warn!(
                job_id = %job.id,
                delivery_id = %delivery.id,
                artifact_ref = %artifact.artifact_ref,
                "generation worker: delivery already existed for artifact; kept original"
            );
        }

        if let Err(e) = self.preferences.record_generated(job.recipient_id, now).await {
            tracing::warn!(
                recipient_id = %job.recipient_id,
                error = %e,
                "generation worker: failed to record generation time"
            );
        }

        WorkOutcome::Completed {
            job_id: job.id,
            new_delivery: outcome.is_new(),
        }
    }

    async fn record_failure(&self, job: &GenerationJob, err: &CollaboratorError) -> WorkOutcome {
        match self
            .store
            .fail_job(
                job.id,
                &self.id,
                err.class,
                &err.message,
                &self.policy,
                Utc::now(),
            )
            .await
        {
            Ok(updated) if updated.status.is_terminal() => {
                tracing::error!(
                    job_id = %job.id,
                    retry_count = updated.retry_count,
                    error = %err,
                    "generation worker: job failed permanently"
                );
                WorkOutcome::Failed { job_id: job.id }
            }
            Ok(updated) => {
                tracing::warn!(
                    job_id = %job.id,
                    retry_count = updated.retry_count,
                    not_before = ?updated.not_before,
                    error = %err,
                    "generation worker: job failed; will retry"
                );
                WorkOutcome::Retrying {
                    job_id: job.id,
                    retry_count: updated.retry_count,
                }
            }
            Err(e) => {
                self.log_unrecorded(job, &e, "generation worker: could not record failure");
                WorkOutcome::Unrecorded { job_id: job.id }
            }
        }
    }

    fn log_unrecorded(&self, job: &GenerationJob, err: &DbError, message: &'static str) {
        if matches!(err, DbError::ClaimLost { .. }) {
            tracing::warn!(worker_id = %self.id, job_id = %job.id, error = %err, "{message}");
        } else {
            tracing::error!(worker_id = %self.id, job_id = %job.id, error = %err, "{message}");
        }
    }
}

#[cfg(test)]
#[path = "generation_test.rs"]
mod tests;
