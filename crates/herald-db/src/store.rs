//! The backend-agnostic job store contract.
//!
//! Every state transition of a job or delivery goes through a [`JobStore`].
//! Implementations must make `claim_next_pending` and `claim_due_delivery`
//! atomic: concurrent callers never receive the same row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use herald_core::{
    Delivery, DeliveryStats, FailureClass, GenerationJob, JobStats, NewGenerationJob, RetryPolicy,
};

use crate::DbError;

/// Result of asking the store to create a job.
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    Created(GenerationJob),
    /// The recipient already has a `Pending` or `Running` job.
    AlreadyActive(Uuid),
    /// A job for this `(recipient, scheduling_period)` already exists.
    AlreadyScheduled(Uuid),
}

impl EnqueueOutcome {
    #[must_use]
    pub fn created(&self) -> Option<&GenerationJob> {
        match self {
            EnqueueOutcome::Created(job) => Some(job),
            _ => None,
        }
    }
}

/// Result of completing a job. Completion and delivery creation commit together.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Created(Delivery),
    /// A delivery for the same `artifact_ref` already existed; it was left untouched.
    Existing(Delivery),
}

impl DeliveryOutcome {
    #[must_use]
    pub fn delivery(&self) -> &Delivery {
        match self {
            DeliveryOutcome::Created(d) | DeliveryOutcome::Existing(d) => d,
        }
    }

    #[must_use]
    pub fn is_new(&self) -> bool {
        matches!(self, DeliveryOutcome::Created(_))
    }
}

/// What one reaper pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Rows returned to `Pending` with an incremented retry count.
    pub requeued: Vec<Uuid>,
    /// Rows whose retries were exhausted and are now `Failed`.
    pub failed: Vec<Uuid>,
}

impl ReapReport {
    #[must_use]
    pub fn total(&self) -> usize {
        self.requeued.len() + self.failed.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Error message recorded on a row reclaimed by the reaper.
#[must_use]
pub fn stale_claim_message(worker_id: Option<&str>, claimed_at: Option<DateTime<Utc>>) -> String {
    match (worker_id, claimed_at) {
        (Some(worker), Some(at)) => {
            format!("stale claim: worker {worker} claimed at {} never finished", at.to_rfc3339())
        }
        _ => "stale claim: worker never finished".to_string(),
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Creates a `Pending` job unless the recipient already has an active job
    /// or a job for the same scheduling period.
    async fn create_job(
        &self,
        job: NewGenerationJob,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, DbError>;

    /// Atomically claims the oldest eligible `Pending` job for `worker_id`.
    async fn claim_next_pending(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<GenerationJob>, DbError>;

    /// Marks a held job `Completed` and creates its delivery in one unit.
    ///
    /// Returns [`DbError::ClaimLost`] if `worker_id` no longer holds the job.
    async fn complete_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        artifact_ref: &str,
        deliver_at: DateTime<Utc>,
        delivery_max_retries: i32,
        now: DateTime<Utc>,
    ) -> Result<DeliveryOutcome, DbError>;

    /// Applies one failure to a held job through `policy`.
    async fn fail_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        class: FailureClass,
        message: &str,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<GenerationJob, DbError>;

    /// Atomically claims the earliest `Pending` delivery due by `due_by` and
    /// marks it `Sending` with `claimed_at` as its claim time.
    ///
    /// The two instants differ when one dispatch pass claims lazily: the due
    /// cutoff is fixed for the pass, the claim time is when the row is taken.
    async fn claim_due_delivery(
        &self,
        worker_id: &str,
        due_by: DateTime<Utc>,
        claimed_at: DateTime<Utc>,
    ) -> Result<Option<Delivery>, DbError>;

    async fn mark_delivery_sent(
        &self,
        delivery_id: Uuid,
        worker_id: &str,
        receipt_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Delivery, DbError>;

    async fn fail_delivery(
        &self,
        delivery_id: Uuid,
        worker_id: &str,
        class: FailureClass,
        message: &str,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Delivery, DbError>;

    /// Treats every `Running` job claimed before `stale_before` as a retryable failure.
    async fn reap_stale_jobs(
        &self,
        stale_before: DateTime<Utc>,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<ReapReport, DbError>;

    /// Treats every `Sending` delivery claimed before `stale_before` as a retryable failure.
    async fn reap_stale_deliveries(
        &self,
        stale_before: DateTime<Utc>,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<ReapReport, DbError>;

    /// Moves a `Pending` or `Running` job to `Failed`, clearing any claim.
    async fn abort_job(
        &self,
        job_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<GenerationJob, DbError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<GenerationJob>, DbError>;

    async fn get_delivery(&self, delivery_id: Uuid) -> Result<Option<Delivery>, DbError>;

    async fn find_delivery_by_artifact(
        &self,
        artifact_ref: &str,
    ) -> Result<Option<Delivery>, DbError>;

    async fn job_stats(&self) -> Result<JobStats, DbError>;

    async fn delivery_stats(&self, now: DateTime<Utc>) -> Result<DeliveryStats, DbError>;

    /// Most recently failed jobs first.
    async fn list_failed_jobs(&self, limit: i64) -> Result<Vec<GenerationJob>, DbError>;

    /// Most recently failed deliveries first.
    async fn list_failed_deliveries(&self, limit: i64) -> Result<Vec<Delivery>, DbError>;
}
