//! In-process [`JobStore`] used by tests and single-process deployments.
//!
//! One mutex guards both tables, so every operation is trivially atomic. The
//! lock is never held across an `.await`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use herald_core::{
    Delivery, DeliveryStats, DeliveryStatus, FailureClass, GenerationJob, JobStats, JobStatus,
    NewGenerationJob, RetryDecision, RetryPolicy,
};

use crate::store::{stale_claim_message, DeliveryOutcome, EnqueueOutcome, JobStore, ReapReport};
use crate::DbError;

#[derive(Debug, Default)]
struct Tables {
    jobs: Vec<GenerationJob>,
    deliveries: Vec<Delivery>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryJobStore {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryJobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every job, in creation order.
    #[must_use]
    pub fn jobs(&self) -> Vec<GenerationJob> {
        self.tables.lock().jobs.clone()
    }

    /// Every delivery, in creation order.
    #[must_use]
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.tables.lock().deliveries.clone()
    }
}

fn apply_job_decision(
    job: &mut GenerationJob,
    decision: RetryDecision,
    message: &str,
    now: DateTime<Utc>,
) {
    match decision {
        RetryDecision::Retry {
            retry_count,
            not_before,
        } => {
            job.status = JobStatus::Pending;
            job.retry_count = retry_count;
            job.not_before = Some(not_before);
        }
        RetryDecision::Fail { retry_count } => {
            job.status = JobStatus::Failed;
            job.retry_count = retry_count;
            job.not_before = None;
            job.completed_at = Some(now);
        }
    }
    job.claimed_by = None;
    job.claimed_at = None;
    job.error_message = Some(message.to_string());
    job.updated_at = now;
}

fn apply_delivery_decision(
    delivery: &mut Delivery,
    decision: RetryDecision,
    message: &str,
    now: DateTime<Utc>,
) {
    match decision {
        RetryDecision::Retry {
            retry_count,
            not_before,
        } => {
            delivery.status = DeliveryStatus::Pending;
            delivery.retry_count = retry_count;
            delivery.not_before = Some(not_before);
        }
        RetryDecision::Fail { retry_count } => {
            delivery.status = DeliveryStatus::Failed;
            delivery.retry_count = retry_count;
            delivery.not_before = None;
        }
    }
    delivery.claimed_by = None;
    delivery.claimed_at = None;
    delivery.error_message = Some(message.to_string());
    delivery.updated_at = now;
}

fn held_job<'a>(
    tables: &'a mut Tables,
    job_id: Uuid,
    worker_id: &str,
) -> Result<&'a mut GenerationJob, DbError> {
    let job = tables
        .jobs
        .iter_mut()
        .find(|j| j.id == job_id)
        .ok_or(DbError::NotFound)?;
    if !job.is_held_by(worker_id) {
        return Err(DbError::ClaimLost {
            id: job_id,
            worker_id: worker_id.to_string(),
        });
    }
    Ok(job)
}

fn held_delivery<'a>(
    tables: &'a mut Tables,
    delivery_id: Uuid,
    worker_id: &str,
) -> Result<&'a mut Delivery, DbError> {
    let delivery = tables
        .deliveries
        .iter_mut()
        .find(|d| d.id == delivery_id)
        .ok_or(DbError::NotFound)?;
    if !delivery.is_held_by(worker_id) {
        return Err(DbError::ClaimLost {
            id: delivery_id,
            worker_id: worker_id.to_string(),
        });
    }
    Ok(delivery)
}

fn newest_first<T, F>(mut rows: Vec<T>, updated_at: F, limit: i64) -> Vec<T>
where
    F: Fn(&T) -> DateTime<Utc>,
{
    rows.sort_by_key(|r| std::cmp::Reverse(updated_at(r)));
    rows.truncate(usize::try_from(limit).unwrap_or(0));
    rows
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(
        &self,
        job: NewGenerationJob,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, DbError> {
        job.validate().map_err(DbError::InvalidJob)?;
        let mut tables = self.tables.lock();

        if let Some(period) = job.scheduling_period {
            if let Some(existing) = tables
                .jobs
                .iter()
                .find(|j| j.recipient_id == job.recipient_id && j.scheduling_period == Some(period))
            {
                return Ok(EnqueueOutcome::AlreadyScheduled(existing.id));
            }
        }
        if let Some(active) = tables
            .jobs
            .iter()
            .find(|j| j.recipient_id == job.recipient_id && !j.status.is_terminal())
        {
            return Ok(EnqueueOutcome::AlreadyActive(active.id));
        }

        let created = GenerationJob {
            id: Uuid::new_v4(),
            recipient_id: job.recipient_id,
            spec: job.spec,
            status: JobStatus::Pending,
            claimed_by: None,
            claimed_at: None,
            retry_count: 0,
            max_retries: job.max_retries,
            not_before: None,
            error_message: None,
            artifact_ref: None,
            scheduling_period: job.scheduling_period,
            immediate_delivery: job.immediate_delivery,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        };
        tables.jobs.push(created.clone());
        Ok(EnqueueOutcome::Created(created))
    }

    async fn claim_next_pending(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<GenerationJob>, DbError> {
        let mut tables = self.tables.lock();
        // min_by_key keeps the first of equal keys, so ties fall back to insertion order.
        let Some(job) = tables
            .jobs
            .iter_mut()
            .filter(|j| j.is_claimable_at(now))
            .min_by_key(|j| j.created_at)
        else {
            return Ok(None);
        };

        job.status = JobStatus::Running;
        job.claimed_by = Some(worker_id.to_string());
        job.claimed_at = Some(now);
        job.started_at = Some(now);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        artifact_ref: &str,
        deliver_at: DateTime<Utc>,
        delivery_max_retries: i32,
        now: DateTime<Utc>,
    ) -> Result<DeliveryOutcome, DbError> {
        if artifact_ref.trim().is_empty() {
            return Err(DbError::InvalidJob("artifact_ref must not be empty".to_string()));
        }
        if delivery_max_retries < 1 {
            return Err(DbError::InvalidJob(format!(
                "delivery max_retries must be at least 1, got {delivery_max_retries}"
            )));
        }

        let mut tables = self.tables.lock();
        let job = held_job(&mut tables, job_id, worker_id)?;
        job.status = JobStatus::Completed;
        job.artifact_ref = Some(artifact_ref.to_string());
        job.claimed_by = None;
        job.claimed_at = None;
        job.not_before = None;
        job.completed_at = Some(now);
        job.updated_at = now;
        let recipient_id = job.recipient_id;

        if let Some(existing) = tables
            .deliveries
            .iter()
            .find(|d| d.artifact_ref == artifact_ref)
        {
            return Ok(DeliveryOutcome::Existing(existing.clone()));
        }

        let delivery = Delivery {
            id: Uuid::new_v4(),
            artifact_ref: artifact_ref.to_string(),
            recipient_id,
            job_id: Some(job_id),
            deliver_at,
            status: DeliveryStatus::Pending,
            claimed_by: None,
            claimed_at: None,
            retry_count: 0,
            max_retries: delivery_max_retries,
            not_before: None,
            sent_at: None,
            provider_receipt_id: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        tables.deliveries.push(delivery.clone());
        Ok(DeliveryOutcome::Created(delivery))
    }

    async fn fail_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        class: FailureClass,
        message: &str,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<GenerationJob, DbError> {
        let mut tables = self.tables.lock();
        let job = held_job(&mut tables, job_id, worker_id)?;
        let decision = policy.decide(job.retry_count, job.max_retries, class, now);
        apply_job_decision(job, decision, message, now);
        Ok(job.clone())
    }

    async fn claim_due_delivery(
        &self,
        worker_id: &str,
        due_by: DateTime<Utc>,
        claimed_at: DateTime<Utc>,
    ) -> Result<Option<Delivery>, DbError> {
        let mut tables = self.tables.lock();
        let Some(delivery) = tables
            .deliveries
            .iter_mut()
            .filter(|d| d.is_due_at(due_by))
            .min_by_key(|d| d.deliver_at)
        else {
            return Ok(None);
        };

        delivery.status = DeliveryStatus::Sending;
        delivery.claimed_by = Some(worker_id.to_string());
        delivery.claimed_at = Some(claimed_at);
        delivery.updated_at = claimed_at;
        Ok(Some(delivery.clone()))
    }

    async fn mark_delivery_sent(
        &self,
        delivery_id: Uuid,
        worker_id: &str,
        receipt_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Delivery, DbError> {
        let mut tables = self.tables.lock();
        let delivery = held_delivery(&mut tables, delivery_id, worker_id)?;
        delivery.status = DeliveryStatus::Sent;
        delivery.sent_at = Some(now);
        delivery.provider_receipt_id = Some(receipt_id.to_string());
        delivery.claimed_by = None;
        delivery.claimed_at = None;
        delivery.not_before = None;
        delivery.updated_at = now;
        Ok(delivery.clone())
    }

    async fn fail_delivery(
        &self,
        delivery_id: Uuid,
        worker_id: &str,
        class: FailureClass,
        message: &str,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Delivery, DbError> {
        let mut tables = self.tables.lock();
        let delivery = held_delivery(&mut tables, delivery_id, worker_id)?;
        let decision = policy.decide(delivery.retry_count, delivery.max_retries, class, now);
        apply_delivery_decision(delivery, decision, message, now);
        Ok(delivery.clone())
    }

    async fn reap_stale_jobs(
        &self,
        stale_before: DateTime<Utc>,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<ReapReport, DbError> {
        let mut tables = self.tables.lock();
        let mut report = ReapReport::default();
        for job in tables.jobs.iter_mut().filter(|j| {
            j.status == JobStatus::Running && j.claimed_at.is_some_and(|at| at < stale_before)
        }) {
            let message = stale_claim_message(job.claimed_by.as_deref(), job.claimed_at);
            let decision =
                policy.decide(job.retry_count, job.max_retries, FailureClass::Retryable, now);
            apply_job_decision(job, decision, &message, now);
            if decision.is_final() {
                report.failed.push(job.id);
            } else {
                report.requeued.push(job.id);
            }
        }
        Ok(report)
    }

    async fn reap_stale_deliveries(
        &self,
        stale_before: DateTime<Utc>,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<ReapReport, DbError> {
        let mut tables = self.tables.lock();
        let mut report = ReapReport::default();
        for delivery in tables.deliveries.iter_mut().filter(|d| {
            d.status == DeliveryStatus::Sending && d.claimed_at.is_some_and(|at| at < stale_before)
        }) {
            let message = stale_claim_message(delivery.claimed_by.as_deref(), delivery.claimed_at);
            let decision = policy.decide(
                delivery.retry_count,
                delivery.max_retries,
                FailureClass::Retryable,
                now,
            );
            apply_delivery_decision(delivery, decision, &message, now);
            if decision.is_final() {
                report.failed.push(delivery.id);
            } else {
                report.requeued.push(delivery.id);
            }
        }
        Ok(report)
    }

    async fn abort_job(
        &self,
        job_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<GenerationJob, DbError> {
        let mut tables = self.tables.lock();
        let job = tables
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or(DbError::NotFound)?;
        if job.status.is_terminal() {
            return Err(DbError::InvalidTransition {
                id: job_id,
                expected_status: "pending or running",
            });
        }
        job.status = JobStatus::Failed;
        job.claimed_by = None;
        job.claimed_at = None;
        job.not_before = None;
        job.error_message = Some(format!("aborted: {reason}"));
        job.completed_at = Some(now);
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<GenerationJob>, DbError> {
        Ok(self
            .tables
            .lock()
            .jobs
            .iter()
            .find(|j| j.id == job_id)
            .cloned())
    }

    async fn get_delivery(&self, delivery_id: Uuid) -> Result<Option<Delivery>, DbError> {
        Ok(self
            .tables
            .lock()
            .deliveries
            .iter()
            .find(|d| d.id == delivery_id)
            .cloned())
    }

    async fn find_delivery_by_artifact(
        &self,
        artifact_ref: &str,
    ) -> Result<Option<Delivery>, DbError> {
        Ok(self
            .tables
            .lock()
            .deliveries
            .iter()
            .find(|d| d.artifact_ref == artifact_ref)
            .cloned())
    }

    async fn job_stats(&self) -> Result<JobStats, DbError> {
        let tables = self.tables.lock();
        let mut stats = JobStats::default();
        for job in &tables.jobs {
            stats.record(job.status, 1);
        }
        Ok(stats)
    }

    async fn delivery_stats(&self, now: DateTime<Utc>) -> Result<DeliveryStats, DbError> {
        let tables = self.tables.lock();
        let mut stats = DeliveryStats::default();
        let day_ago = now - TimeDelta::hours(24);
        let in_1h = now + TimeDelta::hours(1);
        let in_24h = now + TimeDelta::hours(24);
        for d in &tables.deliveries {
            stats.record(d.status, 1);
            if d.status == DeliveryStatus::Sent && d.sent_at.is_some_and(|at| at >= day_ago) {
                stats.sent_last_24h += 1;
            }
            if d.status == DeliveryStatus::Pending && d.deliver_at >= now {
                if d.deliver_at < in_1h {
                    stats.upcoming_1h += 1;
                }
                if d.deliver_at < in_24h {
                    stats.upcoming_24h += 1;
                }
            }
        }
        Ok(stats)
    }

    async fn list_failed_jobs(&self, limit: i64) -> Result<Vec<GenerationJob>, DbError> {
        let failed = self
            .tables
            .lock()
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Failed)
            .cloned()
            .collect();
        Ok(newest_first(failed, |j| j.updated_at, limit))
    }

    async fn list_failed_deliveries(&self, limit: i64) -> Result<Vec<Delivery>, DbError> {
        let failed = self
            .tables
            .lock()
            .deliveries
            .iter()
            .filter(|d| d.status == DeliveryStatus::Failed)
            .cloned()
            .collect();
        Ok(newest_first(failed, |d| d.updated_at, limit))
    }
}
