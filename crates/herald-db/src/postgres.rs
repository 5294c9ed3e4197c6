//! [`JobStore`] backed by Postgres.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use herald_core::{
    Delivery, DeliveryStats, FailureClass, GenerationJob, JobStats, NewGenerationJob, RetryPolicy,
};

use crate::store::{DeliveryOutcome, EnqueueOutcome, JobStore, ReapReport};
use crate::{deliveries, generation_jobs, reaper, DbError};

#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create_job(
        &self,
        job: NewGenerationJob,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, DbError> {
        generation_jobs::create_generation_job(&self.pool, &job, now).await
    }

    async fn claim_next_pending(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<GenerationJob>, DbError> {
        generation_jobs::claim_next_pending_job(&self.pool, worker_id, now).await
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
        generation_jobs::complete_generation_job(
            &self.pool,
            job_id,
            worker_id,
            artifact_ref,
            deliver_at,
            delivery_max_retries,
            now,
        )
        .await
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
        generation_jobs::fail_generation_job(
            &self.pool, job_id, worker_id, class, message, policy, now,
        )
        .await
    }

    async fn claim_due_delivery(
        &self,
        worker_id: &str,
        due_by: DateTime<Utc>,
        claimed_at: DateTime<Utc>,
    ) -> Result<Option<Delivery>, DbError> {
        deliveries::claim_due_delivery(&self.pool, worker_id, due_by, claimed_at).await
    }

    async fn mark_delivery_sent(
        &self,
        delivery_id: Uuid,
        worker_id: &str,
        receipt_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Delivery, DbError> {
        deliveries::mark_delivery_sent(&self.pool, delivery_id, worker_id, receipt_id, now).await
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
        deliveries::fail_delivery(
            &self.pool,
            delivery_id,
            worker_id,
            class,
            message,
            policy,
            now,
        )
        .await
    }

    async fn reap_stale_jobs(
        &self,
        stale_before: DateTime<Utc>,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<ReapReport, DbError> {
        reaper::reap_stale_jobs(&self.pool, stale_before, policy, now).await
    }

    async fn reap_stale_deliveries(
        &self,
        stale_before: DateTime<Utc>,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<ReapReport, DbError> {
        reaper::reap_stale_deliveries(&self.pool, stale_before, policy, now).await
    }

    async fn abort_job(
        &self,
        job_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<GenerationJob, DbError> {
        generation_jobs::abort_generation_job(&self.pool, job_id, reason, now).await
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<GenerationJob>, DbError> {
        generation_jobs::get_generation_job(&self.pool, job_id).await
    }

    async fn get_delivery(&self, delivery_id: Uuid) -> Result<Option<Delivery>, DbError> {
        deliveries::get_delivery(&self.pool, delivery_id).await
    }

    async fn find_delivery_by_artifact(
        &self,
        artifact_ref: &str,
    ) -> Result<Option<Delivery>, DbError> {
        deliveries::find_delivery_by_artifact(&self.pool, artifact_ref).await
    }

    async fn job_stats(&self) -> Result<JobStats, DbError> {
        generation_jobs::generation_job_stats(&self.pool).await
    }

    async fn delivery_stats(&self, now: DateTime<Utc>) -> Result<DeliveryStats, DbError> {
        deliveries::delivery_stats(&self.pool, now).await
    }

    async fn list_failed_jobs(&self, limit: i64) -> Result<Vec<GenerationJob>, DbError> {
        generation_jobs::list_failed_generation_jobs(&self.pool, limit).await
    }

    async fn list_failed_deliveries(&self, limit: i64) -> Result<Vec<Delivery>, DbError> {
        deliveries::list_failed_deliveries(&self.pool, limit).await
    }
}
