//! Stale-claim recovery for jobs and deliveries.
//!
//! A claim older than the configured threshold means its worker died. Each
//! such row goes through the same retry path as a reported retryable failure.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use herald_core::{FailureClass, RetryPolicy};

use crate::deliveries::{apply_delivery_failure, lock_stale_deliveries};
use crate::generation_jobs::{apply_job_failure, lock_stale_jobs};
use crate::store::{stale_claim_message, ReapReport};
use crate::DbError;

/// Returns stale `running` jobs to `pending`, or fails them once retries run out.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if any query fails; the whole pass rolls back.
pub async fn reap_stale_jobs(
    pool: &PgPool,
    stale_before: DateTime<Utc>,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> Result<ReapReport, DbError> {
    let mut tx = pool.begin().await?;
    let mut report = ReapReport::default();

    for job in lock_stale_jobs(&mut tx, stale_before).await? {
        let message = stale_claim_message(job.claimed_by.as_deref(), job.claimed_at);
        let decision = policy.decide(job.retry_count, job.max_retries, FailureClass::Retryable, now);
        apply_job_failure(&mut tx, job.id, decision, &message, now).await?;
        if decision.is_final() {
            report.failed.push(job.id);
        } else {
            report.requeued.push(job.id);
        }
    }

    tx.commit().await?;
    Ok(report)
}

/// Returns stale `sending` deliveries to `pending`, or fails them once retries run out.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if any query fails; the whole pass rolls back.
pub async fn reap_stale_deliveries(
    pool: &PgPool,
    stale_before: DateTime<Utc>,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> Result<ReapReport, DbError> {
    let mut tx = pool.begin().await?;
    let mut report = ReapReport::default();

    for delivery in lock_stale_deliveries(&mut tx, stale_before).await? {
        let message = stale_claim_message(delivery.claimed_by.as_deref(), delivery.claimed_at);
        let decision = policy.decide(
            delivery.retry_count,
            delivery.max_retries,
            FailureClass::Retryable,
            now,
        );
        apply_delivery_failure(&mut tx, delivery.id, decision, &message, now).await?;
        if decision.is_final() {
            report.failed.push(delivery.id);
        } else {
            report.requeued.push(delivery.id);
        }
    }

    tx.commit().await?;
    Ok(report)
}
