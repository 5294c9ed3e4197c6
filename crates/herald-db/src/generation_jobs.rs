//! Database operations for `generation_jobs`.

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use herald_core::{
    FailureClass, GenerationJob, JobStats, JobStatus, NewGenerationJob, RetryDecision, RetryPolicy,
};

use crate::deliveries::insert_delivery_once;
use crate::store::{DeliveryOutcome, EnqueueOutcome};
use crate::DbError;

macro_rules! job_columns {
    () => {
        "id, recipient_id, spec, status, claimed_by, claimed_at, retry_count, max_retries, \
         not_before, error_message, artifact_ref, scheduling_period, immediate_delivery, \
         created_at, started_at, completed_at, updated_at"
    };
}

/// Attempts made to resolve an insert conflict that vanished before it could be read.
const ENQUEUE_ATTEMPTS: usize = 3;

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// A row from the `generation_jobs` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct GenerationJobRow {
    pub id: Uuid,
    pub recipient_id: Uuid,
    pub spec: serde_json::Value,
    pub status: String,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub not_before: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub artifact_ref: Option<String>,
    pub scheduling_period: Option<NaiveDate>,
    pub immediate_delivery: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<GenerationJobRow> for GenerationJob {
    type Error = DbError;

    fn try_from(row: GenerationJobRow) -> Result<Self, Self::Error> {
        Ok(GenerationJob {
            id: row.id,
            recipient_id: row.recipient_id,
            spec: row.spec,
            status: row.status.parse::<JobStatus>()?,
            claimed_by: row.claimed_by,
            claimed_at: row.claimed_at,
            retry_count: row.retry_count,
            max_retries: row.max_retries,
            not_before: row.not_before,
            error_message: row.error_message,
            artifact_ref: row.artifact_ref,
            scheduling_period: row.scheduling_period,
            immediate_delivery: row.immediate_delivery,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            updated_at: row.updated_at,
        })
    }
}

fn into_jobs(rows: Vec<GenerationJobRow>) -> Result<Vec<GenerationJob>, DbError> {
    rows.into_iter().map(GenerationJob::try_from).collect()
}

// ---------------------------------------------------------------------------
// Enqueue and claim
// ---------------------------------------------------------------------------

/// Inserts a `pending` job unless one of the uniqueness rules forbids it.
///
/// The partial unique index on active jobs and the `(recipient_id,
/// scheduling_period)` key make this safe against concurrent schedulers.
///
/// # Errors
///
/// Returns [`DbError::InvalidJob`] for a job that could never be claimed, or
/// [`DbError::Sqlx`] if a query fails.
pub async fn create_generation_job(
    pool: &PgPool,
    job: &NewGenerationJob,
    now: DateTime<Utc>,
) -> Result<EnqueueOutcome, DbError> {
    job.validate().map_err(DbError::InvalidJob)?;

    for _ in 0..ENQUEUE_ATTEMPTS {
        let inserted = sqlx::query_as::<_, GenerationJobRow>(concat!(
            "INSERT INTO generation_jobs \
                 (id, recipient_id, spec, status, max_retries, scheduling_period, \
                  immediate_delivery, created_at, updated_at) \
             VALUES ($1, $2, $3, 'pending', $4, $5, $6, $7, $7) \
             ON CONFLICT DO NOTHING \
             RETURNING ",
            job_columns!()
        ))
        .bind(Uuid::new_v4())
        .bind(job.recipient_id)
        .bind(&job.spec)
        .bind(job.max_retries)
        .bind(job.scheduling_period)
        .bind(job.immediate_delivery)
        .bind(now)
        .fetch_optional(pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(EnqueueOutcome::Created(row.try_into()?));
        }

        if let Some(period) = job.scheduling_period {
            let scheduled = sqlx::query_scalar::<_, Uuid>(
                "SELECT id FROM generation_jobs \
                 WHERE recipient_id = $1 AND scheduling_period = $2",
            )
            .bind(job.recipient_id)
            .bind(period)
            .fetch_optional(pool)
            .await?;
            if let Some(id) = scheduled {
                return Ok(EnqueueOutcome::AlreadyScheduled(id));
            }
        }

        let active = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM generation_jobs \
             WHERE recipient_id = $1 AND status IN ('pending', 'running')",
        )
        .bind(job.recipient_id)
        .fetch_optional(pool)
        .await?;
        if let Some(id) = active {
            return Ok(EnqueueOutcome::AlreadyActive(id));
        }
        // The conflicting job finished between the insert and the lookup; try again.
    }

    Err(DbError::InvalidJob(format!(
        "enqueue for recipient {} kept conflicting with a job that disappeared",
        job.recipient_id
    )))
}

/// Atomically claims the oldest eligible `pending` job.
///
/// `FOR UPDATE SKIP LOCKED` lets concurrent claimants pass over each other's
/// candidate rows instead of blocking or double-claiming.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the update fails.
pub async fn claim_next_pending_job(
    pool: &PgPool,
    worker_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<GenerationJob>, DbError> {
    let row = sqlx::query_as::<_, GenerationJobRow>(concat!(
        "WITH next_job AS ( \
             SELECT id FROM generation_jobs \
             WHERE status = 'pending' \
               AND retry_count < max_retries \
               AND (not_before IS NULL OR not_before <= $2) \
             ORDER BY created_at, id \
             LIMIT 1 \
             FOR UPDATE SKIP LOCKED \
         ) \
         UPDATE generation_jobs \
         SET status = 'running', claimed_by = $1, claimed_at = $2, started_at = $2, \
             updated_at = $2 \
         WHERE id = (SELECT id FROM next_job) \
         RETURNING ",
        job_columns!()
    ))
    .bind(worker_id)
    .bind(now)
    .fetch_optional(pool)
    .await?;

    row.map(GenerationJob::try_from).transpose()
}

// ---------------------------------------------------------------------------
// Completion and failure
// ---------------------------------------------------------------------------

/// Locks a job and checks that `worker_id` still holds it.
async fn lock_held_job(
    conn: &mut PgConnection,
    job_id: Uuid,
    worker_id: &str,
) -> Result<GenerationJob, DbError> {
    let job: GenerationJob = sqlx::query_as::<_, GenerationJobRow>(concat!(
        "SELECT ",
        job_columns!(),
        " FROM generation_jobs WHERE id = $1 FOR UPDATE"
    ))
    .bind(job_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(DbError::NotFound)?
    .try_into()?;

    if !job.is_held_by(worker_id) {
        return Err(DbError::ClaimLost {
            id: job_id,
            worker_id: worker_id.to_string(),
        });
    }
    Ok(job)
}

/// Marks a held job `completed` and creates its delivery in the same transaction.
///
/// A delivery that already exists for `artifact_ref` is returned untouched,
/// so a replayed generation never produces a second send or a new `deliver_at`.
///
/// # Errors
///
/// Returns [`DbError::ClaimLost`] if `worker_id` no longer holds the job,
/// [`DbError::NotFound`] if it does not exist, or [`DbError::Sqlx`] on failure.
pub async fn complete_generation_job(
    pool: &PgPool,
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

    let mut tx = pool.begin().await?;
    let job = lock_held_job(&mut tx, job_id, worker_id).await?;

    sqlx::query(
        "UPDATE generation_jobs \
         SET status = 'completed', artifact_ref = $2, claimed_by = NULL, claimed_at = NULL, \
             not_before = NULL, completed_at = $3, updated_at = $3 \
         WHERE id = $1",
    )
    .bind(job_id)
    .bind(artifact_ref)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    let outcome = insert_delivery_once(
        &mut tx,
        artifact_ref,
        job.recipient_id,
        job_id,
        deliver_at,
        delivery_max_retries,
        now,
    )
    .await?;

    tx.commit().await?;
    Ok(outcome)
}

/// Writes the outcome of a [`RetryDecision`] to a job and clears its claim.
pub(crate) async fn apply_job_failure(
    conn: &mut PgConnection,
    job_id: Uuid,
    decision: RetryDecision,
    message: &str,
    now: DateTime<Utc>,
) -> Result<GenerationJob, DbError> {
    let (status, not_before, completed_at) = match decision {
        RetryDecision::Retry { not_before, .. } => (JobStatus::Pending, Some(not_before), None),
        RetryDecision::Fail { .. } => (JobStatus::Failed, None, Some(now)),
    };

    sqlx::query_as::<_, GenerationJobRow>(concat!(
        "UPDATE generation_jobs \
         SET status = $2, retry_count = $3, not_before = $4, \
             completed_at = COALESCE($5, completed_at), error_message = $6, \
             claimed_by = NULL, claimed_at = NULL, updated_at = $7 \
         WHERE id = $1 \
         RETURNING ",
        job_columns!()
    ))
    .bind(job_id)
    .bind(status.as_str())
    .bind(decision.retry_count())
    .bind(not_before)
    .bind(completed_at)
    .bind(message)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?
    .try_into()
}

/// Applies one failure to a held job through `policy`.
///
/// # Errors
///
/// Returns [`DbError::ClaimLost`] if `worker_id` no longer holds the job,
/// [`DbError::NotFound`] if it does not exist, or [`DbError::Sqlx`] on failure.
pub async fn fail_generation_job(
    pool: &PgPool,
    job_id: Uuid,
    worker_id: &str,
    class: FailureClass,
    message: &str,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> Result<GenerationJob, DbError> {
    let mut tx = pool.begin().await?;
    let job = lock_held_job(&mut tx, job_id, worker_id).await?;
    let decision = policy.decide(job.retry_count, job.max_retries, class, now);
    let updated = apply_job_failure(&mut tx, job_id, decision, message, now).await?;
    tx.commit().await?;
    Ok(updated)
}

/// Moves a `pending` or `running` job to `failed` with an operator reason.
///
/// # Errors
///
/// Returns [`DbError::InvalidTransition`] if the job is already terminal,
/// [`DbError::NotFound`] if it does not exist, or [`DbError::Sqlx`] on failure.
pub async fn abort_generation_job(
    pool: &PgPool,
    job_id: Uuid,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<GenerationJob, DbError> {
    let row = sqlx::query_as::<_, GenerationJobRow>(concat!(
        "UPDATE generation_jobs \
         SET status = 'failed', error_message = $2, claimed_by = NULL, claimed_at = NULL, \
             not_before = NULL, completed_at = $3, updated_at = $3 \
         WHERE id = $1 AND status IN ('pending', 'running') \
         RETURNING ",
        job_columns!()
    ))
    .bind(job_id)
    .bind(format!("aborted: {reason}"))
    .bind(now)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => row.try_into(),
        None if get_generation_job(pool, job_id).await?.is_some() => {
            Err(DbError::InvalidTransition {
                id: job_id,
                expected_status: "pending or running",
            })
        }
        None => Err(DbError::NotFound),
    }
}

// ---------------------------------------------------------------------------
// Reaper support
// ---------------------------------------------------------------------------

/// Locks every `running` job claimed before `stale_before`, skipping rows
/// another reaper or worker is touching right now.
pub(crate) async fn lock_stale_jobs(
    conn: &mut PgConnection,
    stale_before: DateTime<Utc>,
) -> Result<Vec<GenerationJob>, DbError> {
    let rows = sqlx::query_as::<_, GenerationJobRow>(concat!(
        "SELECT ",
        job_columns!(),
        " FROM generation_jobs \
         WHERE status = 'running' AND claimed_at < $1 \
         ORDER BY claimed_at \
         FOR UPDATE SKIP LOCKED"
    ))
    .bind(stale_before)
    .fetch_all(&mut *conn)
    .await?;

    into_jobs(rows)
}

// ---------------------------------------------------------------------------
// Inspection
// ---------------------------------------------------------------------------

/// Fetches a single job by id.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn get_generation_job(
    pool: &PgPool,
    job_id: Uuid,
) -> Result<Option<GenerationJob>, DbError> {
    sqlx::query_as::<_, GenerationJobRow>(concat!(
        "SELECT ",
        job_columns!(),
        " FROM generation_jobs WHERE id = $1"
    ))
    .bind(job_id)
    .fetch_optional(pool)
    .await?
    .map(GenerationJob::try_from)
    .transpose()
}

/// Counts jobs per status.
///
/// # Errors
///
/// Returns [`DbError::Corrupt`] for an unknown status, or [`DbError::Sqlx`].
pub async fn generation_job_stats(pool: &PgPool) -> Result<JobStats, DbError> {
    let rows = sqlx::query_as::<_, (String, i64)>(
        "SELECT status, COUNT(*) FROM generation_jobs GROUP BY status",
    )
    .fetch_all(pool)
    .await?;

    let mut stats = JobStats::default();
    for (status, count) in rows {
        stats.record(status.parse::<JobStatus>()?, count);
    }
    Ok(stats)
}

/// Returns the most recently failed `limit` jobs.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn list_failed_generation_jobs(
    pool: &PgPool,
    limit: i64,
) -> Result<Vec<GenerationJob>, DbError> {
    let rows = sqlx::query_as::<_, GenerationJobRow>(concat!(
        "SELECT ",
        job_columns!(),
        " FROM generation_jobs \
         WHERE status = 'failed' \
         ORDER BY updated_at DESC, id DESC \
         LIMIT $1"
    ))
    .bind(limit.max(0))
    .fetch_all(pool)
    .await?;

    into_jobs(rows)
}
