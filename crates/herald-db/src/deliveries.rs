//! Database operations for `deliveries`.

use chrono::{DateTime, TimeDelta, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use herald_core::{
    Delivery, DeliveryStats, DeliveryStatus, FailureClass, RetryDecision, RetryPolicy,
};

use crate::store::DeliveryOutcome;
use crate::DbError;

macro_rules! delivery_columns {
    () => {
        "id, artifact_ref, recipient_id, job_id, deliver_at, status, claimed_by, claimed_at, \
         retry_count, max_retries, not_before, sent_at, provider_receipt_id, error_message, \
         created_at, updated_at"
    };
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// A row from the `deliveries` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeliveryRow {
    pub id: Uuid,
    pub artifact_ref: String,
    pub recipient_id: Uuid,
    pub job_id: Option<Uuid>,
    /// Set once at insert; a trigger rejects any update that changes it.
    pub deliver_at: DateTime<Utc>,
    pub status: String,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub not_before: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub provider_receipt_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<DeliveryRow> for Delivery {
    type Error = DbError;

    fn try_from(row: DeliveryRow) -> Result<Self, Self::Error> {
        Ok(Delivery {
            id: row.id,
            artifact_ref: row.artifact_ref,
            recipient_id: row.recipient_id,
            job_id: row.job_id,
            deliver_at: row.deliver_at,
            status: row.status.parse::<DeliveryStatus>()?,
            claimed_by: row.claimed_by,
            claimed_at: row.claimed_at,
            retry_count: row.retry_count,
            max_retries: row.max_retries,
            not_before: row.not_before,
            sent_at: row.sent_at,
            provider_receipt_id: row.provider_receipt_id,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn into_deliveries(rows: Vec<DeliveryRow>) -> Result<Vec<Delivery>, DbError> {
    rows.into_iter().map(Delivery::try_from).collect()
}

// ---------------------------------------------------------------------------
// Creation and claim
// ---------------------------------------------------------------------------

/// Inserts a `pending` delivery for `artifact_ref`, or returns the one that
/// already exists. Runs inside the caller's job-completion transaction.
pub(crate) async fn insert_delivery_once(
    conn: &mut PgConnection,
    artifact_ref: &str,
    recipient_id: Uuid,
    job_id: Uuid,
    deliver_at: DateTime<Utc>,
    max_retries: i32,
    now: DateTime<Utc>,
) -> Result<DeliveryOutcome, DbError> {
    let inserted = sqlx::query_as::<_, DeliveryRow>(concat!(
        "INSERT INTO deliveries \
             (id, artifact_ref, recipient_id, job_id, deliver_at, status, max_retries, \
              created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, 'pending', $6, $7, $7) \
         ON CONFLICT (artifact_ref) DO NOTHING \
         RETURNING ",
        delivery_columns!()
    ))
    .bind(Uuid::new_v4())
    .bind(artifact_ref)
    .bind(recipient_id)
    .bind(job_id)
    .bind(deliver_at)
    .bind(max_retries)
    .bind(now)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(row) = inserted {
        return Ok(DeliveryOutcome::Created(row.try_into()?));
    }

    let existing = sqlx::query_as::<_, DeliveryRow>(concat!(
        "SELECT ",
        delivery_columns!(),
        " FROM deliveries WHERE artifact_ref = $1"
    ))
    .bind(artifact_ref)
    .fetch_one(&mut *conn)
    .await?;

    Ok(DeliveryOutcome::Existing(existing.try_into()?))
}

/// Atomically claims the earliest `pending` delivery due by `due_by` and
/// marks it `sending`, stamping `claimed_at`.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the update fails.
pub async fn claim_due_delivery(
    pool: &PgPool,
    worker_id: &str,
    due_by: DateTime<Utc>,
    claimed_at: DateTime<Utc>,
) -> Result<Option<Delivery>, DbError> {
    let row = sqlx::query_as::<_, DeliveryRow>(concat!(
        "WITH next_delivery AS ( \
             SELECT id FROM deliveries \
             WHERE status = 'pending' \
               AND deliver_at <= $2 \
               AND retry_count < max_retries \
               AND (not_before IS NULL OR not_before <= $2) \
             ORDER BY deliver_at, id \
             LIMIT 1 \
             FOR UPDATE SKIP LOCKED \
         ) \
         UPDATE deliveries \
         SET status = 'sending', claimed_by = $1, claimed_at = $3, updated_at = $3 \
         WHERE id = (SELECT id FROM next_delivery) \
         RETURNING ",
        delivery_columns!()
    ))
    .bind(worker_id)
    .bind(due_by)
    .bind(claimed_at)
    .fetch_optional(pool)
    .await?;

    row.map(Delivery::try_from).transpose()
}

// ---------------------------------------------------------------------------
// Send outcome
// ---------------------------------------------------------------------------

async fn lock_held_delivery(
    conn: &mut PgConnection,
    delivery_id: Uuid,
    worker_id: &str,
) -> Result<Delivery, DbError> {
    let delivery: Delivery = sqlx::query_as::<_, DeliveryRow>(concat!(
        "SELECT ",
        delivery_columns!(),
        " FROM deliveries WHERE id = $1 FOR UPDATE"
    ))
    .bind(delivery_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(DbError::NotFound)?
    .try_into()?;

    if !delivery.is_held_by(worker_id) {
        return Err(DbError::ClaimLost {
            id: delivery_id,
            worker_id: worker_id.to_string(),
        });
    }
    Ok(delivery)
}

/// Marks a held delivery `sent` with the provider's receipt.
///
/// # Errors
///
/// Returns [`DbError::ClaimLost`] if `worker_id` no longer holds the row,
/// [`DbError::NotFound`] if it does not exist, or [`DbError::Sqlx`] on failure.
pub async fn mark_delivery_sent(
    pool: &PgPool,
    delivery_id: Uuid,
    worker_id: &str,
    receipt_id: &str,
    now: DateTime<Utc>,
) -> Result<Delivery, DbError> {
    let row = sqlx::query_as::<_, DeliveryRow>(concat!(
        "UPDATE deliveries \
         SET status = 'sent', sent_at = $3, provider_receipt_id = $4, \
             claimed_by = NULL, claimed_at = NULL, not_before = NULL, updated_at = $3 \
         WHERE id = $1 AND status = 'sending' AND claimed_by = $2 \
         RETURNING ",
        delivery_columns!()
    ))
    .bind(delivery_id)
    .bind(worker_id)
    .bind(now)
    .bind(receipt_id)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => row.try_into(),
        None if get_delivery(pool, delivery_id).await?.is_some() => Err(DbError::ClaimLost {
            id: delivery_id,
            worker_id: worker_id.to_string(),
        }),
        None => Err(DbError::NotFound),
    }
}

/// Writes the outcome of a [`RetryDecision`] to a delivery and clears its claim.
pub(crate) async fn apply_delivery_failure(
    conn: &mut PgConnection,
    delivery_id: Uuid,
    decision: RetryDecision,
    message: &str,
    now: DateTime<Utc>,
) -> Result<Delivery, DbError> {
    let (status, not_before) = match decision {
        RetryDecision::Retry { not_before, .. } => (DeliveryStatus::Pending, Some(not_before)),
        RetryDecision::Fail { .. } => (DeliveryStatus::Failed, None),
    };

    sqlx::query_as::<_, DeliveryRow>(concat!(
        "UPDATE deliveries \
         SET status = $2, retry_count = $3, not_before = $4, error_message = $5, \
             claimed_by = NULL, claimed_at = NULL, updated_at = $6 \
         WHERE id = $1 \
         RETURNING ",
        delivery_columns!()
    ))
    .bind(delivery_id)
    .bind(status.as_str())
    .bind(decision.retry_count())
    .bind(not_before)
    .bind(message)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?
    .try_into()
}

/// Applies one send failure to a held delivery through `policy`.
///
/// # Errors
///
/// Returns [`DbError::ClaimLost`] if `worker_id` no longer holds the row,
/// [`DbError::NotFound`] if it does not exist, or [`DbError::Sqlx`] on failure.
pub async fn fail_delivery(
    pool: &PgPool,
    delivery_id: Uuid,
    worker_id: &str,
    class: FailureClass,
    message: &str,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> Result<Delivery, DbError> {
    let mut tx = pool.begin().await?;
    let delivery = lock_held_delivery(&mut tx, delivery_id, worker_id).await?;
    let decision = policy.decide(delivery.retry_count, delivery.max_retries, class, now);
    let updated = apply_delivery_failure(&mut tx, delivery_id, decision, message, now).await?;
    tx.commit().await?;
    Ok(updated)
}

/// Locks every `sending` delivery claimed before `stale_before`.
pub(crate) async fn lock_stale_deliveries(
    conn: &mut PgConnection,
    stale_before: DateTime<Utc>,
) -> Result<Vec<Delivery>, DbError> {
    let rows = sqlx::query_as::<_, DeliveryRow>(concat!(
        "SELECT ",
        delivery_columns!(),
        " FROM deliveries \
         WHERE status = 'sending' AND claimed_at < $1 \
         ORDER BY claimed_at \
         FOR UPDATE SKIP LOCKED"
    ))
    .bind(stale_before)
    .fetch_all(&mut *conn)
    .await?;

    into_deliveries(rows)
}

// ---------------------------------------------------------------------------
// Inspection
// ---------------------------------------------------------------------------

/// Fetches a single delivery by id.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn get_delivery(pool: &PgPool, delivery_id: Uuid) -> Result<Option<Delivery>, DbError> {
    sqlx::query_as::<_, DeliveryRow>(concat!(
        "SELECT ",
        delivery_columns!(),
        " FROM deliveries WHERE id = $1"
    ))
    .bind(delivery_id)
    .fetch_optional(pool)
    .await?
    .map(Delivery::try_from)
    .transpose()
}

/// Fetches the delivery for an artifact, if one was ever created.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn find_delivery_by_artifact(
    pool: &PgPool,
    artifact_ref: &str,
) -> Result<Option<Delivery>, DbError> {
    sqlx::query_as::<_, DeliveryRow>(concat!(
        "SELECT ",
        delivery_columns!(),
        " FROM deliveries WHERE artifact_ref = $1"
    ))
    .bind(artifact_ref)
    .fetch_optional(pool)
    .await?
    .map(Delivery::try_from)
    .transpose()
}

/// Counts deliveries per status plus the recent and upcoming windows.
///
/// # Errors
///
/// Returns [`DbError::Corrupt`] for an unknown status, or [`DbError::Sqlx`].
pub async fn delivery_stats(pool: &PgPool, now: DateTime<Utc>) -> Result<DeliveryStats, DbError> {
    let rows = sqlx::query_as::<_, (String, i64)>(
        "SELECT status, COUNT(*) FROM deliveries GROUP BY status",
    )
    .fetch_all(pool)
    .await?;

    let mut stats = DeliveryStats::default();
    for (status, count) in rows {
        stats.record(status.parse::<DeliveryStatus>()?, count);
    }

    let (sent_last_24h, upcoming_1h, upcoming_24h) = sqlx::query_as::<_, (i64, i64, i64)>(
        "SELECT \
             COUNT(*) FILTER (WHERE status = 'sent' AND sent_at >= $2), \
             COUNT(*) FILTER (WHERE status = 'pending' AND deliver_at >= $1 AND deliver_at < $3), \
             COUNT(*) FILTER (WHERE status = 'pending' AND deliver_at >= $1 AND deliver_at < $4) \
         FROM deliveries",
    )
    .bind(now)
    .bind(now - TimeDelta::hours(24))
    .bind(now + TimeDelta::hours(1))
    .bind(now + TimeDelta::hours(24))
    .fetch_one(pool)
    .await?;

    stats.sent_last_24h = sent_last_24h;
    stats.upcoming_1h = upcoming_1h;
    stats.upcoming_24h = upcoming_24h;
    Ok(stats)
}

/// Returns the most recently failed `limit` deliveries.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn list_failed_deliveries(pool: &PgPool, limit: i64) -> Result<Vec<Delivery>, DbError> {
    let rows = sqlx::query_as::<_, DeliveryRow>(concat!(
        "SELECT ",
        delivery_columns!(),
        " FROM deliveries \
         WHERE status = 'failed' \
         ORDER BY updated_at DESC, id DESC \
         LIMIT $1"
    ))
    .bind(limit.max(0))
    .fetch_all(pool)
    .await?;

    into_deliveries(rows)
}
