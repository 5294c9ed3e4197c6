//! Recipient delivery preferences and the Postgres-backed due-recipient source.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use herald_core::{
    CollaboratorError, DeliveryPreference, DueRecipient, DueRecipients, RecipientPreferences,
};

use crate::DbError;

/// A row from the `recipients` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RecipientRow {
    pub id: Uuid,
    /// Local `HH:MM`; malformed values fall back to 08:00 when parsed.
    pub delivery_time: String,
    /// IANA zone name; unknown zones fall back to UTC when parsed.
    pub timezone: String,
    pub spec: serde_json::Value,
    pub is_active: bool,
    pub last_generated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RecipientRow {
    #[must_use]
    pub fn preference(&self) -> DeliveryPreference {
        DeliveryPreference::parse(&self.delivery_time, &self.timezone)
    }
}

/// Inserts or updates a recipient's preferences.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the upsert fails.
pub async fn upsert_recipient(
    pool: &PgPool,
    id: Uuid,
    delivery_time: &str,
    timezone: &str,
    spec: &serde_json::Value,
    is_active: bool,
) -> Result<RecipientRow, DbError> {
    let row = sqlx::query_as::<_, RecipientRow>(
        "INSERT INTO recipients (id, delivery_time, timezone, spec, is_active) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (id) DO UPDATE SET \
             delivery_time = EXCLUDED.delivery_time, \
             timezone      = EXCLUDED.timezone, \
             spec          = EXCLUDED.spec, \
             is_active     = EXCLUDED.is_active, \
             updated_at    = NOW() \
         RETURNING id, delivery_time, timezone, spec, is_active, last_generated_at, \
                   created_at, updated_at",
    )
    .bind(id)
    .bind(delivery_time)
    .bind(timezone)
    .bind(spec)
    .bind(is_active)
    .fetch_one(pool)
    .await?;

    Ok(row)
}

/// Fetches one recipient.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn get_recipient(pool: &PgPool, id: Uuid) -> Result<Option<RecipientRow>, DbError> {
    let row = sqlx::query_as::<_, RecipientRow>(
        "SELECT id, delivery_time, timezone, spec, is_active, last_generated_at, \
                created_at, updated_at \
         FROM recipients WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// Returns every active recipient.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn list_active_recipients(pool: &PgPool) -> Result<Vec<RecipientRow>, DbError> {
    let rows = sqlx::query_as::<_, RecipientRow>(
        "SELECT id, delivery_time, timezone, spec, is_active, last_generated_at, \
                created_at, updated_at \
         FROM recipients WHERE is_active \
         ORDER BY id",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Records the instant of a recipient's last successful generation.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the update fails.
pub async fn mark_generated(pool: &PgPool, id: Uuid, at: DateTime<Utc>) -> Result<(), DbError> {
    sqlx::query(
        "UPDATE recipients SET last_generated_at = $2, updated_at = NOW() WHERE id = $1",
    )
    .bind(id)
    .bind(at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Existing `(recipient_id, scheduling_period)` pairs among the candidates.
async fn scheduled_periods(
    pool: &PgPool,
    recipient_ids: &[Uuid],
) -> Result<HashSet<(Uuid, NaiveDate)>, DbError> {
    let rows = sqlx::query_as::<_, (Uuid, NaiveDate)>(
        "SELECT recipient_id, scheduling_period FROM generation_jobs \
         WHERE recipient_id = ANY($1) AND scheduling_period IS NOT NULL",
    )
    .bind(recipient_ids)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().collect())
}

fn collaborator_error(err: &DbError) -> CollaboratorError {
    if err.is_transient() {
        CollaboratorError::retryable(err.to_string())
    } else {
        CollaboratorError::fatal(err.to_string())
    }
}

/// Recipients and their preferences as stored in Postgres.
///
/// A recipient is due when `now` is inside the generation window of one of
/// its delivery slots and no job exists yet for that slot's local date.
#[derive(Debug, Clone)]
pub struct PgRecipients {
    pool: PgPool,
    lead: TimeDelta,
    window: TimeDelta,
}

impl PgRecipients {
    #[must_use]
    pub fn new(pool: PgPool, lead: TimeDelta, window: TimeDelta) -> Self {
        Self { pool, lead, window }
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<DueRecipient>, DbError> {
        let candidates: Vec<DueRecipient> = list_active_recipients(&self.pool)
            .await?
            .into_iter()
            .filter_map(|row| {
                let period = row.preference().due_period(now, self.lead, self.window)?;
                Some(DueRecipient {
                    recipient_id: row.id,
                    spec: row.spec,
                    period,
                })
            })
            .collect();
        if candidates.is_empty() {
            return Ok(candidates);
        }

        let ids: Vec<Uuid> = candidates.iter().map(|c| c.recipient_id).collect();
        let existing = scheduled_periods(&self.pool, &ids).await?;
        Ok(candidates
            .into_iter()
            .filter(|c| !existing.contains(&(c.recipient_id, c.period)))
            .collect())
    }
}

#[async_trait]
impl DueRecipients for PgRecipients {
    async fn due_recipients(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<DueRecipient>, CollaboratorError> {
        self.due(now).await.map_err(|e| collaborator_error(&e))
    }
}

#[async_trait]
impl RecipientPreferences for PgRecipients {
    async fn delivery_preference(
        &self,
        recipient_id: Uuid,
    ) -> Result<DeliveryPreference, CollaboratorError> {
        let row = get_recipient(&self.pool, recipient_id)
            .await
            .map_err(|e| collaborator_error(&e))?;
        Ok(row.map(|r| r.preference()).unwrap_or_default())
    }

    async fn record_generated(
        &self,
        recipient_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), CollaboratorError> {
        mark_generated(&self.pool, recipient_id, at)
            .await
            .map_err(|e| collaborator_error(&e))
    }
}
