//! Generation jobs: one unit of "produce recipient X their next piece of content".

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::UnknownStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// `Completed` and `Failed` are final; nothing moves a job out of them.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(UnknownStatus {
                kind: "job",
                value: other.to_string(),
            }),
        }
    }
}

/// A persisted generation job.
///
/// `spec` is opaque to herald: it is handed to the generator untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationJob {
    pub id: Uuid,
    pub recipient_id: Uuid,
    pub spec: serde_json::Value,
    pub status: JobStatus,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub max_retries: i32,
    /// Earliest instant a retried job may be claimed again.
    pub not_before: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub artifact_ref: Option<String>,
    /// Recipient-local date this job was scheduled for; `None` for manual jobs.
    pub scheduling_period: Option<NaiveDate>,
    pub immediate_delivery: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl GenerationJob {
    /// Whether the claim primitive may select this job at `now`.
    #[must_use]
    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending
            && self.retry_count < self.max_retries
            && self.not_before.is_none_or(|t| t <= now)
    }

    #[must_use]
    pub fn is_held_by(&self, worker_id: &str) -> bool {
        self.status == JobStatus::Running && self.claimed_by.as_deref() == Some(worker_id)
    }
}

/// Input for creating a job.
#[derive(Debug, Clone, PartialEq)]
pub struct NewGenerationJob {
    pub recipient_id: Uuid,
    pub spec: serde_json::Value,
    pub max_retries: i32,
    pub scheduling_period: Option<NaiveDate>,
    pub immediate_delivery: bool,
}

impl NewGenerationJob {
    /// A job enqueued by the generation scheduler for one scheduling period.
    #[must_use]
    pub fn scheduled(
        recipient_id: Uuid,
        spec: serde_json::Value,
        max_retries: i32,
        period: NaiveDate,
    ) -> Self {
        Self {
            recipient_id,
            spec,
            max_retries,
            scheduling_period: Some(period),
            immediate_delivery: false,
        }
    }

    /// An operator-triggered job outside any scheduling period.
    #[must_use]
    pub fn manual(
        recipient_id: Uuid,
        spec: serde_json::Value,
        max_retries: i32,
        immediate_delivery: bool,
    ) -> Self {
        Self {
            recipient_id,
            spec,
            max_retries,
            scheduling_period: None,
            immediate_delivery,
        }
    }

    /// Rejects jobs that could never be claimed.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem when `max_retries < 1`.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_retries < 1 {
            return Err(format!(
                "max_retries must be at least 1, got {}",
                self.max_retries
            ));
        }
        Ok(())
    }
}

/// Job counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
}

impl JobStats {
    #[must_use]
    pub fn total(&self) -> i64 {
        self.pending + self.running + self.completed + self.failed
    }

    pub fn record(&mut self, status: JobStatus, count: i64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Running => self.running += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
        }
    }
}
