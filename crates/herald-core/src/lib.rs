//! Domain types and policies for herald's job orchestration.
//!
//! Nothing in this crate performs I/O. Storage lives in `herald-db`; the
//! worker runtime lives in `herald-server`.

pub mod app_config;
pub mod collaborators;
pub mod config;
pub mod deliveries;
pub mod jobs;
pub mod retry;
pub mod schedule;

use thiserror::Error;

pub use app_config::{AppConfig, Environment, ProcessRole};
pub use collaborators::{
    Artifact, CollaboratorError, DueRecipient, DueRecipients, Generator, RecipientPreferences,
    Sender,
};
pub use config::{load_app_config, load_app_config_from_env};
pub use deliveries::{Delivery, DeliveryStats, DeliveryStatus};
pub use jobs::{GenerationJob, JobStats, JobStatus, NewGenerationJob};
pub use retry::{FailureClass, RetryDecision, RetryPolicy};
pub use schedule::DeliveryPreference;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("invalid value for {var}: {reason}")]
    InvalidEnvVar { var: String, reason: String },
}

/// Returned when a status string read back from storage is not a known variant.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {kind} status: {value}")]
pub struct UnknownStatus {
    pub kind: &'static str,
    pub value: String,
}
