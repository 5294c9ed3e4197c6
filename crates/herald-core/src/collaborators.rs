//! Contracts for the routines herald orchestrates but does not own.
//!
//! Content generation, the send transport and recipient storage all live
//! outside this system. Each is reached through one of the traits below so
//! workers and schedulers can be exercised against in-process fakes.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::deliveries::Delivery;
use crate::retry::FailureClass;
use crate::schedule::DeliveryPreference;

/// Output of a successful generation. Herald stores `artifact_ref` and never
/// looks inside `metadata`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_ref: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// A failure reported by an external routine, already classified.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CollaboratorError {
    pub class: FailureClass,
    pub message: String,
}

impl CollaboratorError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Retryable,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Fatal,
            message: message.into(),
        }
    }

    /// A call that exceeded its deadline. Always retryable.
    #[must_use]
    pub fn timeout(after: std::time::Duration) -> Self {
        Self::retryable(format!("timed out after {}s", after.as_secs()))
    }

    /// Classifies a bare message with [`FailureClass::from_message`].
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            class: FailureClass::from_message(&message),
            message,
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.class == FailureClass::Retryable
    }
}

/// One recipient the generation scheduler should enqueue for.
#[derive(Debug, Clone, PartialEq)]
pub struct DueRecipient {
    pub recipient_id: Uuid,
    pub spec: serde_json::Value,
    /// Recipient-local date of the delivery slot being prepared.
    pub period: NaiveDate,
}

#[async_trait]
pub trait Generator: Send + Sync {
    /// Produces content for an opaque spec. May take minutes.
    async fn generate(&self, spec: &serde_json::Value) -> Result<Artifact, CollaboratorError>;
}

#[async_trait]
pub trait Sender: Send + Sync {
    /// Delivers an artifact and returns the provider's receipt id.
    async fn send(&self, delivery: &Delivery) -> Result<String, CollaboratorError>;
}

#[async_trait]
pub trait DueRecipients: Send + Sync {
    /// Recipients that need a new job as of `now`.
    async fn due_recipients(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<DueRecipient>, CollaboratorError>;
}

#[async_trait]
pub trait RecipientPreferences: Send + Sync {
    /// The recipient's preferred local delivery time. Unknown recipients get
    /// [`DeliveryPreference::default`].
    async fn delivery_preference(
        &self,
        recipient_id: Uuid,
    ) -> Result<DeliveryPreference, CollaboratorError>;

    /// Records a successful generation. Purely informational.
    async fn record_generated(
        &self,
        _recipient_id: Uuid,
        _at: DateTime<Utc>,
    ) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_message_classifies() {
        assert!(CollaboratorError::from_message("HTTP 429 Too Many Requests").is_retryable());
        assert!(!CollaboratorError::from_message("invalid spec").is_retryable());
    }

    #[test]
    fn timeout_is_retryable() {
        let err = CollaboratorError::timeout(std::time::Duration::from_secs(600));
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "timed out after 600s");
    }

    #[test]
    fn artifact_metadata_defaults_to_null() {
        let artifact: Artifact = serde_json::from_str(r#"{"artifact_ref":"a-1"}"#).unwrap();
        assert_eq!(artifact.artifact_ref, "a-1");
        assert!(artifact.metadata.is_null());
    }
}
