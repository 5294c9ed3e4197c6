//! In-process fakes for orchestration tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use herald_core::{
    Artifact, CollaboratorError, Delivery, DeliveryPreference, DeliveryStatus, DueRecipient,
    DueRecipients, Generator, RecipientPreferences, Sender,
};

pub(crate) fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

pub(crate) fn sample_delivery(artifact_ref: &str) -> Delivery {
    Delivery {
        id: Uuid::new_v4(),
        artifact_ref: artifact_ref.to_string(),
        recipient_id: Uuid::new_v4(),
        job_id: None,
        deliver_at: t0(),
        status: DeliveryStatus::Sending,
        claimed_by: Some("delivery-test".to_string()),
        claimed_at: Some(t0()),
        retry_count: 0,
        max_retries: 3,
        not_before: None,
        sent_at: None,
        provider_receipt_id: None,
        error_message: None,
        created_at: t0(),
        updated_at: t0(),
    }
}

/// Replays queued results, then falls back to a fresh artifact per call.
#[derive(Default)]
pub(crate) struct ScriptedGenerator {
    script: Mutex<VecDeque<Result<Artifact, CollaboratorError>>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedGenerator {
    pub(crate) fn new(script: Vec<Result<Artifact, CollaboratorError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    pub(crate) fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub(crate) fn artifact(artifact_ref: &str) -> Artifact {
    Artifact {
        artifact_ref: artifact_ref.to_string(),
        metadata: serde_json::Value::Null,
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, _spec: &serde_json::Value) -> Result<Artifact, CollaboratorError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().await.pop_front();
        next.unwrap_or_else(|| Ok(artifact(&format!("art-{call}"))))
    }
}

/// Records every delivery it is asked to send.
#[derive(Default)]
pub(crate) struct RecordingSender {
    sent: Mutex<Vec<Uuid>>,
    failure: Option<CollaboratorError>,
    delay: Option<Duration>,
}

impl RecordingSender {
    pub(crate) fn failing(err: CollaboratorError) -> Self {
        Self {
            failure: Some(err),
            ..Self::default()
        }
    }

    pub(crate) fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub(crate) async fn sent(&self) -> Vec<Uuid> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Sender for RecordingSender {
    async fn send(&self, delivery: &Delivery) -> Result<String, CollaboratorError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.sent.lock().await.push(delivery.id);
        match &self.failure {
            Some(err) => Err(err.clone()),
            None => Ok(format!("receipt-{}", delivery.id)),
        }
    }
}

/// Returns a fixed list of due recipients on every call.
pub(crate) struct StaticDue(pub(crate) Result<Vec<DueRecipient>, CollaboratorError>);

#[async_trait]
impl DueRecipients for StaticDue {
    async fn due_recipients(
        &self,
        _now: DateTime<Utc>,
    ) -> Result<Vec<DueRecipient>, CollaboratorError> {
        self.0.clone()
    }
}

/// Same preference for every recipient; remembers `record_generated` calls.
#[derive(Default)]
pub(crate) struct FixedPreferences {
    pub(crate) preference: DeliveryPreference,
    generated: Mutex<Vec<Uuid>>,
}

impl FixedPreferences {
    pub(crate) fn new(preference: DeliveryPreference) -> Self {
        Self {
            preference,
            generated: Mutex::default(),
        }
    }

    pub(crate) async fn generated(&self) -> Vec<Uuid> {
        self.generated.lock().await.clone()
    }
}

#[async_trait]
impl RecipientPreferences for FixedPreferences {
    async fn delivery_preference(
        &self,
        _recipient_id: Uuid,
    ) -> Result<DeliveryPreference, CollaboratorError> {
        Ok(self.preference)
    }

    async fn record_generated(
        &self,
        recipient_id: Uuid,
        _at: DateTime<Utc>,
    ) -> Result<(), CollaboratorError> {
        self.generated.lock().await.push(recipient_id);
        Ok(())
    }
}
