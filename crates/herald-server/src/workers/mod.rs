//! Generation worker pool.
//!
//! Workers are stateless: ownership of a job lives in the store's
//! `claimed_by` column, so any number of processes may run a pool.

mod generation;
mod poll;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use herald_core::{Generator, RecipientPreferences, RetryPolicy};
use herald_db::JobStore;

use generation::GenerationWorker;
use poll::PollBackoff;

/// Settings shared by every worker in a pool.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub workers: usize,
    pub policy: RetryPolicy,
    pub generation_timeout: Duration,
    pub delivery_max_retries: i32,
    pub poll_min: Duration,
    pub poll_max: Duration,
}

/// A per-process prefix for claim owner ids, so rows claimed by different
/// processes can be told apart when inspecting stale claims.
#[must_use]
pub fn instance_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", std::process::id(), &suffix[..8])
}

/// Spawns `settings.workers` generation workers onto a [`JoinSet`]. Each
/// worker stops polling once `cancel` fires.
pub fn spawn_generation_workers(
    instance: &str,
    settings: &PoolSettings,
    store: &Arc<dyn JobStore>,
    generator: &Arc<dyn Generator>,
    preferences: &Arc<dyn RecipientPreferences>,
    cancel: &CancellationToken,
) -> JoinSet<()> {
    let mut set = JoinSet::new();
    for n in 0..settings.workers {
        let worker = GenerationWorker::new(
            format!("gen-{instance}-{n}"),
            Arc::clone(store),
            Arc::clone(generator),
            Arc::clone(preferences),
            settings.policy.clone(),
            settings.generation_timeout,
            settings.delivery_max_retries,
        );
        let poll = PollBackoff::new(settings.poll_min, settings.poll_max);
        set.spawn(worker.run(poll, cancel.clone()));
    }
    tracing::info!(workers = settings.workers, "generation worker: pool started");
    set
}
