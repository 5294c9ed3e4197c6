//! Background job scheduler.
//!
//! Registers the three single-instance ticks on a [`JobScheduler`]: the
//! generation scheduler, the stale-claim reaper and the delivery scheduler.
//! Only one process in a deployment may run these (`HERALD_ROLE=all` or
//! `scheduler`); the claim primitives keep concurrent workers safe but the
//! enumeration halves assume a single caller.

mod delivery;
mod generation;
mod reaper;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};

pub use delivery::{DeliveryDispatcher, DispatchReport};
pub use generation::GenerationScheduler;
pub use reaper::Reaper;

/// Everything the scheduler ticks need.
pub struct SchedulerParts {
    pub generation: GenerationScheduler,
    pub reaper: Reaper,
    pub delivery: DeliveryDispatcher,
    pub tick: Duration,
}

/// Builds and starts the background job scheduler.
///
/// Returns the running [`JobScheduler`] handle, which must be kept alive
/// for the lifetime of the process. Call `shutdown` on it before exit.
///
/// # Errors
///
/// Returns [`JobSchedulerError`] if the scheduler cannot be initialised,
/// a job cannot be registered, or the scheduler fails to start.
pub async fn build_scheduler(parts: SchedulerParts) -> Result<JobScheduler, JobSchedulerError> {
    let scheduler = JobScheduler::new().await?;
    let SchedulerParts {
        generation,
        reaper,
        delivery,
        tick,
    } = parts;

    let generation = Arc::new(generation);
    register_tick(&scheduler, "generation", tick, move || {
        let generation = Arc::clone(&generation);
        async move {
            let report = generation.tick(Utc::now()).await;
            if report.enqueued > 0 || report.errors > 0 {
                tracing::info!(
                    enqueued = report.enqueued,
                    skipped = report.skipped,
                    errors = report.errors,
                    "scheduler: generation tick complete"
                );
            }
        }
    })
    .await?;

    let reaper = Arc::new(reaper);
    register_tick(&scheduler, "reaper", tick, move || {
        let reaper = Arc::clone(&reaper);
        async move {
            reaper.tick(Utc::now()).await;
        }
    })
    .await?;

    let delivery = Arc::new(delivery);
    register_tick(&scheduler, "delivery", tick, move || {
        let delivery = Arc::clone(&delivery);
        async move {
            let report = delivery.tick(Utc::now()).await;
            if report != DispatchReport::default() {
                tracing::info!(
                    sent = report.sent,
                    retried = report.retried,
                    failed = report.failed,
                    lost = report.lost,
                    "scheduler: delivery tick complete"
                );
            }
        }
    })
    .await?;

    scheduler.start().await?;
    tracing::info!(tick_secs = tick.as_secs(), "scheduler: started");
    Ok(scheduler)
}

/// Registers `run` on a fixed interval. A tick that is still running when
/// the next one fires causes that next one to be skipped.
async fn register_tick<F, Fut>(
    scheduler: &JobScheduler,
    name: &'static str,
    every: Duration,
    run: F,
) -> Result<(), JobSchedulerError>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let run = Arc::new(run);
    let in_flight = Arc::new(Mutex::new(()));

    let job = Job::new_repeated_async(every, move |_uuid, _lock| {
        let run = Arc::clone(&run);
        let in_flight = Arc::clone(&in_flight);

        Box::pin(async move {
            let Ok(_guard) = in_flight.try_lock() else {
                tracing::debug!(tick = name, "scheduler: previous tick still running; skipping");
                return;
            };
            run().await;
        })
    })?;

    scheduler.add(job).await?;
    tracing::info!(tick = name, every_secs = every.as_secs(), "scheduler: registered tick");
    Ok(())
}
