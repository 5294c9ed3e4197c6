//! Generation job command handlers for the CLI.
//!
//! Handlers take a `&dyn JobStore` so they run unchanged against the
//! in-memory store in tests.

use chrono::{DateTime, Utc};
use clap::Subcommand;
use uuid::Uuid;

use herald_core::{AppConfig, GenerationJob, NewGenerationJob};
use herald_db::{EnqueueOutcome, JobStore, ReapReport};

/// Sub-commands available under `jobs`.
#[derive(Debug, Subcommand)]
pub enum JobsCommands {
    /// Enqueue a manual generation job for a recipient
    Enqueue {
        /// Recipient id
        #[arg(long, value_parser = crate::parse_id)]
        recipient: Uuid,
        /// Generation spec as a JSON document
        #[arg(long, default_value = "{}")]
        spec: String,
        /// Deliver as soon as generation completes instead of at the preferred time
        #[arg(long)]
        immediate: bool,
    },
    /// Show one job
    Show {
        #[arg(value_parser = crate::parse_id)]
        id: Uuid,
    },
    /// Job counts by status
    Stats,
    /// Most recently failed jobs
    Failed {
        #[arg(long, default_value = "20")]
        limit: i64,
    },
    /// Move a pending or running job to failed
    Abort {
        #[arg(value_parser = crate::parse_id)]
        id: Uuid,
        #[arg(long)]
        reason: String,
    },
}

pub(crate) async fn run(
    store: &dyn JobStore,
    config: &AppConfig,
    command: JobsCommands,
) -> anyhow::Result<()> {
    match command {
        JobsCommands::Enqueue {
            recipient,
            spec,
            immediate,
        } => {
            let spec: serde_json::Value = serde_json::from_str(&spec)
                .map_err(|e| anyhow::anyhow!("--spec is not valid JSON: {e}"))?;
            run_enqueue(store, config, recipient, spec, immediate).await?;
            Ok(())
        }
        JobsCommands::Show { id } => {
            let job = store
                .get_job(id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("job {id} not found"))?;
            print_job_detail(&job);
            Ok(())
        }
        JobsCommands::Stats => {
            let stats = store.job_stats().await?;
            println!("{:<12}{:>8}", "STATUS", "COUNT");
            println!("{:<12}{:>8}", "pending", stats.pending);
            println!("{:<12}{:>8}", "running", stats.running);
            println!("{:<12}{:>8}", "completed", stats.completed);
            println!("{:<12}{:>8}", "failed", stats.failed);
            println!("{:<12}{:>8}", "total", stats.total());
            Ok(())
        }
        JobsCommands::Failed { limit } => {
            let jobs = store.list_failed_jobs(limit.clamp(1, 200)).await?;
            print_failed(&jobs);
            Ok(())
        }
        JobsCommands::Abort { id, reason } => {
            let reason = reason.trim();
            anyhow::ensure!(!reason.is_empty(), "--reason must not be empty");
            let job = store.abort_job(id, reason, Utc::now()).await?;
            tracing::warn!(job_id = %job.id, reason, "cli: job aborted");
            println!("job {} is now {}", job.id, job.status.as_str());
            Ok(())
        }
    }
}

/// Enqueue a manual job and report whether it was created.
///
/// A recipient that already has an active job is reported, not treated as
/// an error, so scripted enqueues can be re-run safely.
///
/// # Errors
///
/// Returns an error if the store rejects the job or the write fails.
pub(crate) async fn run_enqueue(
    store: &dyn JobStore,
    config: &AppConfig,
    recipient: Uuid,
    spec: serde_json::Value,
    immediate: bool,
) -> anyhow::Result<EnqueueOutcome> {
    let outcome = store
        .create_job(
            NewGenerationJob::manual(recipient, spec, config.job_max_retries, immediate),
            Utc::now(),
        )
        .await?;

    match &outcome {
        EnqueueOutcome::Created(job) => println!("enqueued job {}", job.id),
        EnqueueOutcome::AlreadyActive(existing) | EnqueueOutcome::AlreadyScheduled(existing) => {
            println!("recipient {recipient} already has active job {existing}; nothing enqueued");
        }
    }
    Ok(outcome)
}

/// Run a single reaper pass over both tables.
///
/// # Errors
///
/// Returns an error if either reap query fails.
pub(crate) async fn run_reap(
    store: &dyn JobStore,
    config: &AppConfig,
    now: DateTime<Utc>,
) -> anyhow::Result<(ReapReport, ReapReport)> {
    let policy = config.retry_policy();
    let jobs = store
        .reap_stale_jobs(now - config.stale_job_after(), &policy, now)
        .await?;
    let deliveries = store
        .reap_stale_deliveries(now - config.stale_delivery_after(), &policy, now)
        .await?;

    println!(
        "jobs: {} requeued, {} failed",
        jobs.requeued.len(),
        jobs.failed.len()
    );
    println!(
        "deliveries: {} requeued, {} failed",
        deliveries.requeued.len(),
        deliveries.failed.len()
    );
    Ok((jobs, deliveries))
}

fn fmt_time(at: Option<DateTime<Utc>>) -> String {
    at.map_or_else(|| "-".to_string(), |t| t.format("%Y-%m-%d %H:%M:%S").to_string())
}

fn print_job_detail(job: &GenerationJob) {
    println!("Job:          {}", job.id);
    println!("Recipient:    {}", job.recipient_id);
    println!("Status:       {}", job.status.as_str());
    println!("Retries:      {}/{}", job.retry_count, job.max_retries);
    println!("Claimed by:   {}", job.claimed_by.as_deref().unwrap_or("-"));
    println!("Claimed at:   {}", fmt_time(job.claimed_at));
    println!("Not before:   {}", fmt_time(job.not_before));
    println!(
        "Period:       {}",
        job.scheduling_period
            .map_or_else(|| "manual".to_string(), |d| d.to_string())
    );
    println!("Immediate:    {}", job.immediate_delivery);
    println!("Artifact:     {}", job.artifact_ref.as_deref().unwrap_or("-"));
    println!("Error:        {}", job.error_message.as_deref().unwrap_or("-"));
    println!("Created:      {}", fmt_time(Some(job.created_at)));
    println!("Completed:    {}", fmt_time(job.completed_at));
}

fn print_failed(jobs: &[GenerationJob]) {
    if jobs.is_empty() {
        println!("no failed jobs");
        return;
    }

    println!("{:<38}{:<38}{:<9}ERROR", "JOB", "RECIPIENT", "RETRIES");
    for job in jobs {
        println!(
            "{:<38}{:<38}{:<9}{}",
            job.id,
            job.recipient_id,
            format!("{}/{}", job.retry_count, job.max_retries),
            job.error_message.as_deref().unwrap_or("")
        );
    }
}
