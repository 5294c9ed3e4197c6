mod api;
mod http;
mod middleware;
mod scheduler;
#[cfg(test)]
mod test_support;
mod workers;

use std::sync::Arc;

use anyhow::Context;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use herald_core::{AppConfig, DueRecipients, Generator, RecipientPreferences, Sender};
use herald_db::{JobStore, PgJobStore, PgRecipients};

use crate::{
    api::{build_app, AppState},
    http::{HttpGenerator, HttpSender},
    middleware::{AuthState, RateLimitState},
    scheduler::{DeliveryDispatcher, GenerationScheduler, Reaper, SchedulerParts},
    workers::PoolSettings,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = herald_core::load_app_config()?;
    config.validate_for_server()?;
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.log_level.clone()))?;
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let pool_config = herald_db::PoolConfig::from_app_config(&config);
    let pool = herald_db::connect_pool(&config.database_url, pool_config).await?;
    herald_db::run_migrations(&pool).await?;

    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(pool.clone()));
    let recipients = Arc::new(PgRecipients::new(
        pool,
        config.generation_lead(),
        config.generation_window(),
    ));
    let instance = workers::instance_id();
    let cancel = CancellationToken::new();

    tracing::info!(
        role = %config.role,
        env = %config.env,
        instance = %instance,
        "herald starting"
    );

    let mut worker_set = if config.role.runs_workers() {
        let generator: Arc<dyn Generator> = Arc::new(
            HttpGenerator::new(
                config
                    .generator_url
                    .as_deref()
                    .context("HERALD_GENERATOR_URL is required to run workers")?,
                config.generation_timeout(),
            )?,
        );
        let preferences: Arc<dyn RecipientPreferences> = recipients.clone();
        workers::spawn_generation_workers(
            &instance,
            &pool_settings(&config),
            &store,
            &generator,
            &preferences,
            &cancel,
        )
    } else {
        JoinSet::new()
    };

    if config.role.runs_scheduler() {
        let sender: Arc<dyn Sender> = Arc::new(
            HttpSender::new(
                config
                    .sender_url
                    .as_deref()
                    .context("HERALD_SENDER_URL is required to run the scheduler")?,
                config.send_timeout(),
            )?,
        );
        let due: Arc<dyn DueRecipients> = recipients;
        let mut scheduler = scheduler::build_scheduler(SchedulerParts {
            generation: GenerationScheduler::new(Arc::clone(&store), due, config.job_max_retries),
            reaper: Reaper::new(
                Arc::clone(&store),
                config.retry_policy(),
                config.stale_job_after(),
                config.stale_delivery_after(),
            ),
            delivery: DeliveryDispatcher::new(
                Arc::clone(&store),
                sender,
                config.retry_policy(),
                format!("send-{instance}"),
                config.delivery_concurrency,
                config.send_timeout(),
            ),
            tick: config.scheduler_tick(),
        })
        .await?;

        let auth = AuthState::from_config(&config)?;
        let app = build_app(
            AppState {
                store: Arc::clone(&store),
                job_max_retries: config.job_max_retries,
            },
            auth,
            RateLimitState::from_config(&config),
        );

        let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
        tracing::info!(addr = %config.bind_addr, "api: listening");
        let shutdown = cancel.clone();
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                shutdown.cancel();
            })
            .await;

        if let Err(e) = scheduler.shutdown().await {
            tracing::warn!(error = %e, "scheduler: shutdown failed");
        }
        served?;
    } else {
        shutdown_signal().await;
        cancel.cancel();
    }

    while let Some(joined) = worker_set.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "generation worker: task panicked");
        }
    }

    tracing::info!("herald stopped");
    Ok(())
}

fn pool_settings(config: &AppConfig) -> PoolSettings {
    PoolSettings {
        workers: config.generation_workers,
        policy: config.retry_policy(),
        generation_timeout: config.generation_timeout(),
        delivery_max_retries: config.delivery_max_retries,
        poll_min: std::time::Duration::from_millis(config.worker_poll_min_ms),
        poll_max: std::time::Duration::from_millis(config.worker_poll_max_ms),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("received shutdown signal, starting graceful shutdown");
}
