mod deliveries;
mod jobs;
mod recipients;

use clap::{Parser, Subcommand};
use uuid::Uuid;

use herald_db::PgJobStore;

use crate::deliveries::DeliveriesCommands;
use crate::jobs::JobsCommands;
use crate::recipients::RecipientsCommands;

#[derive(Debug, Parser)]
#[command(name = "herald-cli")]
#[command(about = "Herald operations command line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Database maintenance
    Db {
        #[command(subcommand)]
        command: DbCommands,
    },
    /// Inspect and manage generation jobs
    Jobs {
        #[command(subcommand)]
        command: JobsCommands,
    },
    /// Inspect deliveries
    Deliveries {
        #[command(subcommand)]
        command: DeliveriesCommands,
    },
    /// Manage recipient delivery preferences
    Recipients {
        #[command(subcommand)]
        command: RecipientsCommands,
    },
    /// Run one stale-claim reaper pass and exit
    Reap,
}

#[derive(Debug, Subcommand)]
enum DbCommands {
    /// Check database connectivity
    Ping,
    /// Apply pending migrations
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let Some(command) = cli.command else {
        println!("herald-cli: no command given; see --help");
        return Ok(());
    };

    let config = herald_core::load_app_config()?;
    let pool_config = herald_db::PoolConfig::from_app_config(&config);
    let pool = herald_db::connect_pool(&config.database_url, pool_config).await?;

    match command {
        Commands::Db {
            command: DbCommands::Ping,
        } => {
            herald_db::health_check(&pool).await?;
            println!("database ok");
        }
        Commands::Db {
            command: DbCommands::Migrate,
        } => {
            let applied = herald_db::run_migrations(&pool).await?;
            println!("migrations applied: {applied}");
        }
        Commands::Jobs { command } => {
            let store = PgJobStore::new(pool);
            jobs::run(&store, &config, command).await?;
        }
        Commands::Deliveries { command } => {
            let store = PgJobStore::new(pool);
            deliveries::run(&store, command).await?;
        }
        Commands::Recipients { command } => recipients::run(&pool, &config, command).await?,
        Commands::Reap => {
            let store = PgJobStore::new(pool);
            jobs::run_reap(&store, &config, chrono::Utc::now()).await?;
        }
    }

    Ok(())
}

/// Parses a job or recipient id argument.
fn parse_id(raw: &str) -> Result<Uuid, String> {
    Uuid::parse_str(raw.trim()).map_err(|e| format!("invalid id '{raw}': {e}"))
}
