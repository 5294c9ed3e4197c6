//! Recipient preference commands.

use chrono::Utc;
use clap::Subcommand;
use uuid::Uuid;

use herald_core::AppConfig;

/// Sub-commands available under `recipients`.
#[derive(Debug, Subcommand)]
pub enum RecipientsCommands {
    /// Create or update a recipient's delivery preference
    Upsert {
        #[arg(long, value_parser = crate::parse_id)]
        id: Uuid,
        /// Local delivery time as HH:MM
        #[arg(long, default_value = "08:00")]
        time: String,
        /// IANA time zone name
        #[arg(long, default_value = "UTC")]
        timezone: String,
        /// Generation spec as a JSON document
        #[arg(long, default_value = "{}")]
        spec: String,
        /// Store the recipient as inactive
        #[arg(long)]
        inactive: bool,
    },
    /// List active recipients with their next delivery slot
    List,
}

pub(crate) async fn run(
    pool: &sqlx::PgPool,
    config: &AppConfig,
    command: RecipientsCommands,
) -> anyhow::Result<()> {
    match command {
        RecipientsCommands::Upsert {
            id,
            time,
            timezone,
            spec,
            inactive,
        } => {
            let spec: serde_json::Value = serde_json::from_str(&spec)
                .map_err(|e| anyhow::anyhow!("--spec is not valid JSON: {e}"))?;
            let row =
                herald_db::recipients::upsert_recipient(pool, id, &time, &timezone, &spec, !inactive).await?;
            let next = row.preference().next_delivery_at(Utc::now());
            println!(
                "recipient {} saved; next delivery {}",
                row.id,
                next.format("%Y-%m-%d %H:%M UTC")
            );
        }
        RecipientsCommands::List => {
            let rows = herald_db::recipients::list_active_recipients(pool).await?;
            if rows.is_empty() {
                println!("no active recipients");
                return Ok(());
            }

            let now = Utc::now();
            let lead = config.generation_lead();
            println!(
                "{:<38}{:<8}{:<22}{:<20}GENERATES FROM",
                "RECIPIENT", "TIME", "TIMEZONE", "NEXT DELIVERY"
            );
            for row in &rows {
                let next = row.preference().next_delivery_at(now);
                println!(
                    "{:<38}{:<8}{:<22}{:<20}{}",
                    row.id,
                    row.delivery_time,
                    row.timezone,
                    next.format("%Y-%m-%d %H:%M"),
                    (next - lead).format("%Y-%m-%d %H:%M")
                );
            }
        }
    }
    Ok(())
}
