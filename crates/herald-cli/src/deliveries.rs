//! Read-only delivery query handlers.

use chrono::Utc;
use clap::Subcommand;

use herald_core::Delivery;
use herald_db::JobStore;

/// Sub-commands available under `deliveries`.
#[derive(Debug, Subcommand)]
pub enum DeliveriesCommands {
    /// Delivery counts by status plus sent and upcoming windows
    Stats,
    /// Most recently failed deliveries
    Failed {
        #[arg(long, default_value = "20")]
        limit: i64,
    },
}

pub(crate) async fn run(store: &dyn JobStore, command: DeliveriesCommands) -> anyhow::Result<()> {
    match command {
        DeliveriesCommands::Stats => {
            let stats = store.delivery_stats(Utc::now()).await?;
            println!("{:<16}{:>8}", "STATUS", "COUNT");
            println!("{:<16}{:>8}", "pending", stats.pending);
            println!("{:<16}{:>8}", "sending", stats.sending);
            println!("{:<16}{:>8}", "sent", stats.sent);
            println!("{:<16}{:>8}", "failed", stats.failed);
            println!();
            println!("{:<16}{:>8}", "sent (24h)", stats.sent_last_24h);
            println!("{:<16}{:>8}", "due (1h)", stats.upcoming_1h);
            println!("{:<16}{:>8}", "due (24h)", stats.upcoming_24h);
        }
        DeliveriesCommands::Failed { limit } => {
            let deliveries = store.list_failed_deliveries(limit.clamp(1, 200)).await?;
            print_failed(&deliveries);
        }
    }
    Ok(())
}

fn print_failed(deliveries: &[Delivery]) {
    if deliveries.is_empty() {
        println!("no failed deliveries");
        return;
    }

    println!(
        "{:<38}{:<38}{:<18}ERROR",
        "DELIVERY", "RECIPIENT", "DELIVER AT"
    );
    for delivery in deliveries {
        println!(
            "{:<38}{:<38}{:<18}{}",
            delivery.id,
            delivery.recipient_id,
            delivery.deliver_at.format("%Y-%m-%d %H:%M"),
            delivery.error_message.as_deref().unwrap_or("")
        );
    }
}
