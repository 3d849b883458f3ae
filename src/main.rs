use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use autoshop_api::{
    config,
    db,
    events::{self, EventSender},
    AppServices,
};

#[derive(Parser)]
#[command(name = "autoshop", about = "Operator tasks for the repair-shop back office", version)]
struct Cli {
    #[arg(
        long,
        global = true,
        action = ArgAction::SetTrue,
        help = "Render command output as pretty JSON"
    )]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending schema migrations
    Migrate,
    /// Flag parts whose stock has not moved within the configured window
    ScanInventory,
    /// Raise or escalate LONG_SHIFT alerts for shifts still open
    InspectShifts,
    /// Print payables bucketed by age
    PayablesAging {
        /// Report date (YYYY-MM-DD); defaults to today
        #[arg(long)]
        date: Option<NaiveDate>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config().context("failed to load configuration")?;
    config::init_tracing(cfg.log_level(), cfg.log_json);

    let pool = db::establish_connection_from_app_config(&cfg)
        .await
        .context("failed to connect to the database")?;
    db::check_connection(&pool)
        .await
        .context("database is not answering")?;

    if matches!(cli.command, Commands::Migrate) {
        db::run_migrations(&pool).await.context("migration failed")?;
        println!("Migrations applied");
        return Ok(());
    }
    if cfg.auto_migrate {
        db::run_migrations(&pool).await.context("migration failed")?;
    }

    let (event_sender, event_rx) = EventSender::channel(cfg.event_channel_capacity);
    let processor = tokio::spawn(events::process_events(event_rx, Vec::new()));

    let services = AppServices::new(
        Arc::new(pool),
        Arc::new(event_sender),
        cfg.business().clone(),
    );

    let now = Utc::now();
    match cli.command {
        Commands::Migrate => {}
        Commands::ScanInventory => {
            let alerts = services
                .inventory
                .scan_no_movement(now)
                .await
                .context("inventory scan failed")?;
            if cli.json {
                print_json(&alerts)?;
            } else {
                println!("{} part(s) flagged NO_MOVEMENT", alerts.len());
                for alert in &alerts {
                    println!("  part {}: {}", alert.part_id, alert.message);
                }
            }
        }
        Commands::InspectShifts => {
            let alerts = services
                .cash_shifts
                .inspect_open_shifts(now)
                .await
                .context("shift inspection failed")?;
            if cli.json {
                print_json(&alerts)?;
            } else {
                println!("{} LONG_SHIFT alert(s) raised or escalated", alerts.len());
                for alert in &alerts {
                    println!("  shift {}: {}", alert.shift_id, alert.message);
                }
            }
        }
        Commands::PayablesAging { date } => {
            let today = date.unwrap_or_else(|| now.date_naive());
            let report = services
                .payables
                .aging_report(today)
                .await
                .context("aging report failed")?;
            if cli.json {
                print_json(&report)?;
            } else {
                for entry in &report.entries {
                    println!(
                        "{:>6}  {:<40} {:>12}  ({} days)",
                        entry.bucket.label(),
                        entry.description,
                        entry.balance,
                        entry.days
                    );
                }
                println!(
                    "0-30: {}  31-60: {}  61+: {}  total: {}",
                    report.current,
                    report.days_31_to_60,
                    report.over_60,
                    report.total()
                );
            }
        }
    }

    // Closing the last sender lets the processor drain and stop.
    drop(services);
    let _ = processor.await;
    info!("Done");
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
