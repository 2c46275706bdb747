//! Synthetic futures bridge
//!
//! Receives trend-following alerts over a webhook and trades each as a
//! synthetic long future (short ATM put + long ATM call) through a broker
//! REST gateway, with persistent position state and broker reconciliation.

mod api;
mod bot;
mod db;
mod execution;
mod models;
mod reconcile;
mod server;
mod trading;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::bot::{Bot, BotConfig, BotStatus};
use crate::db::PositionStore;
use crate::reconcile::{MonitorConfig, ReconcileStatus};
use crate::trading::{InstrumentBook, TradingConfig};

/// Synthetic futures webhook bridge CLI.
#[derive(Parser)]
#[command(name = "synthbridge")]
#[command(about = "Trade webhook signals as synthetic futures", long_about = None)]
struct Cli {
    /// Database URL
    #[arg(short, long, env = "DATABASE_URL", default_value = "sqlite:./synthbridge.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// JSON file replacing the built-in instrument table
    #[arg(long, env = "INSTRUMENTS_FILE")]
    instruments: Option<PathBuf>,

    /// Account capital before realized P&L
    #[arg(long, env = "BASE_EQUITY", default_value = "5000000")]
    equity: f64,

    /// Use the in-process paper broker
    #[arg(long)]
    dry_run: bool,

    /// Cash reported by the paper broker
    #[arg(long, default_value = "3000000")]
    paper_cash: f64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile, then serve webhooks until Ctrl+C
    Serve {
        /// Listen address
        #[arg(short, long, env = "BIND_ADDR", default_value = "0.0.0.0:8080")]
        bind: SocketAddr,

        /// Seconds between EOD conditions check and execution
        #[arg(long, default_value = "15")]
        eod_delay: u64,

        /// Seconds between periodic reconciliations
        #[arg(long, default_value = "60")]
        reconcile_interval: u64,

        /// Rebuild diverged positions from the broker automatically
        #[arg(long)]
        auto_resync: bool,
    },

    /// Show positions, suspensions and incomplete sagas
    Status,

    /// List recent operator alerts
    Alerts {
        /// Maximum number of alerts to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: i64,
    },

    /// Reconcile against the broker and rebuild diverged instruments
    Resync {
        /// Rebuild only this instrument, even if it looks in sync
        #[arg(short, long)]
        instrument: Option<String>,
    },

    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let instruments = match &cli.instruments {
        Some(path) => InstrumentBook::from_json_file(path)?,
        None => InstrumentBook::default(),
    };
    let trading_config = TradingConfig {
        base_equity: Decimal::try_from(cli.equity).context("Invalid --equity")?,
        webhook_secret: std::env::var("WEBHOOK_SECRET").ok().filter(|s| !s.is_empty()),
        ..Default::default()
    };
    let base_config = BotConfig {
        database_url: cli.database.clone(),
        dry_run: cli.dry_run,
        paper_cash: Decimal::try_from(cli.paper_cash).context("Invalid --paper-cash")?,
        trading_config,
        instruments,
        ..Default::default()
    };

    match cli.command {
        Commands::Serve {
            bind,
            eod_delay,
            reconcile_interval,
            auto_resync,
        } => {
            let bot_config = BotConfig {
                monitor_config: MonitorConfig {
                    eod_execution_delay_secs: eod_delay,
                    reconcile_interval_secs: reconcile_interval,
                    auto_resync,
                    ..Default::default()
                },
                ..base_config
            };

            info!(
                bind = %bind,
                dry_run = bot_config.dry_run,
                equity = %bot_config.trading_config.base_equity,
                "Starting synthetic futures bridge"
            );

            let bot = Bot::new(bot_config).await?;
            bot.initialize().await?;

            println!("\n=== Synthetic Futures Bridge ===");
            println!("Listening:   http://{}", bind);
            println!("Mode:        {}", if cli.dry_run { "DRY RUN (paper broker)" } else { "LIVE TRADING" });
            println!("Instruments: {}", bot.instruments().names().join(", "));
            println!("\nPress Ctrl+C to stop.\n");

            let store = bot.store().clone();
            let base_equity = bot.base_equity();
            if let Err(e) = Arc::new(bot).run(bind).await {
                tracing::error!(error = %e, "Bot error");
            }

            let status = BotStatus::load(&store, base_equity).await?;
            println!("\n{}", status);
        }

        Commands::Status => {
            let store = PositionStore::new(&cli.database).await?;
            let status = BotStatus::load(&store, base_config.trading_config.base_equity).await?;
            println!("\n{}", status);
        }

        Commands::Alerts { limit } => {
            let store = PositionStore::new(&cli.database).await?;
            let alerts = store.recent_alerts(limit).await?;
            if alerts.is_empty() {
                println!("No alerts recorded.");
                return Ok(());
            }

            println!("\n{:<26} {:<9} {:<12} {:<20} MESSAGE", "TIME", "SEVERITY", "INSTRUMENT", "KIND");
            println!("{}", "-".repeat(100));
            for alert in alerts {
                println!(
                    "{:<26} {:<9} {:<12} {:<20} {}",
                    alert.created_at,
                    alert.severity,
                    alert.instrument.as_deref().unwrap_or("-"),
                    alert.kind,
                    alert.message
                );
            }
        }

        Commands::Resync { instrument } => {
            let bot = Bot::new(base_config).await?;
            let monitor = bot.monitor();

            let targets = match instrument {
                Some(name) => vec![name],
                None => monitor
                    .reconcile_all()
                    .await?
                    .into_iter()
                    .filter(|(_, status)| matches!(status, ReconcileStatus::Diverged { .. }))
                    .map(|(name, _)| name)
                    .collect(),
            };

            if targets.is_empty() {
                println!("All instruments in sync with the broker.");
                return Ok(());
            }

            for name in targets {
                let report = monitor.resync_instrument(&name).await?;
                println!("\n=== {} ===", report.instrument);
                println!("Levels:      {}", report.levels);
                println!("Total lots:  {}", report.total_lots);
                for symbol in &report.adopted {
                    println!("Adopted:     {}", symbol);
                }
                for row in &report.unpaired {
                    println!("Unpaired:    {} qty {}", row.symbol, row.quantity);
                }
                println!(
                    "Suspension:  {}",
                    if report.suspension_cleared { "cleared" } else { "kept" }
                );
            }
        }

        Commands::Config => {
            println!("\n=== Effective Configuration ===\n");
            println!("{}", serde_json::to_string_pretty(&base_config)?);
        }
    }

    Ok(())
}
