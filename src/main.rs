//! FX Risk Guard
//!
//! Position-risk and order-lifecycle engine for an automated FX trading
//! agent: sizing, stop validation, breakeven and trailing management,
//! portfolio CVaR limits and idempotent order submission.

mod api;
mod bot;
mod db;
mod metrics;
mod models;
mod trading;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::api::{DecisionAdvisor, HttpAdvisor, HttpFeed, MarketFeed, PaperBroker, RestBroker};
use crate::bot::{Agent, AgentOptions};
use crate::db::{AuditLog, Database};
use crate::metrics::MetricsCalculator;
use crate::trading::{calc_cvar, AgentConfig, ConfigHandle, RiskSizer, Verdict};

/// FX trading agent risk engine CLI.
#[derive(Parser)]
#[command(name = "fxguard")]
#[command(about = "Risk-managed order lifecycle for an FX trading agent", long_about = None)]
struct Cli {
    /// Database file path
    #[arg(short, long, env = "FXGUARD_DATABASE", default_value = "sqlite:./fxguard.db?mode=rwc")]
    database: String,

    /// TOML configuration file, watched for changes while running
    #[arg(short, long, env = "FXGUARD_CONFIG")]
    config: Option<PathBuf>,

    /// Log level or filter directive; RUST_LOG is used when absent
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the agent
    Run {
        /// Trade against the in-memory paper broker
        #[arg(long)]
        dry_run: bool,

        /// Starting balance of the paper broker
        #[arg(long, default_value = "10000")]
        paper_balance: f64,

        /// Close open positions on shutdown
        #[arg(long)]
        close_on_exit: bool,
    },

    /// Show the effective configuration
    Config,

    /// Show recent trades and performance
    Status {
        /// Number of trades to list
        #[arg(short = 'n', long, default_value = "20")]
        limit: i64,
    },

    /// Compute CVaR over recorded trades
    Cvar {
        /// Tail fraction, defaults to the configured alpha
        #[arg(short, long)]
        alpha: Option<f64>,

        /// Number of recent closed trades, defaults to the configured lookback
        #[arg(long)]
        lookback: Option<u32>,
    },

    /// Position size for a balance and stop distance
    Size {
        /// Account balance
        #[arg(short, long)]
        balance: f64,

        /// Stop distance in pips
        #[arg(short, long)]
        sl_pips: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let filter = match &cli.log_level {
        Some(level) => EnvFilter::try_new(level).context("Invalid log level")?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = AgentConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            dry_run,
            paper_balance,
            close_on_exit,
        } => {
            info!(
                dry_run = dry_run,
                instruments = config.instruments.len(),
                "Starting FX risk guard"
            );

            let db = Arc::new(Database::new(&cli.database).await?);
            let feed: Arc<dyn MarketFeed> = Arc::new(HttpFeed::from_env()?);
            let advisor: Option<Arc<dyn DecisionAdvisor>> = match HttpAdvisor::from_env() {
                Ok(advisor) => Some(Arc::new(advisor)),
                Err(e) => {
                    warn!("Decision advisor not configured: {}. Managing positions only.", e);
                    None
                }
            };

            let instruments: Vec<String> = config.instruments.iter().map(|i| i.to_string()).collect();
            let handle = ConfigHandle::new(config, cli.config.clone());
            let options = AgentOptions {
                dry_run,
                close_on_shutdown: close_on_exit,
            };

            let mut agent = if dry_run {
                let paper = Arc::new(PaperBroker::new(
                    Decimal::try_from(paper_balance).context("Invalid paper balance")?,
                ));
                Agent::new(handle, paper.clone(), feed, advisor, AuditLog::new(db.clone()), options)
                    .with_paper(paper)
            } else {
                let broker = Arc::new(RestBroker::from_env()?);
                Agent::new(handle, broker, feed, advisor, AuditLog::new(db.clone()), options)
            };

            println!("\n=== FX Risk Guard ===");
            println!("Instruments: {}", instruments.join(", "));
            println!("Mode: {}", if dry_run { "DRY RUN (paper broker)" } else { "LIVE TRADING" });
            println!("\nPress Ctrl+C to stop.\n");

            if let Err(e) = agent.run().await {
                tracing::error!(error = %e, "Agent error");
            }

            let stats = agent.get_stats().await;
            println!("\n{}", stats);
            db.close().await;
        }

        Commands::Config => {
            println!("{}", config.to_toml()?);
        }

        Commands::Status { limit } => {
            let db = Database::new(&cli.database).await?;
            let trades = db.recent_trades(limit).await?;

            if trades.is_empty() {
                println!("No trades recorded yet.");
                return Ok(());
            }

            println!(
                "\n{:<6} {:<9} {:<6} {:>8} {:>10} {:>10} {:<16} {:>10}",
                "KIND", "PAIR", "SIDE", "UNITS", "ENTRY", "EXIT", "REASON", "P&L"
            );
            println!("{}", "-".repeat(84));

            for t in &trades {
                println!(
                    "{:<6} {:<9} {:<6} {:>8} {:>10} {:>10} {:<16} {:>10}",
                    t.kind,
                    t.instrument,
                    t.side,
                    t.units,
                    t.entry_price,
                    t.exit_price.as_deref().unwrap_or("-"),
                    t.exit_reason.as_deref().unwrap_or("-"),
                    t.realized_pnl.map(|p| format!("{:.2}", p)).unwrap_or_else(|| "-".to_string())
                );
            }

            let mut pnls = db
                .recent_realized_pnl(i64::from(config.portfolio.lookback_trades))
                .await?;
            pnls.reverse();
            let summary = MetricsCalculator::calculate(&pnls, config.portfolio.alpha);

            println!("\n=== Performance (last {} closes) ===", pnls.len());
            println!("{}", summary);
            println!("Equity Drawdown: {:.2}%", db.calculate_max_drawdown().await? * 100.0);
        }

        Commands::Cvar { alpha, lookback } => {
            let alpha = alpha.unwrap_or(config.portfolio.alpha);
            let lookback = lookback.unwrap_or(config.portfolio.lookback_trades);

            let db = Database::new(&cli.database).await?;
            let pnls = db.recent_realized_pnl(i64::from(lookback)).await?;
            let cvar = calc_cvar(&pnls, alpha)?;

            println!("CVaR({:.3}) over {} trades: {:.2}", alpha, pnls.len(), cvar);
            println!("Budget:   {:.2}", config.portfolio.max_cvar);
            println!(
                "Breached: {}",
                if cvar.abs() >= config.portfolio.max_cvar { "Yes" } else { "No" }
            );
        }

        Commands::Size { balance, sl_pips } => {
            let sizer = RiskSizer::new(config.sizing.clone());

            println!("Balance:   {:.2}", balance);
            println!("Risk:      {:.2}%", config.sizing.risk_pct * 100.0);
            println!("Stop:      {:.1} pips", sl_pips);

            match sizer.entry_units(balance, sl_pips, None)? {
                Verdict::Act(units) => println!(
                    "Units:     {} ({:.2} lots)",
                    units,
                    units as f64 / config.sizing.units_per_lot as f64
                ),
                Verdict::Skip(reason) => println!("No trade:  {}", reason),
            }
        }
    }

    Ok(())
}
