//! CrabSim - Multi-Asset Paper Trading Simulator
//!
//! Binary entrypoint: loads config, opens the ledger store, and keeps the
//! mark-to-market refresh loop running until shutdown. The HTTP surface
//! mounts on top of the library; this process is the accounting core.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crabsim_backend::feed::http::HttpMarketDataFeed;
use crabsim_backend::{Config, LedgerService};

#[derive(Parser, Debug)]
#[command(name = "crabsim", about = "Paper-trading ledger service")]
struct Args {
    /// Override the state database path.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Override the mark-to-market refresh interval in seconds.
    #[arg(long)]
    refresh_secs: Option<u64>,

    /// Run one forced mark-to-market refresh and exit.
    #[arg(long)]
    refresh_once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = Config::from_env();
    if let Some(db) = args.db {
        config.state_db = db;
    }
    if let Some(secs) = args.refresh_secs {
        config.mark_to_market_refresh_secs = secs;
    }

    info!(db = %config.state_db.display(), "starting crabsim ledger service");
    let feed = HttpMarketDataFeed::new(config.feed.clone());
    let ledger = Arc::new(LedgerService::open(config)?);

    let leaderboard = ledger.leaderboard(true);
    info!(accounts = leaderboard.len(), "ledger ready");

    if args.refresh_once {
        let changed = ledger.refresh_mark_to_market(&feed, true).await;
        info!(changed, "mark-to-market refresh complete");
        return Ok(());
    }

    let refresh_secs = ledger.config().mark_to_market_refresh_secs;
    let mut ticker = interval(Duration::from_secs(refresh_secs.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let changed = ledger.refresh_mark_to_market(&feed, false).await;
                if changed {
                    info!("mark-to-market refresh applied updates");
                }
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "ctrl-c handler failed");
                }
                info!("shutting down");
                break;
            }
        }
    }

    Ok(())
}
