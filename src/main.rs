use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

use fixture_tracker::config::Config;
use fixture_tracker::dashboard::{self, AppState};
use fixture_tracker::db::Database;
use fixture_tracker::engine::{MonthDay, RegionGroup, Tracker};
use fixture_tracker::error::PartialFailure;

#[derive(Serialize)]
struct OnceOutput {
    target: MonthDay,
    regions: Vec<RegionGroup>,
    partial_failure: Option<PartialFailure>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;
    let zone = config
        .utc_offset()
        .context("utc_offset_minutes out of range")?;

    // Open database
    let db = Database::open(&config.database_path)?.with_watch_poll(config.watch_poll());
    info!("Database opened: {}", config.database_path);

    if config.seed_demo {
        db.seed_demo()?;
    }

    let tracker = Tracker::new(Arc::new(db.clone()), config.tracker_settings());

    if config.once {
        let target = match config.date.as_deref() {
            Some(raw) => raw.parse::<MonthDay>().map_err(|e| anyhow::anyhow!(e))?,
            None => dashboard::today(zone),
        };
        let (view, partial_failure) = tracker.aggregate_once(target).await?;
        if let Some(pf) = &partial_failure {
            warn!("Aggregation for {} is incomplete: {}", target, pf);
        }
        let out = OnceOutput {
            target,
            regions: view.regions,
            partial_failure,
        };
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    // Start the dashboard HTTP server
    let app = dashboard::router(AppState { db, tracker, zone });
    let addr: SocketAddr = config.dashboard_addr.parse()?;
    info!("Dashboard listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Run dashboard server (blocks until shutdown)
    axum::serve(listener, app).await?;

    Ok(())
}
