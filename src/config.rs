use chrono::FixedOffset;
use clap::Parser;
use std::time::Duration;

use crate::engine::{FanoutSettings, MonthDay, SubscriptionSettings, TrackerSettings};

/// Live fixture tracker: aggregates club fixtures for a day and follows
/// their scores
#[derive(Parser, Debug, Clone)]
#[command(name = "fixture-tracker", version, about)]
pub struct Config {
    /// Dashboard listen address
    #[arg(long, env = "DASHBOARD_ADDR", default_value = "0.0.0.0:8080")]
    pub dashboard_addr: String,

    /// SQLite database path
    #[arg(long, env = "DATABASE_PATH", default_value = "fixtures.db")]
    pub database_path: String,

    /// Maximum concurrent repository calls per aggregation pass
    #[arg(long, env = "FANOUT_WORKERS", default_value = "4")]
    pub fanout_workers: usize,

    /// Timeout for a single repository call in milliseconds
    #[arg(long, env = "REPOSITORY_TIMEOUT_MS", default_value = "5000")]
    pub repository_timeout_ms: u64,

    /// Window over which bursts of score changes are coalesced
    #[arg(long, env = "DEBOUNCE_MS", default_value = "500")]
    pub debounce_ms: u64,

    /// Change events remembered per subscription for duplicate suppression
    #[arg(long, env = "DEDUP_CAPACITY", default_value = "1024")]
    pub dedup_capacity: usize,

    /// Consecutive failed subscribe attempts before a subscription gives up
    #[arg(long, env = "MAX_RETRIES", default_value = "5")]
    pub max_retries: u32,

    /// First retry delay in milliseconds (doubles per attempt)
    #[arg(long, env = "RETRY_BASE_MS", default_value = "500")]
    pub retry_base_ms: u64,

    /// Upper bound on the retry delay in milliseconds
    #[arg(long, env = "RETRY_MAX_MS", default_value = "30000")]
    pub retry_max_ms: u64,

    /// How often the SQLite store is polled for new scores
    #[arg(long, env = "WATCH_POLL_MS", default_value = "1000")]
    pub watch_poll_ms: u64,

    /// Offset from UTC, in minutes, used to place fixture instants on a calendar day
    #[arg(long, env = "UTC_OFFSET_MINUTES", default_value = "0", allow_hyphen_values = true)]
    pub utc_offset_minutes: i32,

    /// Load the demo fixtures into the database on startup
    #[arg(long, env = "SEED_DEMO", default_value = "false")]
    pub seed_demo: bool,

    /// Print one aggregation as JSON and exit
    #[arg(long, env = "ONCE", default_value = "false")]
    pub once: bool,

    /// Day to aggregate with --once, "MM-DD" or "YYYY-MM-DD" (defaults to today)
    #[arg(long, env = "TARGET_DATE")]
    pub date: Option<String>,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.fanout_workers == 0 {
            anyhow::bail!("fanout_workers must be at least 1");
        }
        if self.repository_timeout_ms == 0 {
            anyhow::bail!("repository_timeout_ms must be positive");
        }
        if self.dedup_capacity == 0 {
            anyhow::bail!("dedup_capacity must be at least 1");
        }
        if self.retry_base_ms == 0 || self.retry_max_ms < self.retry_base_ms {
            anyhow::bail!("retry delays must satisfy 0 < retry_base_ms <= retry_max_ms");
        }
        if self.watch_poll_ms == 0 {
            anyhow::bail!("watch_poll_ms must be positive");
        }
        if self.utc_offset().is_none() {
            anyhow::bail!("utc_offset_minutes must be within ±24h");
        }
        if let Some(date) = &self.date {
            date.parse::<MonthDay>()
                .map_err(|e| anyhow::anyhow!("invalid --date: {}", e))?;
        }
        Ok(())
    }

    pub fn utc_offset(&self) -> Option<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_minutes.checked_mul(60)?)
    }

    pub fn watch_poll(&self) -> Duration {
        Duration::from_millis(self.watch_poll_ms)
    }

    pub fn tracker_settings(&self) -> TrackerSettings {
        let zone = self.utc_offset().unwrap_or_else(|| FanoutSettings::default().zone);
        TrackerSettings {
            fanout: FanoutSettings {
                workers: self.fanout_workers,
                call_timeout: Duration::from_millis(self.repository_timeout_ms),
                zone,
            },
            subscription: SubscriptionSettings {
                debounce: Duration::from_millis(self.debounce_ms),
                dedup_capacity: self.dedup_capacity,
                max_retries: self.max_retries,
                retry_base: Duration::from_millis(self.retry_base_ms),
                retry_max: Duration::from_millis(self.retry_max_ms),
            },
        }
    }
}
