//! Process settings, read from flags with environment fallbacks.

use std::time::Duration;

use chrono::TimeDelta;
use clap::Parser;

use relayq_infra::jobs::{SchedulerConfig, TransportConfig};
use relayq_observability::{LogConfig, LogFormat};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("{setting} must be at most {max}")]
    OutOfRange { setting: &'static str, max: u64 },
}

/// Longest stale-claim lease accepted, in seconds (one year).
pub const MAX_STALE_CLAIM_SECONDS: u64 = 365 * 24 * 60 * 60;

/// relayq scheduler: delivers due HTTP callback jobs.
#[derive(Debug, Clone, Parser)]
#[command(name = "relayq-scheduler")]
#[command(about = "Polls for due jobs and delivers their HTTP callbacks")]
#[command(version)]
pub struct SchedulerSettings {
    /// Postgres connection string.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Maximum pooled database connections.
    #[arg(long, env = "RELAYQ_MAX_CONNECTIONS", default_value_t = 5)]
    pub max_connections: u32,

    /// Instance name used in logs.
    #[arg(long, env = "RELAYQ_NAME", default_value = "relayq-scheduler")]
    pub name: String,

    /// Seconds to sleep between polls.
    #[arg(long = "sleep", env = "RELAYQ_SLEEP_SECONDS", default_value_t = 2)]
    pub sleep_seconds: u64,

    /// Jobs dispatched together in one batch.
    #[arg(long, env = "RELAYQ_BATCH_SIZE", default_value_t = 200)]
    pub batch_size: usize,

    /// Jobs claimed per poll.
    #[arg(long, env = "RELAYQ_PAGE_SIZE", default_value_t = 1000)]
    pub page_size: usize,

    /// Requests in flight at once (defaults to the batch size).
    #[arg(long, env = "RELAYQ_CONCURRENCY")]
    pub concurrency: Option<usize>,

    /// Per-request timeout in seconds.
    #[arg(long, env = "RELAYQ_HTTP_TIMEOUT_SECONDS", default_value_t = 30)]
    pub http_timeout_seconds: u64,

    /// Connect timeout in seconds.
    #[arg(long, env = "RELAYQ_CONNECT_TIMEOUT_SECONDS", default_value_t = 10)]
    pub connect_timeout_seconds: u64,

    /// Reclaim jobs whose claim is older than this many seconds. Off when unset.
    #[arg(long, env = "RELAYQ_STALE_CLAIM_SECONDS")]
    pub stale_claim_seconds: Option<u64>,

    /// Log output format: `json` or `pretty`.
    #[arg(long, env = "RELAYQ_LOG_FORMAT", default_value = "json")]
    pub log_format: LogFormat,

    /// Run a single cycle and exit.
    #[arg(long)]
    pub once: bool,

    /// Do not create missing tables on startup.
    #[arg(long, env = "RELAYQ_SKIP_SCHEMA")]
    pub skip_schema: bool,
}

impl SchedulerSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.batch_size == 0 {
            return Err(SettingsError::Zero("batch size"));
        }
        if self.page_size == 0 {
            return Err(SettingsError::Zero("page size"));
        }
        if self.concurrency == Some(0) {
            return Err(SettingsError::Zero("concurrency"));
        }
        if self.http_timeout_seconds == 0 {
            return Err(SettingsError::Zero("http timeout"));
        }
        if self.max_connections == 0 {
            return Err(SettingsError::Zero("max connections"));
        }
        self.stale_claim_after()?;
        Ok(())
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        let mut config = SchedulerConfig::default()
            .with_name(self.name.clone())
            .with_poll_interval(Duration::from_secs(self.sleep_seconds))
            .with_batch_size(self.batch_size)
            .with_page_size(self.page_size)
            .with_request_deadline(Duration::from_secs(self.http_timeout_seconds));
        if let Some(limit) = self.concurrency {
            config = config.with_concurrency_limit(limit);
        }
        config
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig::default()
            .with_request_timeout(Duration::from_secs(self.http_timeout_seconds))
            .with_connect_timeout(Duration::from_secs(self.connect_timeout_seconds))
    }

    /// The stale-claim lease, if one is configured.
    pub fn stale_claim_after(&self) -> Result<Option<TimeDelta>, SettingsError> {
        let Some(secs) = self.stale_claim_seconds else {
            return Ok(None);
        };
        if secs == 0 {
            return Err(SettingsError::Zero("stale claim seconds"));
        }
        let out_of_range = SettingsError::OutOfRange {
            setting: "stale claim seconds",
            max: MAX_STALE_CLAIM_SECONDS,
        };
        if secs > MAX_STALE_CLAIM_SECONDS {
            return Err(out_of_range);
        }
        i64::try_from(secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .map(Some)
            .ok_or(out_of_range)
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig::default().with_format(self.log_format)
    }
}
