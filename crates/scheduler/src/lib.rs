//! relayq scheduler process: wiring between settings, Postgres and the engine.

pub mod config;

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use relayq_infra::jobs::{PostgresTaskStore, ReqwestTransport, Scheduler, ensure_schema};

pub use config::{MAX_STALE_CLAIM_SECONDS, SchedulerSettings, SettingsError};

/// Run the scheduler until `shutdown` resolves (or for one cycle with `--once`).
pub async fn run(settings: SchedulerSettings, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
    settings.validate()?;

    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .connect(&settings.database_url)
        .await
        .context("failed to connect to Postgres")?;

    if !settings.skip_schema {
        ensure_schema(&pool).await.context("failed to prepare schema")?;
    }

    let mut store = PostgresTaskStore::new(pool);
    if let Some(after) = settings.stale_claim_after()? {
        store = store.with_stale_claim_after(after);
    }

    let transport = ReqwestTransport::new(settings.transport_config())
        .context("failed to build HTTP client")?;
    let scheduler = Scheduler::new(store, Arc::new(transport), settings.scheduler_config());

    if settings.once {
        let report = scheduler.run_cycle().await?;
        info!(
            scheduler = %settings.name,
            claimed = report.claimed,
            succeeded = report.succeeded,
            failed = report.failed,
            released = report.released,
            "single cycle complete"
        );
        return Ok(());
    }

    let handle = scheduler.spawn();
    shutdown.await;
    info!(scheduler = %settings.name, "shutdown requested");

    let stats = handle.shutdown().await;
    info!(
        scheduler = %settings.name,
        cycles = stats.cycles,
        jobs_processed = stats.jobs_processed,
        jobs_succeeded = stats.jobs_succeeded,
        jobs_failed = stats.jobs_failed,
        jobs_exhausted = stats.jobs_exhausted,
        uptime_secs = stats.uptime_secs,
        "scheduler exited"
    );
    Ok(())
}
