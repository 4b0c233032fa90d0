//! The polling loop that drives delivery.
//!
//! One cycle is `claim -> compose -> dispatch -> reconcile -> persist` per
//! batch, followed by an unconditional release of every claimed job and a
//! cancellable sleep. Cycles never overlap. Claims whose release failed are
//! kept and released again before the next poll.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use relayq_core::{Clock, Code, Job, SystemClock};

use super::compose::compose;
use super::dispatcher::{BatchDispatcher, Transport};
use super::reconcile::{Reconciled, reconcile};
use super::store::{TaskStore, TaskStoreError};

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Name for logging
    pub name: String,
    /// Sleep between cycles
    pub poll_interval: Duration,
    /// Jobs dispatched together
    pub batch_size: usize,
    /// Jobs claimed per cycle
    pub page_size: usize,
    /// Requests in flight at once; `None` means `batch_size`
    pub concurrency_limit: Option<usize>,
    /// Upper bound on a single callback request
    pub request_deadline: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: "relayq-scheduler".to_string(),
            poll_interval: Duration::from_secs(2),
            batch_size: 200,
            page_size: 1000,
            concurrency_limit: None,
            request_deadline: Duration::from_secs(30),
        }
    }
}

impl SchedulerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size;
        self
    }

    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    pub fn with_request_deadline(mut self, deadline: Duration) -> Self {
        self.request_deadline = deadline;
        self
    }

    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.max(1)
    }

    pub fn effective_concurrency(&self) -> usize {
        self.concurrency_limit
            .unwrap_or(self.batch_size)
            .clamp(1, self.effective_batch_size())
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct CycleReport {
    pub claimed: usize,
    /// Claimed but had no attempts left.
    pub skipped: usize,
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Subset of `failed` that used the last attempt.
    pub exhausted: usize,
    pub persisted_jobs: u64,
    pub written_outputs: u64,
    pub released: u64,
    /// Claims left over from an earlier failed release, released this cycle.
    pub released_late: u64,
    pub persist_errors: usize,
}

/// Scheduler runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct SchedulerStats {
    pub cycles: u64,
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_exhausted: u64,
    pub jobs_skipped: u64,
    pub claim_errors: u64,
    pub persist_errors: u64,
    pub release_errors: u64,
    pub uptime_secs: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("failed to claim due jobs: {0}")]
    Claim(#[source] TaskStoreError),
    #[error("failed to release {count} claim(s): {source}")]
    Release {
        count: usize,
        #[source]
        source: TaskStoreError,
    },
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Background delivery scheduler.
pub struct Scheduler<S, T> {
    store: S,
    dispatcher: BatchDispatcher<T>,
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    stats: Arc<Mutex<SchedulerStats>>,
    /// Claimed jobs whose release failed; retried before the next poll.
    unreleased: Mutex<Vec<Job>>,
    started: Instant,
}

impl<S: TaskStore, T: Transport> Scheduler<S, T> {
    pub fn new(store: S, transport: Arc<T>, config: SchedulerConfig) -> Self {
        let dispatcher = BatchDispatcher::new(transport, config.effective_concurrency())
            .with_deadline(config.request_deadline);
        Self {
            store,
            dispatcher,
            config,
            clock: Arc::new(SystemClock),
            stats: Arc::new(Mutex::new(SchedulerStats::default())),
            unreleased: Mutex::new(Vec::new()),
            started: Instant::now(),
        }
    }

    /// Clock used to stamp attempt completion times.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn stats(&self) -> SchedulerStats {
        let mut stats = lock(&self.stats).clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }

    /// Number of claims still waiting for a successful release.
    pub fn pending_releases(&self) -> usize {
        lock(&self.unreleased).len()
    }

    /// Run one full cycle.
    ///
    /// A claim failure aborts the cycle before anything is dispatched. Once
    /// jobs are claimed, every one of them is released regardless of what
    /// happened to its delivery or to persistence. If that release fails the
    /// jobs are kept and released at the start of a later cycle.
    pub async fn run_cycle(&self) -> Result<CycleReport, SchedulerError> {
        let released_late = self.release_leftovers().await;

        let claimed = match self.store.claim_due_jobs(self.config.page_size, 0).await {
            Ok(jobs) => jobs,
            Err(e) => {
                lock(&self.stats).claim_errors += 1;
                return Err(SchedulerError::Claim(e));
            }
        };

        let mut report = CycleReport {
            claimed: claimed.len(),
            released_late,
            ..CycleReport::default()
        };
        if claimed.is_empty() {
            lock(&self.stats).cycles += 1;
            return Ok(report);
        }

        debug!(scheduler = %self.config.name, claimed = claimed.len(), "claimed due jobs");

        for batch in claimed.chunks(self.config.effective_batch_size()) {
            self.process_batch(batch, &mut report).await;
        }

        self.record(&report);

        match self.store.release_claims(&claimed).await {
            Ok(released) => {
                report.released = released;
                Ok(report)
            }
            Err(source) => {
                lock(&self.stats).release_errors += 1;
                lock(&self.unreleased).extend(claimed.iter().cloned());
                Err(SchedulerError::Release {
                    count: claimed.len(),
                    source,
                })
            }
        }
    }

    /// Retry releases that failed in earlier cycles. Returns how many were
    /// released; on failure the jobs stay queued for the next attempt.
    async fn release_leftovers(&self) -> u64 {
        let leftovers = std::mem::take(&mut *lock(&self.unreleased));
        if leftovers.is_empty() {
            return 0;
        }

        match self.store.release_claims(&leftovers).await {
            Ok(released) => {
                info!(
                    scheduler = %self.config.name,
                    jobs = leftovers.len(),
                    released,
                    "released claims left over from a failed release"
                );
                released
            }
            Err(e) => {
                lock(&self.stats).release_errors += 1;
                warn!(
                    scheduler = %self.config.name,
                    jobs = leftovers.len(),
                    error = %e,
                    "retrying leftover releases failed"
                );
                lock(&self.unreleased).extend(leftovers);
                0
            }
        }
    }

    async fn process_batch(&self, batch: &[Job], report: &mut CycleReport) {
        let mut pending: HashMap<Code, Job> = HashMap::with_capacity(batch.len());
        let mut requests = Vec::with_capacity(batch.len());

        for job in batch {
            if !job.has_budget() {
                debug!(
                    scheduler = %self.config.name,
                    job_code = %job.code,
                    tried_counts = job.tried_counts,
                    retries = job.retries,
                    "no attempts left, skipping"
                );
                report.skipped += 1;
                continue;
            }
            requests.push((job.code.clone(), compose(job)));
            pending.insert(job.code.clone(), job.clone());
        }

        if requests.is_empty() {
            return;
        }
        report.dispatched += requests.len();

        let outcomes = self.dispatcher.dispatch(requests).await;
        let completed_at = self.clock.now();

        let mut jobs = Vec::with_capacity(outcomes.len());
        let mut outputs = Vec::with_capacity(outcomes.len());
        for (code, outcome) in outcomes {
            let Some(job) = pending.remove(&code) else {
                warn!(scheduler = %self.config.name, job_code = %code, "outcome for unknown job");
                continue;
            };
            let Reconciled { job, output } = reconcile(job, &outcome, completed_at);

            if job.is_successful {
                report.succeeded += 1;
            } else {
                report.failed += 1;
                if job.is_exhausted() {
                    report.exhausted += 1;
                    info!(
                        scheduler = %self.config.name,
                        job_code = %job.code,
                        tried_counts = job.tried_counts,
                        status_code = output.status_code,
                        "job exhausted"
                    );
                }
            }
            jobs.push(job);
            outputs.push(output);
        }

        match self.store.persist_outcomes(&jobs, &outputs).await {
            Ok(summary) => {
                report.persisted_jobs += summary.jobs_updated;
                report.written_outputs += summary.outputs_written;
            }
            Err(e) => {
                report.persist_errors += 1;
                error!(
                    scheduler = %self.config.name,
                    jobs = jobs.len(),
                    error = %e,
                    "failed to persist delivery outcomes"
                );
            }
        }
    }

    fn record(&self, report: &CycleReport) {
        let mut stats = lock(&self.stats);
        stats.cycles += 1;
        stats.jobs_processed += report.dispatched as u64;
        stats.jobs_succeeded += report.succeeded as u64;
        stats.jobs_failed += report.failed as u64;
        stats.jobs_exhausted += report.exhausted as u64;
        stats.jobs_skipped += report.skipped as u64;
        stats.persist_errors += report.persist_errors as u64;
    }

    /// Loop cycles until `cancel` fires.
    ///
    /// Cancellation is observed before each poll and during the sleep; a cycle
    /// in progress always runs to its release step.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            scheduler = %self.config.name,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.effective_batch_size(),
            page_size = self.config.page_size,
            concurrency = self.dispatcher.concurrency_limit(),
            "scheduler started"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.run_cycle().await {
                Ok(report) if report.claimed > 0 => {
                    info!(
                        scheduler = %self.config.name,
                        claimed = report.claimed,
                        dispatched = report.dispatched,
                        succeeded = report.succeeded,
                        failed = report.failed,
                        exhausted = report.exhausted,
                        skipped = report.skipped,
                        released = report.released,
                        "job(s) processed"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    error!(scheduler = %self.config.name, error = %e, "cycle aborted");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!(scheduler = %self.config.name, "scheduler stopped");
    }

    /// Spawn the loop onto the current tokio runtime.
    pub fn spawn(self) -> SchedulerHandle
    where
        S: 'static,
        T: 'static,
    {
        let cancel = CancellationToken::new();
        let stats = self.stats.clone();
        let started = self.started;
        let token = cancel.clone();
        let join = tokio::spawn(async move { self.run(token).await });

        SchedulerHandle {
            cancel,
            join,
            stats,
            unreleased: Mutex::new(Vec::new()),
            started,
        }
    }
}

/// Handle to control a running scheduler.
#[derive(Debug)]
pub struct SchedulerHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
    stats: Arc<Mutex<SchedulerStats>>,
    /// Claimed jobs whose release failed; retried before the next poll.
    unreleased: Mutex<Vec<Job>>,
    started: Instant,
}

impl SchedulerHandle {
    /// Get current scheduler statistics.
    pub fn stats(&self) -> SchedulerStats {
        let mut stats = lock(&self.stats).clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }

    /// Token that stops the loop when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Request graceful shutdown, wait for the loop to exit and return the
    /// final statistics, including the cycle that was in flight.
    pub async fn shutdown(self) -> SchedulerStats {
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            error!(error = %e, "scheduler task failed");
        }
        let mut stats = lock(&self.stats).clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}
