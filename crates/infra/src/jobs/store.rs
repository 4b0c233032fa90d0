//! Task storage: the claim / persist / release boundary of the engine.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Duration;

use relayq_core::{Clock, Code, Job, Output, SystemClock};

/// Task store abstraction.
///
/// `claim_due_jobs` is the one shared-mutable-state boundary between scheduler
/// processes: selecting and marking jobs as claimed must be a single atomic,
/// exclusive step.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new job.
    async fn enqueue(&self, job: Job) -> Result<Code, TaskStoreError>;

    /// Get a job by its external code.
    async fn get_job(&self, code: &Code) -> Result<Option<Job>, TaskStoreError>;

    /// All outputs of a job, oldest first.
    async fn list_outputs(&self, job_code: &Code) -> Result<Vec<Output>, TaskStoreError>;

    /// Atomically select up to `limit` eligible jobs (skipping `offset`) and
    /// mark them as claimed. All-or-nothing: on error nothing is claimed.
    async fn claim_due_jobs(&self, limit: usize, offset: usize) -> Result<Vec<Job>, TaskStoreError>;

    /// Write post-attempt counters (`tried_counts`, `is_executed`,
    /// `is_successful`, `next_execution`). Never touches the claim flag.
    /// A job whose stored `claimed_at` no longer matches the given copy was
    /// reclaimed by another worker and is left alone. Returns the number of
    /// jobs updated.
    async fn persist_job_updates(&self, jobs: &[Job]) -> Result<u64, TaskStoreError>;

    /// Insert new outputs.
    async fn write_outputs(&self, outputs: &[Output]) -> Result<(), TaskStoreError>;

    /// Write outputs and job updates together, in one transaction.
    async fn persist_outcomes(
        &self,
        jobs: &[Job],
        outputs: &[Output],
    ) -> Result<PersistSummary, TaskStoreError>;

    /// Clear the claim flag on the given jobs, but only where the claim is
    /// still the one the caller took. Returns the number released.
    async fn release_claims(&self, jobs: &[Job]) -> Result<u64, TaskStoreError>;
}

/// Task store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskStoreError {
    #[error("job not found: {0}")]
    NotFound(Code),
    #[error("already exists: {0}")]
    AlreadyExists(Code),
    #[error("transaction error: {0}")]
    Transaction(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// What a `persist_outcomes` call wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct PersistSummary {
    pub jobs_updated: u64,
    pub outputs_written: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    jobs: HashMap<Code, Job>,
    /// Insertion order; claims walk jobs in this order.
    order: Vec<Code>,
    outputs: Vec<Output>,
}

/// In-memory task store for tests/dev.
///
/// Claims happen under the write lock, which makes them exclusive across
/// every caller sharing the store.
#[derive(Debug)]
pub struct InMemoryTaskStore {
    state: RwLock<MemoryState>,
    clock: Arc<dyn Clock>,
    stale_claim_after: Option<Duration>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            clock,
            stale_claim_after: None,
        }
    }

    /// Treat claims older than `after` as abandoned.
    pub fn with_stale_claim_after(mut self, after: Duration) -> Self {
        self.stale_claim_after = Some(after);
        self
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Snapshot of every job, in insertion order.
    pub fn jobs(&self) -> Result<Vec<Job>, TaskStoreError> {
        let state = self.read()?;
        Ok(state
            .order
            .iter()
            .filter_map(|code| state.jobs.get(code).cloned())
            .collect())
    }

    /// Number of outputs written so far.
    pub fn output_count(&self) -> Result<usize, TaskStoreError> {
        Ok(self.read()?.outputs.len())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryState>, TaskStoreError> {
        self.state
            .read()
            .map_err(|_| TaskStoreError::Storage("in-memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryState>, TaskStoreError> {
        self.state
            .write()
            .map_err(|_| TaskStoreError::Storage("in-memory store lock poisoned".to_string()))
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_job_updates(state: &mut MemoryState, jobs: &[Job]) -> u64 {
    let mut updated = 0;
    for job in jobs {
        if let Some(stored) = state
            .jobs
            .get_mut(&job.code)
            .filter(|stored| stored.claimed_at == job.claimed_at)
        {
            stored.tried_counts = job.tried_counts;
            stored.is_executed = job.is_executed;
            stored.is_successful = job.is_successful;
            stored.next_execution = job.next_execution;
            stored.updated_at = job.updated_at;
            updated += 1;
        }
    }
    updated
}

fn check_new_outputs(state: &MemoryState, outputs: &[Output]) -> Result<(), TaskStoreError> {
    for output in outputs {
        if !state.jobs.contains_key(&output.job_code) {
            return Err(TaskStoreError::NotFound(output.job_code.clone()));
        }
        if state.outputs.iter().any(|o| o.code == output.code) {
            return Err(TaskStoreError::AlreadyExists(output.code.clone()));
        }
    }
    Ok(())
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn enqueue(&self, job: Job) -> Result<Code, TaskStoreError> {
        let mut state = self.write()?;
        if state.jobs.contains_key(&job.code) {
            return Err(TaskStoreError::AlreadyExists(job.code));
        }
        let code = job.code.clone();
        state.order.push(code.clone());
        state.jobs.insert(code.clone(), job);
        Ok(code)
    }

    async fn get_job(&self, code: &Code) -> Result<Option<Job>, TaskStoreError> {
        Ok(self.read()?.jobs.get(code).cloned())
    }

    async fn list_outputs(&self, job_code: &Code) -> Result<Vec<Output>, TaskStoreError> {
        let state = self.read()?;
        Ok(state
            .outputs
            .iter()
            .filter(|o| &o.job_code == job_code)
            .cloned()
            .collect())
    }

    async fn claim_due_jobs(&self, limit: usize, offset: usize) -> Result<Vec<Job>, TaskStoreError> {
        let mut state = self.write()?;
        let now = self.clock.now();

        let selected: Vec<Code> = state
            .order
            .iter()
            .filter(|code| {
                state
                    .jobs
                    .get(*code)
                    .is_some_and(|j| j.is_claimable(now, self.stale_claim_after))
            })
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();

        let mut claimed = Vec::with_capacity(selected.len());
        for code in selected {
            if let Some(job) = state.jobs.get_mut(&code) {
                job.claim(now);
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn persist_job_updates(&self, jobs: &[Job]) -> Result<u64, TaskStoreError> {
        let mut state = self.write()?;
        Ok(apply_job_updates(&mut state, jobs))
    }

    async fn write_outputs(&self, outputs: &[Output]) -> Result<(), TaskStoreError> {
        let mut state = self.write()?;
        check_new_outputs(&state, outputs)?;
        state.outputs.extend_from_slice(outputs);
        Ok(())
    }

    async fn persist_outcomes(
        &self,
        jobs: &[Job],
        outputs: &[Output],
    ) -> Result<PersistSummary, TaskStoreError> {
        let mut state = self.write()?;
        // Validate before mutating anything so a rejected batch leaves no trace.
        check_new_outputs(&state, outputs)?;
        state.outputs.extend_from_slice(outputs);
        let jobs_updated = apply_job_updates(&mut state, jobs);
        Ok(PersistSummary {
            jobs_updated,
            outputs_written: outputs.len() as u64,
        })
    }

    async fn release_claims(&self, jobs: &[Job]) -> Result<u64, TaskStoreError> {
        let mut state = self.write()?;
        let now = self.clock.now();
        let mut released = 0;
        for job in jobs {
            if let Some(stored) = state
                .jobs
                .get_mut(&job.code)
                .filter(|stored| stored.is_claim_held_by(job))
            {
                stored.release(now);
                released += 1;
            }
        }
        Ok(released)
    }
}

#[async_trait]
impl<S: TaskStore + ?Sized> TaskStore for Arc<S> {
    async fn enqueue(&self, job: Job) -> Result<Code, TaskStoreError> {
        (**self).enqueue(job).await
    }

    async fn get_job(&self, code: &Code) -> Result<Option<Job>, TaskStoreError> {
        (**self).get_job(code).await
    }

    async fn list_outputs(&self, job_code: &Code) -> Result<Vec<Output>, TaskStoreError> {
        (**self).list_outputs(job_code).await
    }

    async fn claim_due_jobs(&self, limit: usize, offset: usize) -> Result<Vec<Job>, TaskStoreError> {
        (**self).claim_due_jobs(limit, offset).await
    }

    async fn persist_job_updates(&self, jobs: &[Job]) -> Result<u64, TaskStoreError> {
        (**self).persist_job_updates(jobs).await
    }

    async fn write_outputs(&self, outputs: &[Output]) -> Result<(), TaskStoreError> {
        (**self).write_outputs(outputs).await
    }

    async fn persist_outcomes(
        &self,
        jobs: &[Job],
        outputs: &[Output],
    ) -> Result<PersistSummary, TaskStoreError> {
        (**self).persist_outcomes(jobs, outputs).await
    }

    async fn release_claims(&self, jobs: &[Job]) -> Result<u64, TaskStoreError> {
        (**self).release_claims(jobs).await
    }
}
