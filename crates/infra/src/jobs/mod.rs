//! Delayed-delivery engine.
//!
//! ## Design
//!
//! - Jobs are claimed exclusively (`is_processing`) in the same transaction that
//!   selects them, so two schedulers never deliver the same job concurrently
//! - Claimed jobs are delivered in fixed-size batches; requests within a batch
//!   run concurrently (bounded) and the batch waits for all of them to settle
//! - Every delivery attempt yields exactly one immutable `Output`
//! - Failed attempts are rescheduled `retry_delay` seconds later until the
//!   retry budget is spent; only HTTP 200 counts as success
//! - Claims are always released at the end of a cycle, whatever happened
//!
//! ## Components
//!
//! - `TaskStore`: claim / persist / release boundary (in-memory or Postgres)
//! - `compose`: job → outbound request definition
//! - `BatchDispatcher`: concurrent delivery through a `Transport`
//! - `reconcile`: outcome → updated job + output
//! - `Scheduler`: the poll → deliver → persist → release → sleep loop

pub mod compose;
pub mod dispatcher;
pub mod postgres;
pub mod reconcile;
pub mod scheduler;
pub mod schema;
pub mod store;

pub use compose::{RequestSpec, compose};
pub use dispatcher::{
    BatchDispatcher, HttpResponse, Outcome, ReqwestTransport, Transport, TransportConfig,
    TransportError,
};
pub use postgres::PostgresTaskStore;
pub use reconcile::{Reconciled, reconcile};
pub use scheduler::{
    CycleReport, Scheduler, SchedulerConfig, SchedulerError, SchedulerHandle, SchedulerStats,
};
pub use schema::ensure_schema;
pub use store::{InMemoryTaskStore, PersistSummary, TaskStore, TaskStoreError};
