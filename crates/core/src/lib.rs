//! `relayq-core`: domain foundation for the delayed-delivery job queue.
//!
//! This crate contains **pure domain** types (no infrastructure concerns): the
//! Client → Project → Queue → Job → Output hierarchy, identifiers, the HTTP verb
//! a callback is delivered with, and the clock the engine reads time from.

pub mod clock;
pub mod entity;
pub mod error;
pub mod http;
pub mod id;
pub mod model;

pub use clock::{Clock, ManualClock, SystemClock};
pub use entity::{BelongsTo, Entity};
pub use error::{DomainError, DomainResult};
pub use http::HttpVerb;
pub use id::{ClientId, Code, JobId, OutputId, ProjectId, QueueId};
pub use model::{Client, Job, NewJob, Output, Project, Queue, ResponseHeaders};
