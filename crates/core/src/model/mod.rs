//! Entities of the ownership tree: Client → Project → Queue → Job → Output.

pub mod client;
pub mod job;
pub mod output;
pub mod queue;

pub use client::{Client, Project};
pub use job::Job;
pub use output::{Output, ResponseHeaders};
pub use queue::{NewJob, Queue};
