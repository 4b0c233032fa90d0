//! Infrastructure layer: task storage, outbound delivery and the scheduler loop.

pub mod jobs;

#[cfg(test)]
mod integration_tests;
