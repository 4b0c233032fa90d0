//! Applying a delivery outcome to job state.

use chrono::{DateTime, Utc};

use relayq_core::{Code, Job, Output, OutputId, ResponseHeaders};

use super::dispatcher::Outcome;

/// The updated job plus the output that records the attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub job: Job,
    pub output: Output,
}

/// Fold one attempt's `outcome` into `job`, as of completion time `now`.
///
/// Pure: every attempt yields exactly one [`Output`] and nothing is written.
pub fn reconcile(mut job: Job, outcome: &Outcome, now: DateTime<Utc>) -> Reconciled {
    job.record_attempt(outcome.status_code(), now);

    let (content, headers, status_code, status_message) = match outcome {
        Outcome::Response(response) => (
            response.body.clone(),
            response.headers.clone(),
            response.status_code,
            response.status_message.clone(),
        ),
        Outcome::TransportError {
            status_code,
            status_message,
        } => (
            status_message.clone(),
            ResponseHeaders::new(),
            *status_code,
            status_message.clone(),
        ),
    };

    let output = Output {
        id: OutputId::new(),
        code: Code::generate(),
        job_id: job.id,
        job_code: job.code.clone(),
        content,
        headers,
        status_code,
        status_message,
        created_at: now,
    };

    Reconciled { job, output }
}
