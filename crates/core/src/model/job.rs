//! The unit of work: a callback to deliver at or after a scheduled time.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{BelongsTo, Entity};
use crate::http::HttpVerb;
use crate::id::{Code, JobId, QueueId};

use super::output::Output;

/// A delayed HTTP callback with a bounded retry budget.
///
/// `retries` is the maximum number of attempts, inclusive of the first one.
/// `is_processing` is the claim flag; `claimed_at` stamps when the claim was
/// taken so stale claims can be recognised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub code: Code,
    pub queue_id: QueueId,
    pub title: String,
    pub description: Option<String>,
    /// Opaque value forwarded verbatim to the callback.
    pub payload: serde_json::Value,
    pub callback_url: String,
    pub http_verb: HttpVerb,
    pub headers: BTreeMap<String, String>,
    /// Seconds from creation to first eligible execution.
    pub delay: u32,
    pub retries: u32,
    /// Seconds to wait after a failed attempt.
    pub retry_delay: u32,
    pub tried_counts: u32,
    pub next_execution: DateTime<Utc>,
    pub is_executed: bool,
    pub is_successful: bool,
    pub is_processing: bool,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Lower bound the API layer enforces on `retries`.
    pub const MIN_RETRIES: u32 = 1;
    /// Upper bound the API layer enforces on `retries`.
    pub const MAX_RETRIES: u32 = 10;
    /// The only status code that counts as a successful delivery.
    pub const SUCCESS_STATUS: u16 = 200;

    /// Create a job with a single attempt, no delay and an empty payload.
    pub fn new(
        queue_id: QueueId,
        title: impl Into<String>,
        callback_url: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            code: Code::generate(),
            queue_id,
            title: title.into(),
            description: None,
            payload: serde_json::Value::Null,
            callback_url: callback_url.into(),
            http_verb: HttpVerb::Get,
            headers: BTreeMap::new(),
            delay: 0,
            retries: Self::MIN_RETRIES,
            retry_delay: 0,
            tried_counts: 0,
            next_execution: now,
            is_executed: false,
            is_successful: false,
            is_processing: false,
            claimed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_verb(mut self, verb: HttpVerb) -> Self {
        self.http_verb = verb;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_retries(mut self, retries: u32, retry_delay: u32) -> Self {
        self.retries = retries;
        self.retry_delay = retry_delay;
        self
    }

    /// Push the first execution `delay` seconds past creation.
    pub fn delayed(mut self, delay: u32) -> Self {
        self.delay = delay;
        self.next_execution = self.created_at + Duration::seconds(i64::from(delay));
        self
    }

    /// Attempts left before the job is exhausted.
    pub fn has_budget(&self) -> bool {
        self.tried_counts < self.retries
    }

    /// All attempts used without a success. Terminal.
    pub fn is_exhausted(&self) -> bool {
        !self.has_budget() && !self.is_successful
    }

    /// Whether a claim may select this job at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.has_budget() && !self.is_successful && !self.is_processing && self.next_execution <= now
    }

    /// Like [`Job::is_eligible`], but a claim older than `stale_after` no longer
    /// blocks selection.
    pub fn is_claimable(&self, now: DateTime<Utc>, stale_after: Option<Duration>) -> bool {
        if !self.is_processing {
            return self.is_eligible(now);
        }
        let stale = match (stale_after, self.claimed_at) {
            (Some(threshold), Some(claimed_at)) => claimed_at
                .checked_add_signed(threshold)
                .is_some_and(|expires| expires <= now),
            _ => false,
        };
        stale && self.has_budget() && !self.is_successful && self.next_execution <= now
    }

    /// Take the exclusive delivery right.
    pub fn claim(&mut self, now: DateTime<Utc>) {
        self.is_processing = true;
        self.claimed_at = Some(now);
        self.updated_at = now;
    }

    /// Whether `held`, the copy a worker got back from its claim, still owns
    /// this job's claim. A stale reclaim stamps a new `claimed_at`, so the
    /// earlier holder stops matching.
    pub fn is_claim_held_by(&self, held: &Job) -> bool {
        self.is_processing && held.claimed_at.is_some() && self.claimed_at == held.claimed_at
    }

    /// Give the delivery right back.
    pub fn release(&mut self, now: DateTime<Utc>) {
        self.is_processing = false;
        self.claimed_at = None;
        self.updated_at = now;
    }

    /// Apply the result of one delivery attempt that completed at `now`.
    ///
    /// A failed attempt with budget left is rescheduled `retry_delay` seconds
    /// after `now`; otherwise `next_execution` stays where it was.
    pub fn record_attempt(&mut self, status_code: u16, now: DateTime<Utc>) {
        self.tried_counts = self.tried_counts.saturating_add(1);
        self.is_executed = true;
        self.is_successful = status_code == Self::SUCCESS_STATUS;

        if !self.is_successful && self.has_budget() {
            self.next_execution = now + Duration::seconds(i64::from(self.retry_delay));
        }

        self.updated_at = now;
    }

    pub fn owns_output(&self, output: &Output) -> bool {
        output.belongs_to(self)
    }
}

impl Entity for Job {
    type Id = JobId;

    fn id(&self) -> &JobId {
        &self.id
    }
}

impl BelongsTo<super::Queue> for Job {
    fn parent_id(&self) -> QueueId {
        self.queue_id
    }
}
