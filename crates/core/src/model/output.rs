//! Immutable record of one delivery attempt.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{BelongsTo, Entity};
use crate::id::{Code, JobId, OutputId};

/// Response headers as received: one name may carry several values.
pub type ResponseHeaders = BTreeMap<String, Vec<String>>;

/// What came back from one attempt (or what was synthesized when nothing did).
///
/// Outputs are append-only: there is no API to mutate one after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub id: OutputId,
    pub code: Code,
    pub job_id: JobId,
    pub job_code: Code,
    /// Response body, or the error text of a synthesized failure.
    pub content: String,
    pub headers: ResponseHeaders,
    pub status_code: u16,
    pub status_message: String,
    pub created_at: DateTime<Utc>,
}

impl Output {
    pub fn is_success(&self) -> bool {
        self.status_code == crate::model::Job::SUCCESS_STATUS
    }
}

impl Entity for Output {
    type Id = OutputId;

    fn id(&self) -> &OutputId {
        &self.id
    }
}

impl BelongsTo<super::Job> for Output {
    fn parent_id(&self) -> JobId {
        self.job_id
    }
}
