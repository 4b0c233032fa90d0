//! Queues: delivery policy templates that new jobs inherit from.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{BelongsTo, Entity};
use crate::http::HttpVerb;
use crate::id::{Code, ProjectId, QueueId};

use super::job::Job;

/// A delivery policy template owned by a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Queue {
    pub id: QueueId,
    pub code: Code,
    pub project_id: ProjectId,
    pub name: String,
    pub description: Option<String>,
    pub delay: u32,
    pub retries: u32,
    pub retry_delay: u32,
    pub callback_url: Option<String>,
    pub http_verb: HttpVerb,
    pub headers: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// Caller-supplied fields for a new job. `None` means "use the queue's default".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub title: String,
    pub description: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub callback_url: Option<String>,
    pub http_verb: Option<HttpVerb>,
    pub headers: Option<BTreeMap<String, String>>,
    pub delay: Option<u32>,
    pub retries: Option<u32>,
    pub retry_delay: Option<u32>,
}

impl Queue {
    pub fn new(project_id: ProjectId, name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: QueueId::new(),
            code: Code::generate(),
            project_id,
            name: name.into(),
            description: None,
            delay: 0,
            retries: Job::MIN_RETRIES,
            retry_delay: 0,
            callback_url: None,
            http_verb: HttpVerb::Get,
            headers: BTreeMap::new(),
            created_at: now,
        }
    }

    /// Merge a job request with this queue's defaults.
    ///
    /// Every policy field the caller left as `None` is copied from the queue.
    /// The job starts unattempted and becomes due `delay` seconds after `now`.
    pub fn apply_defaults(&self, new_job: NewJob, now: DateTime<Utc>) -> Job {
        let NewJob {
            title,
            description,
            payload,
            callback_url,
            http_verb,
            headers,
            delay,
            retries,
            retry_delay,
        } = new_job;

        let callback_url = callback_url
            .or_else(|| self.callback_url.clone())
            .unwrap_or_default();

        let mut job = Job::new(self.id, title, callback_url, now)
            .with_payload(payload)
            .with_verb(http_verb.unwrap_or(self.http_verb))
            .with_retries(
                retries.unwrap_or(self.retries),
                retry_delay.unwrap_or(self.retry_delay),
            )
            .delayed(delay.unwrap_or(self.delay));
        job.description = description;
        job.headers = headers.unwrap_or_else(|| self.headers.clone());
        job
    }

    pub fn owns_job(&self, job: &Job) -> bool {
        job.belongs_to(self)
    }
}

impl Entity for Queue {
    type Id = QueueId;

    fn id(&self) -> &QueueId {
        &self.id
    }
}

impl BelongsTo<super::Project> for Queue {
    fn parent_id(&self) -> ProjectId {
        self.project_id
    }
}
