//! API principals and their projects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{BelongsTo, Entity};
use crate::id::{ClientId, Code, ProjectId};

/// An API principal.
///
/// Blocked clients are turned away at the access boundary; the delivery engine
/// never looks at this flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub id: ClientId,
    pub name: String,
    pub email: String,
    /// Opaque bearer token.
    #[serde(skip_serializing, default)]
    pub token: String,
    pub is_blocked: bool,
    pub created_at: DateTime<Utc>,
}

impl Client {
    /// Register a new client with a freshly minted token.
    pub fn register(name: impl Into<String>, email: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: ClientId::new(),
            name: name.into(),
            email: email.into(),
            token: Code::generate().into_string(),
            is_blocked: false,
            created_at: now,
        }
    }

    pub fn owns_project(&self, project: &Project) -> bool {
        project.belongs_to(self)
    }
}

impl Entity for Client {
    type Id = ClientId;

    fn id(&self) -> &ClientId {
        &self.id
    }
}

/// A namespace owned by exactly one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub code: Code,
    pub client_id: ClientId,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Project {
    pub fn new(client_id: ClientId, name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: ProjectId::new(),
            code: Code::generate(),
            client_id,
            name: name.into(),
            description: None,
            created_at: now,
        }
    }

    pub fn owns_queue(&self, queue: &super::Queue) -> bool {
        queue.belongs_to(self)
    }
}

impl Entity for Project {
    type Id = ProjectId;

    fn id(&self) -> &ProjectId {
        &self.id
    }
}

impl BelongsTo<Client> for Project {
    fn parent_id(&self) -> ClientId {
        self.client_id
    }
}
