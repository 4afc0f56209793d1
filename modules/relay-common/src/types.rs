use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// Primary-store identifier of an entity.
pub type EntityId = i64;

/// Per-key commit counter assigned by the primary store. Starts at 1.
pub type Revision = i64;

pub const MAX_HANDLE_LEN: usize = 255;
pub const MAX_ADDRESS_LEN: usize = 320;
pub const MAX_TOKEN_LEN: usize = 255;

// --- Payload ---

/// Attributes of a user entity. `username`/`email` are accepted on input
/// for compatibility with older clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPayload {
    #[serde(alias = "username")]
    pub handle: String,
    #[serde(alias = "email")]
    pub address: String,
}

impl UserPayload {
    pub fn new(handle: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            address: address.into(),
        }
    }

    /// Trim surrounding whitespace from both fields.
    pub fn normalized(self) -> Self {
        Self {
            handle: self.handle.trim().to_string(),
            address: self.address.trim().to_string(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        check_field("handle", &self.handle, MAX_HANDLE_LEN)?;
        check_field("address", &self.address, MAX_ADDRESS_LEN)?;
        Ok(())
    }
}

fn check_field(field: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Missing(field));
    }
    if value.len() > max {
        return Err(ValidationError::TooLong {
            field,
            max,
            len: value.len(),
        });
    }
    Ok(())
}

// --- Entity ---

/// A committed record as returned by the primary store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    #[serde(flatten)]
    pub payload: UserPayload,
    pub revision: Revision,
    pub committed_at: DateTime<Utc>,
}

impl Entity {
    /// The first revision of a key is its creation; everything after is an update.
    pub fn change_op(&self) -> ChangeOp {
        if self.revision <= 1 {
            ChangeOp::Created
        } else {
            ChangeOp::Updated
        }
    }
}

// --- Mutation ---

/// Caller-supplied value that makes a mutation safe to retry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyToken(String);

impl IdempotencyToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Random token for callers that do not supply one.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        check_field("idempotency_token", &self.0, MAX_TOKEN_LEN)
    }
}

impl std::fmt::Display for IdempotencyToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Intent to create (no key) or update (key present) an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub key: Option<EntityId>,
    pub payload: UserPayload,
    pub token: IdempotencyToken,
}

impl Mutation {
    pub fn create(payload: UserPayload, token: IdempotencyToken) -> Self {
        Self {
            key: None,
            payload,
            token,
        }
    }

    pub fn update(id: EntityId, payload: UserPayload, token: IdempotencyToken) -> Self {
        Self {
            key: Some(id),
            payload,
            token,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.token.validate()?;
        self.payload.validate()
    }
}

// --- Propagation ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Created,
    Updated,
}

impl ChangeOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOp::Created => "created",
            ChangeOp::Updated => "updated",
        }
    }
}

impl std::fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The secondary views a committed change is fanned out to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    Cache,
    Search,
    Publisher,
}

impl std::fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdapterKind::Cache => write!(f, "cache"),
            AdapterKind::Search => write!(f, "search"),
            AdapterKind::Publisher => write!(f, "publisher"),
        }
    }
}

/// One unit of propagation work: a snapshot of an entity at one revision.
/// Shared read-only between the adapters that receive it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropagationTask {
    pub entity_id: EntityId,
    pub revision: Revision,
    pub op: ChangeOp,
    pub payload: UserPayload,
    pub committed_at: DateTime<Utc>,
}

impl PropagationTask {
    pub fn from_entity(entity: &Entity) -> Self {
        Self {
            entity_id: entity.id,
            revision: entity.revision,
            op: entity.change_op(),
            payload: entity.payload.clone(),
            committed_at: entity.committed_at,
        }
    }

    /// The entity as of this task's revision.
    pub fn to_entity(&self) -> Entity {
        Entity {
            id: self.entity_id,
            payload: self.payload.clone(),
            revision: self.revision,
            committed_at: self.committed_at,
        }
    }
}

/// Change notification broadcast to subscribers. Delivery is at-least-once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub entity_id: EntityId,
    pub revision: Revision,
    pub op: ChangeOp,
    pub payload: UserPayload,
    pub occurred_at: DateTime<Utc>,
}

impl From<&PropagationTask> for ChangeEvent {
    fn from(task: &PropagationTask) -> Self {
        Self {
            entity_id: task.entity_id,
            revision: task.revision,
            op: task.op,
            payload: task.payload.clone(),
            occurred_at: task.committed_at,
        }
    }
}
