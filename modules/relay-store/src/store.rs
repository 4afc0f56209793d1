use std::sync::Arc;

use async_trait::async_trait;
use relay_common::{CommitError, Entity, EntityId, Mutation};

/// Result of a commit that reached the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Written under a new revision.
    Committed(Entity),
    /// The token was already committed. Carries that commit's entity, unchanged.
    Replayed(Entity),
}

impl CommitOutcome {
    pub fn entity(&self) -> &Entity {
        match self {
            CommitOutcome::Committed(entity) | CommitOutcome::Replayed(entity) => entity,
        }
    }

    pub fn into_entity(self) -> Entity {
        match self {
            CommitOutcome::Committed(entity) | CommitOutcome::Replayed(entity) => entity,
        }
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, CommitOutcome::Replayed(_))
    }
}

/// Atomic, idempotent writes against the system of record.
///
/// Implemented by `PgPrimaryStore` (postgres) and `MemoryPrimaryStore` (tests).
/// Also implemented for `Arc<S>` so a store can be shared for assertions.
#[async_trait]
pub trait PrimaryStore: Send + Sync {
    /// Write the mutation under a new revision, or return the prior result
    /// for an already-committed token. Nothing is written on error.
    async fn commit(&self, mutation: Mutation) -> Result<CommitOutcome, CommitError>;

    /// Current state of an entity.
    async fn get(&self, id: EntityId) -> Result<Option<Entity>, CommitError>;
}

#[async_trait]
impl<S: PrimaryStore + ?Sized> PrimaryStore for Arc<S> {
    async fn commit(&self, mutation: Mutation) -> Result<CommitOutcome, CommitError> {
        (**self).commit(mutation).await
    }

    async fn get(&self, id: EntityId) -> Result<Option<Entity>, CommitError> {
        (**self).get(id).await
    }
}
