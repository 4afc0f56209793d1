//! In-memory primary store for tests and demos. No database required.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use relay_common::{CommitError, Entity, EntityId, IdempotencyToken, Mutation};

use crate::store::{CommitOutcome, PrimaryStore};

/// Thread-safe. One lock guards rows, tokens and the id sequence, so every
/// commit (and therefore every same-key commit) is serialized.
pub struct MemoryPrimaryStore {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    next_id: EntityId,
    rows: HashMap<EntityId, Entity>,
    tokens: HashMap<IdempotencyToken, Entity>,
}

impl MemoryPrimaryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                next_id: 1,
                ..Default::default()
            }),
        }
    }

    /// Number of entities committed so far.
    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryPrimaryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PrimaryStore for MemoryPrimaryStore {
    async fn commit(&self, mutation: Mutation) -> Result<CommitOutcome, CommitError> {
        mutation.validate()?;
        let mut state = self
            .state
            .lock()
            .map_err(|_| CommitError::Unavailable("memory store lock poisoned".into()))?;

        if let Some(prior) = state.tokens.get(&mutation.token) {
            return Ok(CommitOutcome::Replayed(prior.clone()));
        }

        let entity = match mutation.key {
            None => {
                let id = state.next_id;
                state.next_id += 1;
                Entity {
                    id,
                    payload: mutation.payload,
                    revision: 1,
                    committed_at: Utc::now(),
                }
            }
            Some(id) => {
                let current = state.rows.get(&id).ok_or(CommitError::NotFound(id))?;
                Entity {
                    id,
                    payload: mutation.payload,
                    revision: current.revision + 1,
                    committed_at: Utc::now(),
                }
            }
        };

        state.rows.insert(entity.id, entity.clone());
        state.tokens.insert(mutation.token, entity.clone());
        Ok(CommitOutcome::Committed(entity))
    }

    async fn get(&self, id: EntityId) -> Result<Option<Entity>, CommitError> {
        let state = self
            .state
            .lock()
            .map_err(|_| CommitError::Unavailable("memory store lock poisoned".into()))?;
        Ok(state.rows.get(&id).cloned())
    }
}
