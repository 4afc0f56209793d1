//! Write-through entity cache.
//!
//! Stores the latest propagated entity per key so reads reflect the newest
//! revision this adapter has seen. Expired entries are hidden from reads but
//! still take part in the revision tie-break.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use relay_common::config::CacheSettings;
use relay_common::{AdapterKind, Entity, EntityId, PropagationError, PropagationTask, Revision};

use crate::adapter::{AdapterAck, SecondaryAdapter};

pub struct CacheAdapter {
    entries: RwLock<HashMap<EntityId, CacheEntry>>,
    ttl: Option<Duration>,
}

struct CacheEntry {
    entity: Entity,
    stored_at: Instant,
}

impl CacheAdapter {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn from_settings(settings: &CacheSettings) -> Self {
        Self::new(settings.ttl())
    }

    /// Cached entity, if present and not expired. A poisoned cache reads as empty.
    pub fn get(&self, id: EntityId) -> Option<Entity> {
        let entries = self.entries.read().ok()?;
        let entry = entries.get(&id)?;
        if self.is_expired(entry) {
            return None;
        }
        Some(entry.entity.clone())
    }

    /// Revision held for `id`, including expired entries.
    pub fn revision_of(&self, id: EntityId) -> Option<Revision> {
        let entries = self.entries.read().ok()?;
        entries.get(&id).map(|entry| entry.entity.revision)
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_expired(&self, entry: &CacheEntry) -> bool {
        self.ttl
            .is_some_and(|ttl| entry.stored_at.elapsed() >= ttl)
    }

    fn write(&self, task: &PropagationTask) -> Result<AdapterAck, PropagationError> {
        // A writer panicked mid-update; the contents can no longer be trusted.
        let mut entries = self
            .entries
            .write()
            .map_err(|_| PropagationError::non_retryable("cache state poisoned"))?;

        if let Some(current) = entries.get(&task.entity_id) {
            if current.entity.revision > task.revision {
                return Ok(AdapterAck::Stale);
            }
        }

        entries.insert(
            task.entity_id,
            CacheEntry {
                entity: task.to_entity(),
                stored_at: Instant::now(),
            },
        );
        Ok(AdapterAck::Applied)
    }
}

impl Default for CacheAdapter {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl SecondaryAdapter for CacheAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Cache
    }

    async fn apply(&self, task: &PropagationTask) -> Result<AdapterAck, PropagationError> {
        self.write(task)
    }
}
