//! Per-key revision high-water marks.
//!
//! Adapters whose backend cannot compare revisions atomically hold the fence
//! for a key across the backend write, so two tasks for the same key cannot
//! interleave and an older revision can never land after a newer one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use relay_common::{EntityId, Revision};
use tokio::sync::OwnedMutexGuard;

#[derive(Default)]
pub struct RevisionFence {
    slots: Mutex<HashMap<EntityId, Arc<tokio::sync::Mutex<Revision>>>>,
}

impl RevisionFence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `id`. Other keys are unaffected.
    pub async fn enter(&self, id: EntityId) -> FenceGuard {
        let slot = {
            // The map only holds Arcs; a poisoned lock leaves it consistent.
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.entry(id).or_default().clone()
        };
        FenceGuard {
            high_water: slot.lock_owned().await,
        }
    }
}

/// Exclusive hold on one key's high-water mark. Released on drop.
pub struct FenceGuard {
    high_water: OwnedMutexGuard<Revision>,
}

impl FenceGuard {
    /// Highest revision applied so far, 0 if none.
    pub fn high_water(&self) -> Revision {
        *self.high_water
    }

    pub fn admits(&self, revision: Revision) -> bool {
        revision >= *self.high_water
    }

    pub fn advance(&mut self, revision: Revision) {
        if revision > *self.high_water {
            *self.high_water = revision;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn admits_equal_or_newer_revisions_only() {
        let fence = RevisionFence::new();
        let mut guard = fence.enter(1).await;
        assert_eq!(guard.high_water(), 0);
        guard.advance(3);

        assert!(guard.admits(3));
        assert!(guard.admits(4));
        assert!(!guard.admits(2));
    }

    #[tokio::test]
    async fn advance_never_moves_backwards() {
        let fence = RevisionFence::new();
        {
            let mut guard = fence.enter(1).await;
            guard.advance(5);
            guard.advance(2);
        }
        assert_eq!(fence.enter(1).await.high_water(), 5);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let fence = RevisionFence::new();
        let _held = fence.enter(1).await;

        let other = tokio::time::timeout(Duration::from_millis(100), fence.enter(2)).await;
        assert!(other.is_ok());
    }

    #[tokio::test]
    async fn same_key_waits_for_release() {
        let fence = Arc::new(RevisionFence::new());
        let held = fence.enter(1).await;

        let blocked = tokio::time::timeout(Duration::from_millis(20), fence.enter(1)).await;
        assert!(blocked.is_err());

        drop(held);
        let entered = tokio::time::timeout(Duration::from_millis(100), fence.enter(1)).await;
        assert!(entered.is_ok());
    }
}
