//! Per-mutation view of secondary propagation.
//!
//! Each adapter task publishes its status on a `watch` channel. The report
//! holds the receiving ends, so it keeps reflecting background progress after
//! `apply` has returned.

use std::collections::BTreeMap;

use relay_common::{AdapterKind, EntityId, Revision};
use serde::Serialize;
use tokio::sync::watch;

/// Terminal result of one propagation task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropagationOutcome {
    Succeeded,
    /// Discarded by the revision tie-break.
    Stale,
    Abandoned { attempts: u32, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    /// Failed at least once, retries remaining.
    Failed { attempts: u32, reason: String },
    Succeeded,
    Stale,
    Abandoned { attempts: u32, reason: String },
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Stale | TaskStatus::Abandoned { .. }
        )
    }

    pub fn outcome(&self) -> Option<PropagationOutcome> {
        match self {
            TaskStatus::Succeeded => Some(PropagationOutcome::Succeeded),
            TaskStatus::Stale => Some(PropagationOutcome::Stale),
            TaskStatus::Abandoned { attempts, reason } => Some(PropagationOutcome::Abandoned {
                attempts: *attempts,
                reason: reason.clone(),
            }),
            TaskStatus::Pending | TaskStatus::Failed { .. } => None,
        }
    }
}

impl From<PropagationOutcome> for TaskStatus {
    fn from(outcome: PropagationOutcome) -> Self {
        match outcome {
            PropagationOutcome::Succeeded => TaskStatus::Succeeded,
            PropagationOutcome::Stale => TaskStatus::Stale,
            PropagationOutcome::Abandoned { attempts, reason } => {
                TaskStatus::Abandoned { attempts, reason }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// PropagationReport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PropagationReport {
    entity_id: EntityId,
    revision: Revision,
    tasks: Vec<(AdapterKind, watch::Receiver<TaskStatus>)>,
}

impl PropagationReport {
    pub(crate) fn new(
        entity_id: EntityId,
        revision: Revision,
        tasks: Vec<(AdapterKind, watch::Receiver<TaskStatus>)>,
    ) -> Self {
        Self {
            entity_id,
            revision,
            tasks,
        }
    }

    /// Report with no tasks, as returned for an idempotent replay.
    pub fn empty(entity_id: EntityId, revision: Revision) -> Self {
        Self::new(entity_id, revision, Vec::new())
    }

    pub fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn kinds(&self) -> impl Iterator<Item = AdapterKind> + '_ {
        self.tasks.iter().map(|(kind, _)| *kind)
    }

    pub fn status(&self, kind: AdapterKind) -> Option<TaskStatus> {
        self.tasks
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, rx)| rx.borrow().clone())
    }

    pub fn snapshot(&self) -> ReportSnapshot {
        ReportSnapshot {
            tasks: self
                .tasks
                .iter()
                .map(|(kind, rx)| (*kind, rx.borrow().clone()))
                .collect(),
        }
    }

    pub fn is_settled(&self) -> bool {
        self.tasks.iter().all(|(_, rx)| rx.borrow().is_terminal())
    }

    /// Wait until every task reaches a terminal status.
    ///
    /// A task whose sender went away without a terminal status (its runtime
    /// shut down) is skipped rather than waited on forever.
    pub async fn settled(&self) -> ReportSnapshot {
        for (_, rx) in &self.tasks {
            let mut rx = rx.clone();
            let _ = rx.wait_for(TaskStatus::is_terminal).await;
        }
        self.snapshot()
    }
}

// ---------------------------------------------------------------------------
// ReportSnapshot
// ---------------------------------------------------------------------------

/// Point-in-time copy of a report, keyed by adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReportSnapshot {
    pub tasks: BTreeMap<AdapterKind, TaskStatus>,
}

impl ReportSnapshot {
    fn count(&self, pred: impl Fn(&TaskStatus) -> bool) -> usize {
        self.tasks.values().filter(|s| pred(s)).count()
    }

    pub fn pending(&self) -> usize {
        self.count(|s| matches!(s, TaskStatus::Pending | TaskStatus::Failed { .. }))
    }

    pub fn succeeded(&self) -> usize {
        self.count(|s| matches!(s, TaskStatus::Succeeded))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, TaskStatus::Failed { .. }))
    }

    pub fn stale(&self) -> usize {
        self.count(|s| matches!(s, TaskStatus::Stale))
    }

    pub fn abandoned(&self) -> usize {
        self.count(|s| matches!(s, TaskStatus::Abandoned { .. }))
    }

    pub fn is_settled(&self) -> bool {
        self.tasks.values().all(TaskStatus::is_terminal)
    }
}
