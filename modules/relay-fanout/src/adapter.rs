use std::sync::Arc;

use async_trait::async_trait;
use relay_common::{AdapterKind, PropagationError, PropagationTask};

/// What an adapter did with a task it accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterAck {
    /// The view now reflects the task's revision.
    Applied,
    /// The view already holds a newer revision for this key; the task was discarded.
    Stale,
}

/// A secondary view that receives committed changes.
///
/// Implementations must apply tasks for one key in nondecreasing revision
/// order: a task older than what the view already holds returns
/// `AdapterAck::Stale` and leaves the view untouched. Re-applying the
/// current revision is allowed.
#[async_trait]
pub trait SecondaryAdapter: Send + Sync {
    fn kind(&self) -> AdapterKind;

    async fn apply(&self, task: &PropagationTask) -> Result<AdapterAck, PropagationError>;
}

#[async_trait]
impl<A: SecondaryAdapter + ?Sized> SecondaryAdapter for Arc<A> {
    fn kind(&self) -> AdapterKind {
        (**self).kind()
    }

    async fn apply(&self, task: &PropagationTask) -> Result<AdapterAck, PropagationError> {
        (**self).apply(task).await
    }
}
