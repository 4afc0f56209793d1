//! Write fan-out: commit to the primary store, then propagate the committed
//! entity to secondary views (cache, search index, event channel).
//!
//! The primary commit is the correctness boundary. Secondary adapters are
//! driven concurrently in the background with bounded retries, a per-adapter
//! circuit breaker and a per-key revision tie-break. Their failures are
//! reported and counted, never returned as a failed mutation.

pub mod adapter;
pub mod cache;
pub mod circuit;
pub mod coordinator;
pub mod fence;
pub mod framing;
pub mod metrics;
pub mod publisher;
pub mod report;
pub mod retry;
pub mod search;

pub use adapter::{AdapterAck, SecondaryAdapter};
pub use cache::CacheAdapter;
pub use circuit::CircuitBreaker;
pub use coordinator::{Applied, Coordinator, CoordinatorBuilder, CoordinatorConfig};
pub use fence::RevisionFence;
pub use framing::FrameError;
pub use metrics::{FanoutMetrics, MetricsSnapshot};
pub use publisher::{
    subscribe, EventPublisher, MemoryPublisher, PgNotifyPublisher, PublisherAdapter, SubscribeError,
};
pub use report::{PropagationOutcome, PropagationReport, ReportSnapshot, TaskStatus};
pub use retry::RetryPolicy;
pub use search::{
    MemorySearchIndex, PgSearchIndex, SearchAdapter, SearchDocument, SearchIndex, SearchQuery,
};
