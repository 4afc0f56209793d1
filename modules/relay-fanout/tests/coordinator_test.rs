//! Coordinator behaviour against in-memory stores and fake adapters.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use relay_common::config::CircuitSettings;
use relay_common::{
    AdapterKind, ChangeOp, CommitError, Entity, EntityId, IdempotencyToken, Mutation,
    PropagationError, PropagationTask, UserPayload,
};
use relay_fanout::framing;
use relay_fanout::{
    AdapterAck, CacheAdapter, Coordinator, CoordinatorConfig, MemoryPublisher, MemorySearchIndex,
    PublisherAdapter, RetryPolicy, SearchAdapter, SecondaryAdapter, TaskStatus,
};
use relay_store::{CommitOutcome, MemoryPrimaryStore, PrimaryStore};

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

/// Records every task it receives and acknowledges it.
struct Recording {
    kind: AdapterKind,
    tasks: Mutex<Vec<PropagationTask>>,
}

impl Recording {
    fn new(kind: AdapterKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            tasks: Mutex::new(Vec::new()),
        })
    }

    fn tasks(&self) -> Vec<PropagationTask> {
        self.tasks.lock().unwrap().clone()
    }
}

#[async_trait]
impl SecondaryAdapter for Recording {
    fn kind(&self) -> AdapterKind {
        self.kind
    }

    async fn apply(&self, task: &PropagationTask) -> Result<AdapterAck, PropagationError> {
        self.tasks.lock().unwrap().push(task.clone());
        Ok(AdapterAck::Applied)
    }
}

/// Fails the first `failures` calls with `error`, then succeeds.
struct Failing {
    kind: AdapterKind,
    failures: u32,
    error: PropagationError,
    calls: AtomicU32,
}

impl Failing {
    fn always(kind: AdapterKind, error: PropagationError) -> Arc<Self> {
        Self::times(kind, u32::MAX, error)
    }

    fn times(kind: AdapterKind, failures: u32, error: PropagationError) -> Arc<Self> {
        Arc::new(Self {
            kind,
            failures,
            error,
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecondaryAdapter for Failing {
    fn kind(&self) -> AdapterKind {
        self.kind
    }

    async fn apply(&self, _task: &PropagationTask) -> Result<AdapterAck, PropagationError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            Err(self.error.clone())
        } else {
            Ok(AdapterAck::Applied)
        }
    }
}

/// Sleeps before acknowledging.
struct Slow {
    kind: AdapterKind,
    delay: Duration,
}

#[async_trait]
impl SecondaryAdapter for Slow {
    fn kind(&self) -> AdapterKind {
        self.kind
    }

    async fn apply(&self, _task: &PropagationTask) -> Result<AdapterAck, PropagationError> {
        tokio::time::sleep(self.delay).await;
        Ok(AdapterAck::Applied)
    }
}

struct DownStore;

#[async_trait]
impl PrimaryStore for DownStore {
    async fn commit(&self, _mutation: Mutation) -> Result<CommitOutcome, CommitError> {
        Err(CommitError::Unavailable("connection refused".into()))
    }

    async fn get(&self, _id: EntityId) -> Result<Option<Entity>, CommitError> {
        Err(CommitError::Unavailable("connection refused".into()))
    }
}

/// Memory store whose commits take `delay`.
struct SlowStore {
    inner: Arc<MemoryPrimaryStore>,
    delay: Duration,
}

#[async_trait]
impl PrimaryStore for SlowStore {
    async fn commit(&self, mutation: Mutation) -> Result<CommitOutcome, CommitError> {
        tokio::time::sleep(self.delay).await;
        self.inner.commit(mutation).await
    }

    async fn get(&self, id: EntityId) -> Result<Option<Entity>, CommitError> {
        self.inner.get(id).await
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn config(grace: Duration) -> CoordinatorConfig {
    CoordinatorConfig {
        grace_period: grace,
        max_in_flight: 16,
        retry: RetryPolicy::immediate(3, Duration::from_millis(200)),
        circuit: CircuitSettings {
            failure_threshold: 100,
            window_ms: 60_000,
            open_ms: 30_000,
        },
    }
}

fn alice() -> UserPayload {
    UserPayload::new("alice", "alice@example.com")
}

fn create(payload: UserPayload) -> Mutation {
    Mutation::create(payload, IdempotencyToken::generate())
}

// ---------------------------------------------------------------------------
// Commit and dispatch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_propagates_one_task_per_adapter() {
    let cache = Recording::new(AdapterKind::Cache);
    let search = Recording::new(AdapterKind::Search);
    let publisher = Recording::new(AdapterKind::Publisher);
    let coordinator = Coordinator::builder(MemoryPrimaryStore::new())
        .config(config(Duration::from_millis(500)))
        .adapter(cache.clone())
        .adapter(search.clone())
        .adapter(publisher.clone())
        .build();

    let mutation = create(alice());
    let applied = coordinator.apply(mutation.clone()).await.unwrap();

    assert_eq!(applied.entity.id, 1);
    assert_eq!(applied.entity.revision, 1);
    assert_eq!(applied.entity.payload, alice());
    assert!(!applied.replayed);

    let settled = applied.report.settled().await;
    assert_eq!(settled.succeeded(), 3);
    for adapter in [&cache, &search, &publisher] {
        let tasks = adapter.tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].revision, 1);
        assert_eq!(tasks[0].op, ChangeOp::Created);
    }

    // Same token again: same entity, nothing new propagated.
    let replay = coordinator.apply(mutation).await.unwrap();
    assert!(replay.replayed);
    assert_eq!(replay.entity, applied.entity);
    assert!(replay.report.is_empty());
    assert!(replay.status.tasks.is_empty());
    for adapter in [&cache, &search, &publisher] {
        assert_eq!(adapter.tasks().len(), 1);
    }

    let metrics = coordinator.metrics();
    assert_eq!(metrics.dispatched, 3);
    assert_eq!(metrics.succeeded, 3);
    assert_eq!(metrics.replayed, 1);
}

#[tokio::test]
async fn real_adapters_reflect_the_commit() {
    let cache = Arc::new(CacheAdapter::default());
    let search = Arc::new(SearchAdapter::new(MemorySearchIndex::new(), 256));
    let publisher = Arc::new(PublisherAdapter::new(MemoryPublisher::new(), "user_events"));
    let coordinator = Coordinator::builder(MemoryPrimaryStore::new())
        .config(config(Duration::from_millis(500)))
        .adapter(cache.clone())
        .adapter(search.clone())
        .adapter(publisher.clone())
        .build();

    let created = coordinator.apply(create(alice())).await.unwrap();
    created.report.settled().await;

    let updated = coordinator
        .apply(Mutation::update(
            created.entity.id,
            UserPayload::new("alice2", "alice@example.org"),
            IdempotencyToken::generate(),
        ))
        .await
        .unwrap();
    assert_eq!(updated.entity.revision, 2);
    updated.report.settled().await;

    assert_eq!(cache.get(1).unwrap().payload.handle, "alice2");
    let doc = search.index().get(1).unwrap();
    assert_eq!(doc.revision, 2);
    assert_eq!(doc.address_domain.as_deref(), Some("example.org"));

    let events: Vec<_> = publisher
        .publisher()
        .messages("user_events")
        .iter()
        .map(|m| framing::decode(m).unwrap())
        .collect();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].op, ChangeOp::Created);
    assert_eq!(events[1].op, ChangeOp::Updated);
    assert_eq!(events[1].revision, 2);
}

#[tokio::test]
async fn failed_commit_creates_no_tasks() {
    let cache = Recording::new(AdapterKind::Cache);
    let search = Recording::new(AdapterKind::Search);
    let publisher = Recording::new(AdapterKind::Publisher);
    let coordinator = Coordinator::builder(DownStore)
        .config(config(Duration::from_millis(50)))
        .adapter(cache.clone())
        .adapter(search.clone())
        .adapter(publisher.clone())
        .build();

    let err = coordinator.apply(create(alice())).await.unwrap_err();
    assert!(matches!(err, CommitError::Unavailable(_)));

    tokio::time::sleep(Duration::from_millis(20)).await;
    for adapter in [&cache, &search, &publisher] {
        assert!(adapter.tasks().is_empty(), "{} was called", adapter.kind);
    }
    assert_eq!(coordinator.metrics().dispatched, 0);
}

#[tokio::test]
async fn invalid_payload_is_rejected_before_dispatch() {
    let cache = Recording::new(AdapterKind::Cache);
    let coordinator = Coordinator::builder(MemoryPrimaryStore::new())
        .adapter(cache.clone())
        .build();

    let err = coordinator
        .apply(create(UserPayload::new("", "nobody@example.com")))
        .await
        .unwrap_err();
    assert!(matches!(err, CommitError::Invalid(_)));
    assert!(cache.tasks().is_empty());
}

#[tokio::test]
async fn update_of_unknown_key_is_not_found() {
    let coordinator = Coordinator::builder(MemoryPrimaryStore::new()).build();
    let err = coordinator
        .apply(Mutation::update(42, alice(), IdempotencyToken::generate()))
        .await
        .unwrap_err();
    assert!(matches!(err, CommitError::NotFound(42)));
}

// ---------------------------------------------------------------------------
// Retry and abandonment
// ---------------------------------------------------------------------------

#[tokio::test]
async fn exhausted_retries_abandon_without_failing_apply() {
    let search = Failing::always(AdapterKind::Search, PropagationError::retryable("unreachable"));
    let cache = Recording::new(AdapterKind::Cache);
    let coordinator = Coordinator::builder(MemoryPrimaryStore::new())
        .config(config(Duration::from_millis(500)))
        .adapter(cache.clone())
        .adapter(search.clone())
        .build();

    let applied = coordinator.apply(create(alice())).await.unwrap();
    assert_eq!(applied.entity.revision, 1);

    let settled = applied.report.settled().await;
    assert_eq!(settled.tasks[&AdapterKind::Cache], TaskStatus::Succeeded);
    match &settled.tasks[&AdapterKind::Search] {
        TaskStatus::Abandoned { attempts, reason } => {
            assert_eq!(*attempts, 3);
            assert!(reason.contains("unreachable"));
        }
        other => panic!("expected abandoned, got {other:?}"),
    }
    assert_eq!(search.calls(), 3);

    let metrics = coordinator.metrics();
    assert_eq!(metrics.abandoned, 1);
    assert_eq!(metrics.retried, 2);
}

#[tokio::test]
async fn non_retryable_error_abandons_after_one_attempt() {
    let search = Failing::always(
        AdapterKind::Search,
        PropagationError::non_retryable("field exceeds index limit"),
    );
    let coordinator = Coordinator::builder(MemoryPrimaryStore::new())
        .config(config(Duration::from_millis(500)))
        .adapter(search.clone())
        .build();

    let applied = coordinator.apply(create(alice())).await.unwrap();
    let settled = applied.report.settled().await;

    assert!(matches!(
        settled.tasks[&AdapterKind::Search],
        TaskStatus::Abandoned { attempts: 1, .. }
    ));
    assert_eq!(search.calls(), 1);
    assert_eq!(coordinator.metrics().retried, 0);
}

#[tokio::test]
async fn transient_failures_are_retried_to_success() {
    let publisher = Failing::times(
        AdapterKind::Publisher,
        2,
        PropagationError::retryable("channel busy"),
    );
    let coordinator = Coordinator::builder(MemoryPrimaryStore::new())
        .config(config(Duration::from_millis(500)))
        .adapter(publisher.clone())
        .build();

    let applied = coordinator.apply(create(alice())).await.unwrap();
    let settled = applied.report.settled().await;

    assert_eq!(settled.tasks[&AdapterKind::Publisher], TaskStatus::Succeeded);
    assert_eq!(publisher.calls(), 3);
}

#[tokio::test]
async fn slow_call_times_out_and_is_abandoned() {
    let slow = Arc::new(Slow {
        kind: AdapterKind::Search,
        delay: Duration::from_secs(5),
    });
    let mut cfg = config(Duration::from_millis(10));
    cfg.retry = RetryPolicy::immediate(2, Duration::from_millis(30));
    let coordinator = Coordinator::builder(MemoryPrimaryStore::new())
        .config(cfg)
        .adapter(slow)
        .build();

    let applied = coordinator.apply(create(alice())).await.unwrap();
    let settled = applied.report.settled().await;

    match &settled.tasks[&AdapterKind::Search] {
        TaskStatus::Abandoned { attempts, reason } => {
            assert_eq!(*attempts, 2);
            assert!(reason.contains("timed out"));
        }
        other => panic!("expected abandoned, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Grace period and cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn grace_period_returns_pending_tasks() {
    let cache = Recording::new(AdapterKind::Cache);
    let slow = Arc::new(Slow {
        kind: AdapterKind::Search,
        delay: Duration::from_millis(150),
    });
    let coordinator = Coordinator::builder(MemoryPrimaryStore::new())
        .config(config(Duration::from_millis(30)))
        .adapter(cache)
        .adapter(slow)
        .build();

    let applied = coordinator.apply(create(alice())).await.unwrap();

    assert_eq!(applied.status.tasks[&AdapterKind::Cache], TaskStatus::Succeeded);
    assert_eq!(applied.status.tasks[&AdapterKind::Search], TaskStatus::Pending);
    assert_eq!(applied.status.pending(), 1);

    // The task keeps running after apply returned.
    let settled = applied.report.settled().await;
    assert_eq!(settled.tasks[&AdapterKind::Search], TaskStatus::Succeeded);
    assert!(applied.report.is_settled());
}

#[tokio::test]
async fn dropped_caller_does_not_cancel_commit() {
    let store = Arc::new(MemoryPrimaryStore::new());
    let cache = Recording::new(AdapterKind::Cache);
    let coordinator = Coordinator::builder(SlowStore {
        inner: store.clone(),
        delay: Duration::from_millis(50),
    })
    .config(config(Duration::from_millis(50)))
    .adapter(cache.clone())
    .build();

    let result = tokio::time::timeout(
        Duration::from_millis(5),
        coordinator.apply(create(alice())),
    )
    .await;
    assert!(result.is_err());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(store.len(), 1);
    assert_eq!(cache.tasks().len(), 1);
    assert!(coordinator.get(1).await.unwrap().is_some());
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

#[tokio::test]
async fn open_circuit_fails_fast() {
    let search = Failing::always(AdapterKind::Search, PropagationError::retryable("unreachable"));
    let mut cfg = config(Duration::from_millis(200));
    cfg.retry = RetryPolicy::immediate(1, Duration::from_millis(100));
    cfg.circuit = CircuitSettings {
        failure_threshold: 2,
        window_ms: 60_000,
        open_ms: 60_000,
    };
    let coordinator = Coordinator::builder(MemoryPrimaryStore::new())
        .config(cfg)
        .adapter(search.clone())
        .build();

    for _ in 0..2 {
        let applied = coordinator.apply(create(alice())).await.unwrap();
        applied.report.settled().await;
    }
    assert_eq!(search.calls(), 2);
    assert!(coordinator.circuit_open(AdapterKind::Search));

    let applied = coordinator.apply(create(alice())).await.unwrap();
    let settled = applied.report.settled().await;
    match &settled.tasks[&AdapterKind::Search] {
        TaskStatus::Abandoned { reason, .. } => assert!(reason.contains("circuit open")),
        other => panic!("expected abandoned, got {other:?}"),
    }
    assert_eq!(search.calls(), 2);
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_updates_leave_views_at_latest_revision() {
    let cache = Arc::new(CacheAdapter::default());
    let search = Arc::new(SearchAdapter::new(MemorySearchIndex::new(), 256));
    let coordinator = Coordinator::builder(MemoryPrimaryStore::new())
        .config(config(Duration::ZERO))
        .adapter(cache.clone())
        .adapter(search.clone())
        .build();

    let created = coordinator.apply(create(alice())).await.unwrap();
    let id = created.entity.id;

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .apply(Mutation::update(
                        id,
                        UserPayload::new(format!("alice{i}"), "alice@example.com"),
                        IdempotencyToken::generate(),
                    ))
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut revisions = Vec::new();
    for handle in handles {
        let applied = handle.await.unwrap();
        applied.report.settled().await;
        revisions.push(applied.entity.revision);
    }
    revisions.sort();
    assert_eq!(revisions, (2..=11).collect::<Vec<_>>());

    let latest = coordinator.get(id).await.unwrap().unwrap();
    assert_eq!(latest.revision, 11);
    assert_eq!(cache.get(id).unwrap(), latest);
    assert_eq!(search.index().get(id).unwrap().revision, 11);
}

#[tokio::test]
async fn later_adapter_of_same_kind_replaces_earlier() {
    let first = Recording::new(AdapterKind::Cache);
    let second = Recording::new(AdapterKind::Cache);
    let coordinator = Coordinator::builder(MemoryPrimaryStore::new())
        .config(config(Duration::from_millis(200)))
        .adapter(first.clone())
        .adapter(second.clone())
        .build();

    assert_eq!(coordinator.adapters(), vec![AdapterKind::Cache]);
    coordinator.apply(create(alice())).await.unwrap().report.settled().await;

    assert!(first.tasks().is_empty());
    assert_eq!(second.tasks().len(), 1);
}

#[tokio::test]
async fn oversized_in_flight_limit_is_clamped() {
    let cache = Recording::new(AdapterKind::Cache);
    let mut cfg = config(Duration::from_millis(200));
    cfg.max_in_flight = usize::MAX;
    let coordinator = Coordinator::builder(MemoryPrimaryStore::new())
        .config(cfg)
        .adapter(cache.clone())
        .build();

    let applied = coordinator.apply(create(alice())).await.unwrap();
    applied.report.settled().await;
    assert_eq!(cache.tasks().len(), 1);
}
