//! Write fan-out coordinator.
//!
//! `apply` commits a mutation to the primary store, then hands one
//! propagation task per secondary adapter to the background. The caller
//! waits for the commit plus at most the grace period; everything after that
//! is owned by the coordinator, not the request.

use std::sync::Arc;
use std::time::Duration;

use relay_common::config::CircuitSettings;
use relay_common::{
    AdapterKind, CommitError, Entity, EntityId, FileConfig, Mutation, PropagationError,
    PropagationTask,
};
use relay_store::{CommitOutcome, PrimaryStore};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::adapter::{AdapterAck, SecondaryAdapter};
use crate::circuit::CircuitBreaker;
use crate::metrics::{FanoutMetrics, MetricsSnapshot};
use crate::report::{PropagationOutcome, PropagationReport, ReportSnapshot, TaskStatus};
use crate::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How long `apply` waits for secondary outcomes before returning.
    pub grace_period: Duration,
    pub max_in_flight: usize,
    pub retry: RetryPolicy,
    pub circuit: CircuitSettings,
}

impl From<&FileConfig> for CoordinatorConfig {
    fn from(config: &FileConfig) -> Self {
        Self {
            grace_period: config.fanout.grace_period(),
            max_in_flight: config.fanout.max_in_flight,
            retry: RetryPolicy::from(&config.retry),
            circuit: config.circuit.clone(),
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::from(&FileConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct CoordinatorBuilder {
    store: Arc<dyn PrimaryStore>,
    config: CoordinatorConfig,
    adapters: Vec<Arc<dyn SecondaryAdapter>>,
}

impl CoordinatorBuilder {
    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a secondary adapter. A later adapter of the same kind replaces
    /// the earlier one.
    pub fn adapter(mut self, adapter: impl SecondaryAdapter + 'static) -> Self {
        let adapter: Arc<dyn SecondaryAdapter> = Arc::new(adapter);
        self.adapters.retain(|a| a.kind() != adapter.kind());
        self.adapters.push(adapter);
        self
    }

    pub fn build(self) -> Coordinator {
        let mut lanes: Vec<Lane> = self
            .adapters
            .into_iter()
            .map(|adapter| Lane {
                kind: adapter.kind(),
                adapter,
                breaker: Arc::new(CircuitBreaker::from_settings(&self.config.circuit)),
            })
            .collect();
        lanes.sort_by_key(|lane| lane.kind);

        info!(
            adapters = ?lanes.iter().map(|l| l.kind).collect::<Vec<_>>(),
            grace_period_ms = self.config.grace_period.as_millis() as u64,
            max_in_flight = self.config.max_in_flight,
            "Coordinator ready"
        );

        Coordinator {
            inner: Arc::new(Inner {
                store: self.store,
                lanes,
                retry: self.config.retry,
                grace_period: self.config.grace_period,
                permits: Arc::new(Semaphore::new(
                    self.config.max_in_flight.clamp(1, Semaphore::MAX_PERMITS),
                )),
                metrics: FanoutMetrics::new(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Result of a successful `apply`.
#[derive(Debug)]
pub struct Applied {
    pub entity: Entity,
    /// The token had already been committed; nothing new was written or propagated.
    pub replayed: bool,
    /// Live view of the propagation tasks.
    pub report: PropagationReport,
    /// `report` as it stood when `apply` returned.
    pub status: ReportSnapshot,
}

#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn PrimaryStore>,
    lanes: Vec<Lane>,
    retry: RetryPolicy,
    grace_period: Duration,
    permits: Arc<Semaphore>,
    metrics: FanoutMetrics,
}

#[derive(Clone)]
struct Lane {
    kind: AdapterKind,
    adapter: Arc<dyn SecondaryAdapter>,
    breaker: Arc<CircuitBreaker>,
}

impl Coordinator {
    pub fn builder(store: impl PrimaryStore + 'static) -> CoordinatorBuilder {
        CoordinatorBuilder {
            store: Arc::new(store),
            config: CoordinatorConfig::default(),
            adapters: Vec::new(),
        }
    }

    /// Commit `mutation` and propagate it to every secondary adapter.
    ///
    /// Fails only when the commit fails. Secondary failures show up in the
    /// report, in metrics and in logs. Dropping the returned future does not
    /// cancel the commit or its propagation.
    pub async fn apply(&self, mutation: Mutation) -> Result<Applied, CommitError> {
        let inner = self.inner.clone();
        let (entity, replayed, report) =
            tokio::spawn(async move { inner.commit_and_dispatch(mutation).await })
                .await
                .map_err(|e| CommitError::Unavailable(format!("commit task failed: {e}")))??;

        if !report.is_settled() {
            let _ = tokio::time::timeout(self.inner.grace_period, report.settled()).await;
        }
        let status = report.snapshot();

        Ok(Applied {
            entity,
            replayed,
            report,
            status,
        })
    }

    /// Authoritative state of an entity, straight from the primary store.
    pub async fn get(&self, id: EntityId) -> Result<Option<Entity>, CommitError> {
        self.inner.store.get(id).await
    }

    pub fn adapters(&self) -> Vec<AdapterKind> {
        self.inner.lanes.iter().map(|lane| lane.kind).collect()
    }

    /// Whether the circuit guarding `kind` is currently open.
    pub fn circuit_open(&self, kind: AdapterKind) -> bool {
        self.inner
            .lanes
            .iter()
            .find(|lane| lane.kind == kind)
            .is_some_and(|lane| lane.breaker.is_open())
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }
}

impl Inner {
    async fn commit_and_dispatch(
        self: Arc<Self>,
        mutation: Mutation,
    ) -> Result<(Entity, bool, PropagationReport), CommitError> {
        let is_update = mutation.key.is_some();
        let outcome = self.store.commit(mutation).await.inspect_err(|e| {
            warn!(error = %e, is_update, "Commit failed, nothing propagated");
        })?;

        match outcome {
            CommitOutcome::Replayed(entity) => {
                self.metrics.replayed();
                info!(
                    entity_id = entity.id,
                    revision = entity.revision,
                    "Idempotent replay, skipping propagation"
                );
                let report = PropagationReport::empty(entity.id, entity.revision);
                Ok((entity, true, report))
            }
            CommitOutcome::Committed(entity) => {
                info!(
                    entity_id = entity.id,
                    revision = entity.revision,
                    op = %entity.change_op(),
                    "Committed"
                );
                let report = self.dispatch(&entity);
                Ok((entity, false, report))
            }
        }
    }

    fn dispatch(self: &Arc<Self>, entity: &Entity) -> PropagationReport {
        let task = Arc::new(PropagationTask::from_entity(entity));
        let mut statuses = Vec::with_capacity(self.lanes.len());

        for lane in &self.lanes {
            let (tx, rx) = watch::channel(TaskStatus::Pending);
            statuses.push((lane.kind, rx));

            let span = info_span!(
                "propagate",
                adapter = %lane.kind,
                entity_id = task.entity_id,
                revision = task.revision,
            );
            let inner = self.clone();
            let lane = lane.clone();
            let task = task.clone();
            tokio::spawn(
                async move {
                    inner.drive(&lane, &task, &tx).await;
                }
                .instrument(span),
            );
        }

        self.metrics.dispatched(statuses.len() as u64);
        PropagationReport::new(entity.id, entity.revision, statuses)
    }

    /// Run one task to a terminal outcome under the retry policy.
    async fn drive(
        &self,
        lane: &Lane,
        task: &PropagationTask,
        status: &watch::Sender<TaskStatus>,
    ) -> PropagationOutcome {
        // The semaphore is never closed, so acquisition only fails if that changes.
        let _permit = self.permits.clone().acquire_owned().await.ok();

        let max_attempts = self.retry.attempts();
        let mut attempt = 0;
        let outcome = loop {
            attempt += 1;
            match self.call(lane, task).await {
                Ok(AdapterAck::Applied) => break PropagationOutcome::Succeeded,
                Ok(AdapterAck::Stale) => break PropagationOutcome::Stale,
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    warn!(attempt, max_attempts, error = %e, "Propagation attempt failed, retrying");
                    self.metrics.retried();
                    status.send_replace(TaskStatus::Failed {
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                    tokio::time::sleep(self.retry.backoff(attempt)).await;
                }
                Err(e) => {
                    break PropagationOutcome::Abandoned {
                        attempts: attempt,
                        reason: e.to_string(),
                    }
                }
            }
        };

        match &outcome {
            PropagationOutcome::Succeeded => {
                self.metrics.succeeded();
                debug!(attempts = attempt, "Propagated");
            }
            PropagationOutcome::Stale => {
                self.metrics.stale();
                debug!("Stale task discarded");
            }
            PropagationOutcome::Abandoned { attempts, reason } => {
                self.metrics.abandoned();
                error!(attempts, reason = %reason, "Propagation abandoned");
            }
        }

        status.send_replace(outcome.clone().into());
        outcome
    }

    /// One guarded adapter call: circuit check, timeout, breaker bookkeeping.
    async fn call(&self, lane: &Lane, task: &PropagationTask) -> Result<AdapterAck, PropagationError> {
        if lane.breaker.is_open() {
            return Err(PropagationError::retryable(format!(
                "circuit open for {} more ms",
                lane.breaker.time_until_reset().as_millis()
            )));
        }

        let timeout = self.retry.call_timeout;
        let result = match tokio::time::timeout(timeout, lane.adapter.apply(task)).await {
            Ok(result) => result,
            Err(_) => Err(PropagationError::retryable(format!(
                "timed out after {}ms",
                timeout.as_millis()
            ))),
        };

        match &result {
            Ok(_) => lane.breaker.record_success(),
            Err(e) if e.is_retryable() => lane.breaker.record_failure(),
            Err(_) => {}
        }
        result
    }
}
