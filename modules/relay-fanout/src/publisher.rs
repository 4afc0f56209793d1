//! Change-event publisher adapter and channel subscription.
//!
//! Events go out over Postgres NOTIFY. A channel has no notion of revision,
//! so the adapter holds the per-key fence across each publish: events for one
//! entity leave in revision order and a superseded revision is never sent.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use futures::Stream;
use relay_common::{AdapterKind, ChangeEvent, PropagationError, PropagationTask};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

use crate::adapter::{AdapterAck, SecondaryAdapter};
use crate::fence::RevisionFence;
use crate::framing::{self, FrameError};

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, channel: &str, message: &str) -> Result<(), PropagationError>;
}

// ---------------------------------------------------------------------------
// PgNotifyPublisher
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PgNotifyPublisher {
    pool: PgPool,
}

impl PgNotifyPublisher {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventPublisher for PgNotifyPublisher {
    async fn publish(&self, channel: &str, message: &str) -> Result<(), PropagationError> {
        sqlx::query("SELECT pg_notify($1, $2::text)")
            .bind(channel)
            .bind(message)
            .execute(&self.pool)
            .await
            .map_err(|e| match &e {
                // 22023: payload too long / invalid channel name
                sqlx::Error::Database(db) if db.code().is_some_and(|c| c.starts_with("22")) => {
                    PropagationError::non_retryable(db.message().to_string())
                }
                _ => PropagationError::retryable(e.to_string()),
            })?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryPublisher
// ---------------------------------------------------------------------------

/// In-process channel. Keeps a log of everything published, and fans out to
/// live subscribers. Publishing with no subscribers is not an error.
pub struct MemoryPublisher {
    sender: broadcast::Sender<(String, String)>,
    log: Mutex<Vec<(String, String)>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            sender,
            log: Mutex::new(Vec::new()),
        }
    }

    /// Messages published to `channel`, oldest first.
    pub fn messages(&self, channel: &str) -> Vec<String> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Receiver of `(channel, message)` pairs published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<(String, String)> {
        self.sender.subscribe()
    }
}

impl Default for MemoryPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventPublisher for MemoryPublisher {
    async fn publish(&self, channel: &str, message: &str) -> Result<(), PropagationError> {
        let entry = (channel.to_string(), message.to_string());
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.clone());
        let _ = self.sender.send(entry);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PublisherAdapter
// ---------------------------------------------------------------------------

pub struct PublisherAdapter<P> {
    publisher: P,
    channel: String,
    fence: RevisionFence,
}

impl<P: EventPublisher> PublisherAdapter<P> {
    pub fn new(publisher: P, channel: impl Into<String>) -> Self {
        Self {
            publisher,
            channel: channel.into(),
            fence: RevisionFence::new(),
        }
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl<P: EventPublisher> SecondaryAdapter for PublisherAdapter<P> {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Publisher
    }

    async fn apply(&self, task: &PropagationTask) -> Result<AdapterAck, PropagationError> {
        let message = framing::encode(&ChangeEvent::from(task))?;

        let mut guard = self.fence.enter(task.entity_id).await;
        if !guard.admits(task.revision) {
            debug!(
                entity_id = task.entity_id,
                revision = task.revision,
                high_water = guard.high_water(),
                "Skipping superseded event"
            );
            return Ok(AdapterAck::Stale);
        }

        self.publisher.publish(&self.channel, &message).await?;
        guard.advance(task.revision);
        Ok(AdapterAck::Applied)
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("listener error: {0}")]
    Listener(#[from] sqlx::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// LISTEN on `channel` and decode each notification into a `ChangeEvent`.
///
/// A frame that fails to decode is yielded as an error and the stream keeps
/// going. The stream ends when the listener can no longer receive.
pub async fn subscribe(
    pool: &PgPool,
    channel: &str,
) -> Result<impl Stream<Item = Result<ChangeEvent, SubscribeError>> + Send, SubscribeError> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(channel).await?;

    Ok(futures::stream::unfold(Some(listener), |state| async move {
        let Some(mut listener) = state else {
            return None;
        };
        match listener.recv().await {
            Ok(notification) => {
                let item = framing::decode(notification.payload()).map_err(SubscribeError::from);
                Some((item, Some(listener)))
            }
            Err(e) => Some((Err(SubscribeError::Listener(e)), None)),
        }
    }))
}
