//! Webhook delivery queue
//!
//! Each channel gets its own stream, `{prefix}:{channel_id}`, and one consumer
//! group (configured once per deployment) shared by all channel streams.
//! Ingress appends; workers poll through the [`DeliveryCoordinator`] and
//! acknowledge what they finished; the [`Reaper`] discards what nobody
//! finished in time.
//!
//! Delivery is at-least-once. A worker that stalls past `max_idle_time_ms`
//! loses its entries to whoever polls next, up to `max_delivery_count`
//! deliveries per entry.

pub mod coordinator;
pub mod dst;
mod payload;
pub mod reaper;

pub use coordinator::{DeliveryCoordinator, ReadLimits, PENDING_PAGE_SIZE};
pub use dst::{run_dst_batch, summarize_batch, QueueDSTConfig, QueueDSTHarness, QueueDSTResult};
pub use payload::{WebhookMessage, WebhookStreamObject};
pub use reaper::{Reaper, ReaperConfig, SweepReport};

use crate::store::{EntryId, LogEntry, LogStore, ParseEntryIdError, StoreError};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Unavailable(#[from] StoreError),

    #[error("message {entry_id} not found")]
    NotFound { entry_id: EntryId },

    #[error("invalid channel id {0:?}")]
    InvalidChannel(String),

    #[error(transparent)]
    InvalidEntryId(#[from] ParseEntryIdError),

    #[error("failed to encode webhook payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Poll knobs exposed to workers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    /// `None` or `Some(0)` returns every ready entry
    pub max_count: Option<usize>,
    pub max_idle_time_ms: u64,
    pub max_delivery_count: u64,
}

impl Default for PollOptions {
    fn default() -> Self {
        PollOptions {
            max_count: None,
            max_idle_time_ms: 60_000,
            max_delivery_count: 3,
        }
    }
}

impl From<PollOptions> for ReadLimits {
    fn from(options: PollOptions) -> Self {
        ReadLimits {
            max_count: options.max_count,
            max_idle: Duration::from_millis(options.max_idle_time_ms),
            max_delivery_count: options.max_delivery_count,
        }
    }
}

pub struct WebhookQueue<S> {
    store: Arc<S>,
    prefix: String,
    coordinator: DeliveryCoordinator<S>,
}

impl<S> Clone for WebhookQueue<S> {
    fn clone(&self) -> Self {
        WebhookQueue {
            store: Arc::clone(&self.store),
            prefix: self.prefix.clone(),
            coordinator: self.coordinator.clone(),
        }
    }
}

impl<S: LogStore> WebhookQueue<S> {
    pub fn new(store: Arc<S>, prefix: impl Into<String>, group: impl Into<String>) -> Self {
        let coordinator = DeliveryCoordinator::new(Arc::clone(&store), group);
        WebhookQueue {
            store,
            prefix: prefix.into(),
            coordinator,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn group(&self) -> &str {
        self.coordinator.group()
    }

    /// Stream holding `channel_id`'s webhooks
    pub fn stream_name(&self, channel_id: &str) -> Result<String, QueueError> {
        let valid = !channel_id.is_empty()
            && !channel_id
                .chars()
                .any(|c| c == ':' || c.is_whitespace() || c.is_control());
        if !valid {
            return Err(QueueError::InvalidChannel(channel_id.to_string()));
        }
        Ok(format!("{}:{}", self.prefix, channel_id))
    }

    pub async fn enqueue(
        &self,
        channel_id: &str,
        object: &WebhookStreamObject,
    ) -> Result<EntryId, QueueError> {
        let stream = self.stream_name(channel_id)?;
        let payload = Bytes::from(serde_json::to_vec(object)?);
        let id = self.store.append(&stream, payload).await?;
        debug!(stream = %stream, entry_id = %id, request_id = %object.request_id, "appended webhook");
        Ok(id)
    }

    /// Messages ready for `consumer`, stale reclaims first
    pub async fn poll_ready(
        &self,
        channel_id: &str,
        consumer: &str,
        options: PollOptions,
    ) -> Result<Vec<WebhookMessage>, QueueError> {
        let stream = self.stream_name(channel_id)?;
        let entries = self
            .coordinator
            .poll_ready(&stream, consumer, options.into())
            .await?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| decode(&stream, entry))
            .collect())
    }

    /// Acknowledge a finished message and drop it from the log
    ///
    /// Both the ack and the delete are always attempted. `NotFound` if the
    /// entry was not pending or no longer in the log.
    pub async fn acknowledge_and_remove(
        &self,
        channel_id: &str,
        entry_id: EntryId,
    ) -> Result<(), QueueError> {
        let stream = self.stream_name(channel_id)?;
        let acked = self.store.ack(&stream, self.group(), entry_id).await;
        let deleted = self.store.delete(&stream, entry_id).await;
        let (acked, deleted) = (acked?, deleted?);

        if !(acked && deleted) {
            debug!(stream = %stream, entry_id = %entry_id, acked, deleted, "message not found");
            return Err(QueueError::NotFound { entry_id });
        }
        debug!(stream = %stream, entry_id = %entry_id, "removed message");
        Ok(())
    }

    pub async fn count(&self, channel_id: &str) -> Result<u64, QueueError> {
        let stream = self.stream_name(channel_id)?;
        Ok(self.store.count(&stream).await?)
    }
}

fn decode(stream: &str, entry: LogEntry) -> Option<WebhookMessage> {
    match serde_json::from_slice::<WebhookStreamObject>(&entry.payload) {
        Ok(object) => Some(WebhookMessage::from_stream_object(entry.id, object)),
        Err(e) => {
            error!(stream, entry_id = %entry.id, error = %e, "skipping malformed webhook payload");
            None
        }
    }
}
