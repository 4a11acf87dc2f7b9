//! Delivery Coordinator
//!
//! Combined read policy for pollers. One poll:
//!
//! 1. returns nothing if the stream is empty,
//! 2. lazily creates the consumer group,
//! 3. walks the pending table from the start in pages of [`PENDING_PAGE_SIZE`],
//!    reclaiming entries that other consumers left idle for `max_idle` and
//!    that have been delivered fewer than `max_delivery_count` times,
//! 4. tops the batch up with never-delivered entries.
//!
//! Reclaimed entries come first: work that already failed once is older
//! than anything new. The coordinator holds no state between polls; all
//! ownership lives in the store.

use crate::store::{LogEntry, LogStore, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Pending entries inspected per `list_pending` round trip
pub const PENDING_PAGE_SIZE: usize = 10;

/// Knobs for one poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadLimits {
    /// Cap on returned entries; `None` (or `Some(0)`) returns everything ready
    pub max_count: Option<usize>,
    /// Minimum idle time before another consumer's entry may be taken over
    pub max_idle: Duration,
    /// Entries delivered this many times are never handed out again
    pub max_delivery_count: u64,
}

impl Default for ReadLimits {
    fn default() -> Self {
        ReadLimits {
            max_count: None,
            max_idle: Duration::from_millis(60_000),
            max_delivery_count: 3,
        }
    }
}

pub struct DeliveryCoordinator<S> {
    store: Arc<S>,
    group: String,
}

impl<S> Clone for DeliveryCoordinator<S> {
    fn clone(&self) -> Self {
        DeliveryCoordinator {
            store: Arc::clone(&self.store),
            group: self.group.clone(),
        }
    }
}

impl<S: LogStore> DeliveryCoordinator<S> {
    pub fn new(store: Arc<S>, group: impl Into<String>) -> Self {
        DeliveryCoordinator {
            store,
            group: group.into(),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Entries ready for `consumer`, claimed on its behalf
    ///
    /// Fails only when the store is unavailable; lost reclaim races just
    /// shrink the batch.
    pub async fn poll_ready(
        &self,
        stream: &str,
        consumer: &str,
        limits: ReadLimits,
    ) -> Result<Vec<LogEntry>, StoreError> {
        let max_count = limits.max_count.filter(|&n| n > 0);

        if self.store.count(stream).await? == 0 {
            debug!(stream, "stream is empty");
            return Ok(Vec::new());
        }

        let creation = self.store.ensure_group(stream, &self.group).await?;
        debug!(stream, group = %self.group, created = creation.created(), "ensured consumer group");

        let mut ready = self
            .reclaim_stale(stream, consumer, limits, max_count)
            .await?;
        debug!(stream, consumer, reclaimed = ready.len(), "walked pending entries");

        let remaining = max_count.map(|max| max.saturating_sub(ready.len()));
        if remaining != Some(0) {
            let fresh = self
                .store
                .read_unclaimed(stream, &self.group, consumer, remaining)
                .await?;
            debug!(stream, consumer, fresh = fresh.len(), "read new entries");
            ready.extend(fresh);
        }

        debug_assert!(max_count.map_or(true, |max| ready.len() <= max));
        Ok(ready)
    }

    async fn reclaim_stale(
        &self,
        stream: &str,
        consumer: &str,
        limits: ReadLimits,
        max_count: Option<usize>,
    ) -> Result<Vec<LogEntry>, StoreError> {
        let mut reclaimed = Vec::new();
        let mut after = None;

        loop {
            let page = self
                .store
                .list_pending(
                    stream,
                    &self.group,
                    limits.max_idle,
                    after,
                    PENDING_PAGE_SIZE,
                )
                .await?;
            if page.is_empty() {
                return Ok(reclaimed);
            }

            for pending in page {
                after = Some(pending.id);
                if pending.consumer == consumer {
                    continue;
                }
                if pending.delivery_count >= limits.max_delivery_count {
                    continue;
                }

                match self
                    .store
                    .reclaim(stream, &self.group, consumer, limits.max_idle, pending.id)
                    .await
                {
                    Ok(entry) => reclaimed.push(entry),
                    Err(StoreError::ClaimRaced(id)) => {
                        warn!(stream, entry_id = %id, consumer, "skipping entry taken by another consumer");
                    }
                    Err(e) => return Err(e),
                }

                if max_count.is_some_and(|max| reclaimed.len() >= max) {
                    return Ok(reclaimed);
                }
            }
        }
    }
}
