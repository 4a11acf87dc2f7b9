//! In-memory log store
//!
//! Reproduces the Redis Streams consumer-group model in process: each stream
//! holds its entries in id order, a last-generated id, and per-group state
//! (a delivery cursor and a pending table). One lock guards all streams, which
//! gives every operation the same atomicity a single Redis command has.
//!
//! # TigerStyle Invariants
//!
//! - every entry id <= `last_id`
//! - every group cursor <= `last_id`
//! - every pending id <= its group cursor (only delivered entries can be pending)
//! - pending delivery counts are >= 1

use super::{EntryId, GroupCreation, LogEntry, LogStore, PendingInfo, StoreError, StoreFuture};
use crate::clock::{Clock, Timestamp};
use ahash::AHashMap;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
struct PendingClaim {
    consumer: String,
    delivery_count: u64,
    last_claimed_at: Timestamp,
}

#[derive(Debug, Default)]
struct GroupState {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, PendingClaim>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: BTreeMap<EntryId, Bytes>,
    last_id: EntryId,
    groups: AHashMap<String, GroupState>,
}

impl StreamState {
    #[cfg(debug_assertions)]
    fn verify_invariants(&self) {
        if let Some((max_id, _)) = self.entries.last_key_value() {
            debug_assert!(
                *max_id <= self.last_id,
                "Invariant violated: entry {} beyond last id {}",
                max_id,
                self.last_id
            );
        }
        for (name, group) in &self.groups {
            debug_assert!(
                group.last_delivered <= self.last_id,
                "Invariant violated: group {} cursor beyond last id",
                name
            );
            if let Some((max_pending, _)) = group.pending.last_key_value() {
                debug_assert!(
                    *max_pending <= group.last_delivered,
                    "Invariant violated: group {} has undelivered pending entry {}",
                    name,
                    max_pending
                );
            }
            debug_assert!(
                group.pending.values().all(|c| c.delivery_count >= 1),
                "Invariant violated: pending entry with zero deliveries"
            );
        }
    }

    #[cfg(not(debug_assertions))]
    #[inline(always)]
    fn verify_invariants(&self) {}
}

/// Log store kept entirely in memory
///
/// Clones share state, so a test can hand one clone to the code under test
/// and inspect another.
pub struct InMemoryLogStore<C: Clock> {
    streams: Arc<Mutex<AHashMap<String, StreamState>>>,
    clock: C,
}

impl<C: Clock> Clone for InMemoryLogStore<C> {
    fn clone(&self) -> Self {
        InMemoryLogStore {
            streams: Arc::clone(&self.streams),
            clock: self.clock.clone(),
        }
    }
}

impl<C: Clock> InMemoryLogStore<C> {
    pub fn new(clock: C) -> Self {
        InMemoryLogStore {
            streams: Arc::new(Mutex::new(AHashMap::new())),
            clock,
        }
    }

    /// Number of entries pending in `group` (for testing)
    pub fn pending_len(&self, stream: &str, group: &str) -> usize {
        self.streams
            .lock()
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    /// Owner and delivery count of a pending entry (for testing)
    pub fn pending_owner(&self, stream: &str, group: &str, id: EntryId) -> Option<(String, u64)> {
        self.streams
            .lock()
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .and_then(|g| g.pending.get(&id))
            .map(|c| (c.consumer.clone(), c.delivery_count))
    }

    /// Entries currently in `stream`, ascending (for testing)
    pub fn entries(&self, stream: &str) -> Vec<LogEntry> {
        self.streams
            .lock()
            .get(stream)
            .map(|s| {
                s.entries
                    .iter()
                    .map(|(id, payload)| LogEntry {
                        id: *id,
                        payload: payload.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn append_sync(&self, stream: &str, payload: Bytes) -> EntryId {
        let now = self.clock.now().as_millis();
        let mut streams = self.streams.lock();
        let state = streams.entry(stream.to_string()).or_default();

        let id = state.last_id.next_after(now);
        debug_assert!(id > state.last_id, "Postcondition violated: ids must increase");

        state.entries.insert(id, payload);
        state.last_id = id;
        state.verify_invariants();
        id
    }

    fn ensure_group_sync(&self, stream: &str, group: &str) -> GroupCreation {
        let mut streams = self.streams.lock();
        let state = streams.entry(stream.to_string()).or_default();
        if state.groups.contains_key(group) {
            return GroupCreation::AlreadyExists;
        }
        state.groups.insert(group.to_string(), GroupState::default());
        GroupCreation::Created
    }

    fn read_unclaimed_sync(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max_count: Option<usize>,
    ) -> Result<Vec<LogEntry>, StoreError> {
        let now = self.clock.now();
        let mut streams = self.streams.lock();
        let missing = || StoreError::MissingGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        };
        let state = streams.get_mut(stream).ok_or_else(missing)?;
        let StreamState { entries, groups, .. } = &mut *state;
        let group_state = groups.get_mut(group).ok_or_else(missing)?;

        let limit = max_count.filter(|&n| n > 0).unwrap_or(usize::MAX);
        let fresh: Vec<LogEntry> = entries
            .range((
                std::ops::Bound::Excluded(group_state.last_delivered),
                std::ops::Bound::Unbounded,
            ))
            .take(limit)
            .map(|(id, payload)| LogEntry {
                id: *id,
                payload: payload.clone(),
            })
            .collect();

        for entry in &fresh {
            group_state.pending.insert(
                entry.id,
                PendingClaim {
                    consumer: consumer.to_string(),
                    delivery_count: 1,
                    last_claimed_at: now,
                },
            );
        }
        if let Some(last) = fresh.last() {
            group_state.last_delivered = last.id;
        }

        state.verify_invariants();
        Ok(fresh)
    }

    fn list_pending_sync(
        &self,
        stream: &str,
        group: &str,
        min_idle: Duration,
        after: Option<EntryId>,
        limit: usize,
    ) -> Result<Vec<PendingInfo>, StoreError> {
        let now = self.clock.now();
        let streams = self.streams.lock();
        let group_state = streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .ok_or_else(|| StoreError::MissingGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            })?;

        let lower = match after {
            Some(id) => std::ops::Bound::Excluded(id),
            None => std::ops::Bound::Unbounded,
        };
        Ok(group_state
            .pending
            .range((lower, std::ops::Bound::Unbounded))
            .filter_map(|(id, claim)| {
                let idle = now.saturating_sub(claim.last_claimed_at);
                (idle >= min_idle).then(|| PendingInfo {
                    id: *id,
                    consumer: claim.consumer.clone(),
                    delivery_count: claim.delivery_count,
                    idle,
                })
            })
            .take(limit)
            .collect())
    }

    fn reclaim_sync(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        id: EntryId,
    ) -> Result<LogEntry, StoreError> {
        let now = self.clock.now();
        let mut streams = self.streams.lock();
        let state = streams
            .get_mut(stream)
            .ok_or(StoreError::ClaimRaced(id))?;
        let StreamState { entries, groups, .. } = &mut *state;
        let group_state = groups.get_mut(group).ok_or_else(|| StoreError::MissingGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        })?;

        let still_idle = group_state
            .pending
            .get(&id)
            .map(|claim| now.saturating_sub(claim.last_claimed_at) >= min_idle)
            .ok_or(StoreError::ClaimRaced(id))?;
        if !still_idle {
            return Err(StoreError::ClaimRaced(id));
        }

        let Some(payload) = entries.get(&id).cloned() else {
            // Deleted from the log while still pending: nothing left to deliver.
            group_state.pending.remove(&id);
            return Err(StoreError::ClaimRaced(id));
        };

        if let Some(claim) = group_state.pending.get_mut(&id) {
            claim.consumer = consumer.to_string();
            claim.delivery_count += 1;
            claim.last_claimed_at = now;
        }

        state.verify_invariants();
        Ok(LogEntry { id, payload })
    }

    fn ack_sync(&self, stream: &str, group: &str, id: EntryId) -> bool {
        let mut streams = self.streams.lock();
        streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .map(|g| g.pending.remove(&id).is_some())
            .unwrap_or(false)
    }

    fn delete_sync(&self, stream: &str, id: EntryId) -> bool {
        let mut streams = self.streams.lock();
        let Some(state) = streams.get_mut(stream) else {
            return false;
        };
        let pre_len = state.entries.len();

        let removed = state.entries.remove(&id).is_some();

        debug_assert_eq!(
            state.entries.len() + usize::from(removed),
            pre_len,
            "Postcondition violated: delete must remove at most one entry"
        );
        removed
    }

    fn count_sync(&self, stream: &str) -> u64 {
        self.streams
            .lock()
            .get(stream)
            .map(|s| s.entries.len() as u64)
            .unwrap_or(0)
    }

    fn list_streams_sync(&self, prefix: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .streams
            .lock()
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn auto_claim_stale_sync(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        batch_size: usize,
    ) -> Vec<LogEntry> {
        let now = self.clock.now();
        let mut streams = self.streams.lock();
        let Some(state) = streams.get_mut(stream) else {
            return Vec::new();
        };
        let StreamState { entries, groups, .. } = &mut *state;
        let Some(group_state) = groups.get_mut(group) else {
            return Vec::new();
        };

        let stale: Vec<EntryId> = group_state
            .pending
            .iter()
            .filter(|(_, claim)| now.saturating_sub(claim.last_claimed_at) >= min_idle)
            .map(|(id, _)| *id)
            .take(batch_size)
            .collect();

        let mut claimed = Vec::with_capacity(stale.len());
        for id in stale {
            match entries.get(&id) {
                Some(payload) => {
                    if let Some(claim) = group_state.pending.get_mut(&id) {
                        claim.consumer = consumer.to_string();
                        claim.delivery_count += 1;
                        claim.last_claimed_at = now;
                    }
                    claimed.push(LogEntry {
                        id,
                        payload: payload.clone(),
                    });
                }
                None => {
                    group_state.pending.remove(&id);
                }
            }
        }

        state.verify_invariants();
        claimed
    }
}

fn ready<'a, T: Send + 'a>(result: Result<T, StoreError>) -> StoreFuture<'a, T> {
    Box::pin(futures::future::ready(result))
}

impl<C: Clock> LogStore for InMemoryLogStore<C> {
    fn append<'a>(&'a self, stream: &'a str, payload: Bytes) -> StoreFuture<'a, EntryId> {
        ready(Ok(self.append_sync(stream, payload)))
    }

    fn ensure_group<'a>(
        &'a self,
        stream: &'a str,
        group: &'a str,
    ) -> StoreFuture<'a, GroupCreation> {
        ready(Ok(self.ensure_group_sync(stream, group)))
    }

    fn read_unclaimed<'a>(
        &'a self,
        stream: &'a str,
        group: &'a str,
        consumer: &'a str,
        max_count: Option<usize>,
    ) -> StoreFuture<'a, Vec<LogEntry>> {
        ready(self.read_unclaimed_sync(stream, group, consumer, max_count))
    }

    fn list_pending<'a>(
        &'a self,
        stream: &'a str,
        group: &'a str,
        min_idle: Duration,
        after: Option<EntryId>,
        limit: usize,
    ) -> StoreFuture<'a, Vec<PendingInfo>> {
        ready(self.list_pending_sync(stream, group, min_idle, after, limit))
    }

    fn reclaim<'a>(
        &'a self,
        stream: &'a str,
        group: &'a str,
        consumer: &'a str,
        min_idle: Duration,
        id: EntryId,
    ) -> StoreFuture<'a, LogEntry> {
        ready(self.reclaim_sync(stream, group, consumer, min_idle, id))
    }

    fn ack<'a>(&'a self, stream: &'a str, group: &'a str, id: EntryId) -> StoreFuture<'a, bool> {
        ready(Ok(self.ack_sync(stream, group, id)))
    }

    fn delete<'a>(&'a self, stream: &'a str, id: EntryId) -> StoreFuture<'a, bool> {
        ready(Ok(self.delete_sync(stream, id)))
    }

    fn count<'a>(&'a self, stream: &'a str) -> StoreFuture<'a, u64> {
        ready(Ok(self.count_sync(stream)))
    }

    fn list_streams<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<String>> {
        ready(Ok(self.list_streams_sync(prefix)))
    }

    fn auto_claim_stale<'a>(
        &'a self,
        stream: &'a str,
        group: &'a str,
        consumer: &'a str,
        min_idle: Duration,
        batch_size: usize,
    ) -> StoreFuture<'a, Vec<LogEntry>> {
        ready(Ok(self.auto_claim_stale_sync(
            stream, group, consumer, min_idle, batch_size,
        )))
    }
}
