//! Durable Log Store
//!
//! Append-only per-channel streams with consumer-group semantics: a group
//! keeps a delivery cursor plus a pending table recording, for every claimed
//! but unacknowledged entry, the owning consumer, its delivery count and the
//! time of the last claim.
//!
//! Implementations:
//! - `RedisLogStore`: Redis Streams, for production
//! - `InMemoryLogStore`: same semantics in process, for unit tests and DST
//! - `SimulatedLogStore`: fault-injecting wrapper around another store
//!
//! Stores never retry. A connectivity failure surfaces as
//! [`StoreError::Unavailable`] and the caller decides what to do with it.

mod entry_id;
pub mod memory;
pub mod redis_store;
pub mod simulated;

pub use entry_id::{EntryId, ParseEntryIdError};
pub use memory::InMemoryLogStore;
pub use redis_store::{RedisLogStore, RedisStoreConfig};
pub use simulated::{SimulatedLogStore, SimulatedStoreConfig, SimulatedStoreStats};

use bytes::Bytes;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;

/// Boxed future returned by every [`LogStore`] operation
pub type StoreFuture<'a, T> = BoxFuture<'a, Result<T, StoreError>>;

/// One stored webhook occurrence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub id: EntryId,
    pub payload: Bytes,
}

/// A claimed-but-unacknowledged entry as seen in the pending table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInfo {
    pub id: EntryId,
    pub consumer: String,
    pub delivery_count: u64,
    pub idle: Duration,
}

/// Outcome of [`LogStore::ensure_group`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupCreation {
    Created,
    AlreadyExists,
}

impl GroupCreation {
    pub fn created(&self) -> bool {
        matches!(self, GroupCreation::Created)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Backing store unreachable, timed out or refused the connection
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Another consumer moved the entry first, or it is no longer pending
    #[error("lost claim race for entry {0}")]
    ClaimRaced(EntryId),

    /// Group-scoped read against a group that was never created
    #[error("consumer group {group:?} does not exist on stream {stream:?}")]
    MissingGroup { stream: String, group: String },

    /// Reply did not have the shape the command promises
    #[error("unexpected store reply: {0}")]
    Protocol(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Persistent append-only stream abstraction with consumer groups
///
/// All operations except `append` are safe to repeat after an ambiguous
/// network failure. Implementations must make `read_unclaimed`, `reclaim`
/// and `auto_claim_stale` atomic with respect to each other so that two
/// consumers never both own the same entry.
pub trait LogStore: Send + Sync + 'static {
    /// Append `payload`, returning an id greater than every previous id in the stream
    fn append<'a>(&'a self, stream: &'a str, payload: Bytes) -> StoreFuture<'a, EntryId>;

    /// Create `group` on `stream` starting before the first entry; creates the stream if absent
    fn ensure_group<'a>(&'a self, stream: &'a str, group: &'a str)
        -> StoreFuture<'a, GroupCreation>;

    /// Claim up to `max_count` never-delivered entries for `consumer`
    ///
    /// `None` and `Some(0)` both mean no limit, as `COUNT 0` does in Redis.
    fn read_unclaimed<'a>(
        &'a self,
        stream: &'a str,
        group: &'a str,
        consumer: &'a str,
        max_count: Option<usize>,
    ) -> StoreFuture<'a, Vec<LogEntry>>;

    /// Pending entries idle for at least `min_idle`, ascending, strictly after `after`
    fn list_pending<'a>(
        &'a self,
        stream: &'a str,
        group: &'a str,
        min_idle: Duration,
        after: Option<EntryId>,
        limit: usize,
    ) -> StoreFuture<'a, Vec<PendingInfo>>;

    /// Move one pending entry to `consumer` if it is still idle for at least `min_idle`
    fn reclaim<'a>(
        &'a self,
        stream: &'a str,
        group: &'a str,
        consumer: &'a str,
        min_idle: Duration,
        id: EntryId,
    ) -> StoreFuture<'a, LogEntry>;

    /// Drop `id` from the pending table; `false` when it was not pending
    fn ack<'a>(&'a self, stream: &'a str, group: &'a str, id: EntryId) -> StoreFuture<'a, bool>;

    /// Remove `id` from the log; `false` when it did not exist
    fn delete<'a>(&'a self, stream: &'a str, id: EntryId) -> StoreFuture<'a, bool>;

    /// Number of entries currently in the log; zero for an unknown stream
    fn count<'a>(&'a self, stream: &'a str) -> StoreFuture<'a, u64>;

    /// Names of all streams starting with `prefix`
    fn list_streams<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<String>>;

    /// Claim up to `batch_size` entries idle for at least `min_idle`, whoever owns them
    ///
    /// Returns an empty list when the group does not exist.
    fn auto_claim_stale<'a>(
        &'a self,
        stream: &'a str,
        group: &'a str,
        consumer: &'a str,
        min_idle: Duration,
        batch_size: usize,
    ) -> StoreFuture<'a, Vec<LogEntry>>;
}

impl<S: LogStore + ?Sized> LogStore for Arc<S> {
    fn append<'a>(&'a self, stream: &'a str, payload: Bytes) -> StoreFuture<'a, EntryId> {
        (**self).append(stream, payload)
    }

    fn ensure_group<'a>(
        &'a self,
        stream: &'a str,
        group: &'a str,
    ) -> StoreFuture<'a, GroupCreation> {
        (**self).ensure_group(stream, group)
    }

    fn read_unclaimed<'a>(
        &'a self,
        stream: &'a str,
        group: &'a str,
        consumer: &'a str,
        max_count: Option<usize>,
    ) -> StoreFuture<'a, Vec<LogEntry>> {
        (**self).read_unclaimed(stream, group, consumer, max_count)
    }

    fn list_pending<'a>(
        &'a self,
        stream: &'a str,
        group: &'a str,
        min_idle: Duration,
        after: Option<EntryId>,
        limit: usize,
    ) -> StoreFuture<'a, Vec<PendingInfo>> {
        (**self).list_pending(stream, group, min_idle, after, limit)
    }

    fn reclaim<'a>(
        &'a self,
        stream: &'a str,
        group: &'a str,
        consumer: &'a str,
        min_idle: Duration,
        id: EntryId,
    ) -> StoreFuture<'a, LogEntry> {
        (**self).reclaim(stream, group, consumer, min_idle, id)
    }

    fn ack<'a>(&'a self, stream: &'a str, group: &'a str, id: EntryId) -> StoreFuture<'a, bool> {
        (**self).ack(stream, group, id)
    }

    fn delete<'a>(&'a self, stream: &'a str, id: EntryId) -> StoreFuture<'a, bool> {
        (**self).delete(stream, id)
    }

    fn count<'a>(&'a self, stream: &'a str) -> StoreFuture<'a, u64> {
        (**self).count(stream)
    }

    fn list_streams<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<String>> {
        (**self).list_streams(prefix)
    }

    fn auto_claim_stale<'a>(
        &'a self,
        stream: &'a str,
        group: &'a str,
        consumer: &'a str,
        min_idle: Duration,
        batch_size: usize,
    ) -> StoreFuture<'a, Vec<LogEntry>> {
        (**self).auto_claim_stale(stream, group, consumer, min_idle, batch_size)
    }
}
