//! Simulated Log Store with Fault Injection
//!
//! DST wrapper that injects connectivity failures using buggify before
//! delegating to an inner store. A failed call never reaches the inner store,
//! with one exception: an "ambiguous append" applies the write and then
//! reports `Unavailable`, the way a lost reply looks to a real client.

use super::{EntryId, GroupCreation, LogEntry, LogStore, PendingInfo, StoreError, StoreFuture};
use crate::simulation::{buggify, faults, Rng};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Fault probabilities per operation class
#[derive(Debug, Clone)]
pub struct SimulatedStoreConfig {
    /// Probability that XADD fails before writing
    pub append_fail_prob: f64,
    /// Probability that XADD writes but the reply is lost
    pub ambiguous_append_prob: f64,
    /// Probability of failure for group reads, pending listing and counts
    pub read_fail_prob: f64,
    /// Probability of failure for reclaim and auto-claim
    pub claim_fail_prob: f64,
    pub ack_fail_prob: f64,
    pub delete_fail_prob: f64,
    /// Probability of failure for stream enumeration
    pub scan_fail_prob: f64,
}

impl Default for SimulatedStoreConfig {
    fn default() -> Self {
        SimulatedStoreConfig {
            append_fail_prob: 0.01,       // 1%
            ambiguous_append_prob: 0.005, // 0.5%
            read_fail_prob: 0.01,         // 1%
            claim_fail_prob: 0.01,        // 1%
            ack_fail_prob: 0.01,          // 1%
            delete_fail_prob: 0.01,       // 1%
            scan_fail_prob: 0.02,         // 2%
        }
    }
}

impl SimulatedStoreConfig {
    /// High chaos configuration for stress testing
    pub fn high_chaos() -> Self {
        SimulatedStoreConfig {
            append_fail_prob: 0.05,
            ambiguous_append_prob: 0.02,
            read_fail_prob: 0.05,
            claim_fail_prob: 0.05,
            ack_fail_prob: 0.05,
            delete_fail_prob: 0.05,
            scan_fail_prob: 0.05,
        }
    }

    /// No faults - for baseline testing
    pub fn no_faults() -> Self {
        SimulatedStoreConfig {
            append_fail_prob: 0.0,
            ambiguous_append_prob: 0.0,
            read_fail_prob: 0.0,
            claim_fail_prob: 0.0,
            ack_fail_prob: 0.0,
            delete_fail_prob: 0.0,
            scan_fail_prob: 0.0,
        }
    }
}

/// Counters for injected faults
#[derive(Debug, Clone, Default)]
pub struct SimulatedStoreStats {
    pub append_attempts: u64,
    pub append_failures: u64,
    pub ambiguous_appends: u64,
    pub read_attempts: u64,
    pub read_failures: u64,
    pub claim_attempts: u64,
    pub claim_failures: u64,
    pub ack_attempts: u64,
    pub ack_failures: u64,
    pub delete_attempts: u64,
    pub delete_failures: u64,
    pub scan_attempts: u64,
    pub scan_failures: u64,
}

impl SimulatedStoreStats {
    pub fn total_failures(&self) -> u64 {
        self.append_failures
            + self.ambiguous_appends
            + self.read_failures
            + self.claim_failures
            + self.ack_failures
            + self.delete_failures
            + self.scan_failures
    }
}

#[derive(Clone, Copy)]
enum OpClass {
    Read,
    Claim,
    Ack,
    Delete,
    Scan,
}

struct SimulatedStoreInner<R: Rng> {
    rng: R,
    stats: SimulatedStoreStats,
}

/// Log store that wraps another store and injects faults
pub struct SimulatedLogStore<S: LogStore, R: Rng> {
    inner_store: S,
    config: SimulatedStoreConfig,
    state: Arc<Mutex<SimulatedStoreInner<R>>>,
}

impl<S: LogStore + Clone, R: Rng> Clone for SimulatedLogStore<S, R> {
    fn clone(&self) -> Self {
        SimulatedLogStore {
            inner_store: self.inner_store.clone(),
            config: self.config.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<S: LogStore, R: Rng> SimulatedLogStore<S, R> {
    pub fn new(inner_store: S, rng: R, config: SimulatedStoreConfig) -> Self {
        SimulatedLogStore {
            inner_store,
            config,
            state: Arc::new(Mutex::new(SimulatedStoreInner {
                rng,
                stats: SimulatedStoreStats::default(),
            })),
        }
    }

    pub fn stats(&self) -> SimulatedStoreStats {
        self.state.lock().stats.clone()
    }

    /// The wrapped store, for inspecting state without fault injection
    pub fn inner(&self) -> &S {
        &self.inner_store
    }

    /// Roll the dice for one call; `Err` means the call must not proceed
    fn inject(&self, class: OpClass) -> Result<(), StoreError> {
        let mut guard = self.state.lock();
        let SimulatedStoreInner { rng, stats } = &mut *guard;
        let (fault, prob, attempts, failures) = match class {
            OpClass::Read => (
                faults::READ_UNAVAILABLE,
                self.config.read_fail_prob,
                &mut stats.read_attempts,
                &mut stats.read_failures,
            ),
            OpClass::Claim => (
                faults::CLAIM_UNAVAILABLE,
                self.config.claim_fail_prob,
                &mut stats.claim_attempts,
                &mut stats.claim_failures,
            ),
            OpClass::Ack => (
                faults::ACK_UNAVAILABLE,
                self.config.ack_fail_prob,
                &mut stats.ack_attempts,
                &mut stats.ack_failures,
            ),
            OpClass::Delete => (
                faults::DELETE_UNAVAILABLE,
                self.config.delete_fail_prob,
                &mut stats.delete_attempts,
                &mut stats.delete_failures,
            ),
            OpClass::Scan => (
                faults::SCAN_UNAVAILABLE,
                self.config.scan_fail_prob,
                &mut stats.scan_attempts,
                &mut stats.scan_failures,
            ),
        };
        *attempts += 1;
        if buggify(rng, fault, prob) {
            *failures += 1;
            return Err(StoreError::Unavailable(format!("injected fault: {}", fault)));
        }
        Ok(())
    }

    fn fail<'a, T: Send + 'a>(err: StoreError) -> StoreFuture<'a, T> {
        Box::pin(futures::future::ready(Err(err)))
    }
}

impl<S: LogStore, R: Rng> LogStore for SimulatedLogStore<S, R> {
    fn append<'a>(&'a self, stream: &'a str, payload: Bytes) -> StoreFuture<'a, EntryId> {
        let ambiguous = {
            let mut guard = self.state.lock();
            let SimulatedStoreInner { rng, stats } = &mut *guard;
            stats.append_attempts += 1;
            if buggify(rng, faults::APPEND_UNAVAILABLE, self.config.append_fail_prob) {
                stats.append_failures += 1;
                return Self::fail(StoreError::Unavailable(format!(
                    "injected fault: {}",
                    faults::APPEND_UNAVAILABLE
                )));
            }
            let ambiguous = buggify(
                rng,
                faults::APPEND_REPLY_LOST,
                self.config.ambiguous_append_prob,
            );
            if ambiguous {
                stats.ambiguous_appends += 1;
            }
            ambiguous
        };

        Box::pin(async move {
            let id = self.inner_store.append(stream, payload).await?;
            if ambiguous {
                return Err(StoreError::Unavailable(format!(
                    "injected fault: {} after writing {}",
                    faults::APPEND_REPLY_LOST,
                    id
                )));
            }
            Ok(id)
        })
    }

    fn ensure_group<'a>(
        &'a self,
        stream: &'a str,
        group: &'a str,
    ) -> StoreFuture<'a, GroupCreation> {
        match self.inject(OpClass::Read) {
            Ok(()) => self.inner_store.ensure_group(stream, group),
            Err(e) => Self::fail(e),
        }
    }

    fn read_unclaimed<'a>(
        &'a self,
        stream: &'a str,
        group: &'a str,
        consumer: &'a str,
        max_count: Option<usize>,
    ) -> StoreFuture<'a, Vec<LogEntry>> {
        match self.inject(OpClass::Read) {
            Ok(()) => self
                .inner_store
                .read_unclaimed(stream, group, consumer, max_count),
            Err(e) => Self::fail(e),
        }
    }

    fn list_pending<'a>(
        &'a self,
        stream: &'a str,
        group: &'a str,
        min_idle: Duration,
        after: Option<EntryId>,
        limit: usize,
    ) -> StoreFuture<'a, Vec<PendingInfo>> {
        match self.inject(OpClass::Read) {
            Ok(()) => self
                .inner_store
                .list_pending(stream, group, min_idle, after, limit),
            Err(e) => Self::fail(e),
        }
    }

    fn reclaim<'a>(
        &'a self,
        stream: &'a str,
        group: &'a str,
        consumer: &'a str,
        min_idle: Duration,
        id: EntryId,
    ) -> StoreFuture<'a, LogEntry> {
        match self.inject(OpClass::Claim) {
            Ok(()) => self
                .inner_store
                .reclaim(stream, group, consumer, min_idle, id),
            Err(e) => Self::fail(e),
        }
    }

    fn ack<'a>(&'a self, stream: &'a str, group: &'a str, id: EntryId) -> StoreFuture<'a, bool> {
        match self.inject(OpClass::Ack) {
            Ok(()) => self.inner_store.ack(stream, group, id),
            Err(e) => Self::fail(e),
        }
    }

    fn delete<'a>(&'a self, stream: &'a str, id: EntryId) -> StoreFuture<'a, bool> {
        match self.inject(OpClass::Delete) {
            Ok(()) => self.inner_store.delete(stream, id),
            Err(e) => Self::fail(e),
        }
    }

    fn count<'a>(&'a self, stream: &'a str) -> StoreFuture<'a, u64> {
        match self.inject(OpClass::Read) {
            Ok(()) => self.inner_store.count(stream),
            Err(e) => Self::fail(e),
        }
    }

    fn list_streams<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<String>> {
        match self.inject(OpClass::Scan) {
            Ok(()) => self.inner_store.list_streams(prefix),
            Err(e) => Self::fail(e),
        }
    }

    fn auto_claim_stale<'a>(
        &'a self,
        stream: &'a str,
        group: &'a str,
        consumer: &'a str,
        min_idle: Duration,
        batch_size: usize,
    ) -> StoreFuture<'a, Vec<LogEntry>> {
        match self.inject(OpClass::Claim) {
            Ok(()) => self
                .inner_store
                .auto_claim_stale(stream, group, consumer, min_idle, batch_size),
            Err(e) => Self::fail(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimulatedClock;
    use crate::simulation::SimulatedRng;
    use crate::store::InMemoryLogStore;
    use futures::executor::block_on;

    type TestStore = SimulatedLogStore<InMemoryLogStore<SimulatedClock>, SimulatedRng>;

    fn store(config: SimulatedStoreConfig) -> TestStore {
        SimulatedLogStore::new(
            InMemoryLogStore::new(SimulatedClock::new(1_000)),
            SimulatedRng::new(42),
            config,
        )
    }

    #[test]
    fn test_no_faults_passes_through() {
        let store = store(SimulatedStoreConfig::no_faults());
        block_on(async {
            store.ensure_group("s", "g").await.unwrap();
            for i in 0..50u8 {
                store.append("s", Bytes::from(vec![i])).await.unwrap();
            }
            assert_eq!(store.count("s").await.unwrap(), 50);
        });
        let stats = store.stats();
        assert_eq!(stats.append_attempts, 50);
        assert_eq!(stats.total_failures(), 0);
    }

    #[test]
    fn test_failed_append_is_not_applied() {
        let config = SimulatedStoreConfig {
            append_fail_prob: 1.0,
            ..SimulatedStoreConfig::no_faults()
        };
        let store = store(config);
        block_on(async {
            let err = store.append("s", Bytes::from_static(b"x")).await.unwrap_err();
            assert!(err.is_unavailable());
            assert_eq!(store.inner().count("s").await.unwrap(), 0);
        });
        assert_eq!(store.stats().append_failures, 1);
    }

    #[test]
    fn test_ambiguous_append_is_applied() {
        let config = SimulatedStoreConfig {
            ambiguous_append_prob: 1.0,
            ..SimulatedStoreConfig::no_faults()
        };
        let store = store(config);
        block_on(async {
            let err = store.append("s", Bytes::from_static(b"x")).await.unwrap_err();
            assert!(err.is_unavailable());
            assert_eq!(store.inner().count("s").await.unwrap(), 1);
        });
        assert_eq!(store.stats().ambiguous_appends, 1);
    }

    #[test]
    fn test_failed_ack_leaves_pending() {
        let config = SimulatedStoreConfig {
            ack_fail_prob: 1.0,
            ..SimulatedStoreConfig::no_faults()
        };
        let store = store(config);
        block_on(async {
            store.ensure_group("s", "g").await.unwrap();
            let id = store.append("s", Bytes::from_static(b"x")).await.unwrap();
            store.read_unclaimed("s", "g", "c", None).await.unwrap();
            assert!(store.ack("s", "g", id).await.is_err());
            assert_eq!(store.inner().pending_len("s", "g"), 1);
        });
    }

    #[test]
    fn test_same_seed_same_faults() {
        let run = || {
            let store = store(SimulatedStoreConfig::high_chaos());
            block_on(async {
                let mut outcomes = Vec::new();
                for _ in 0..200 {
                    outcomes.push(store.count("s").await.is_ok());
                }
                outcomes
            })
        };
        assert_eq!(run(), run());
    }
}
