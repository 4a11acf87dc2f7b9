//! Deterministic Simulation Testing for the webhook queue
//!
//! Shadow-state harness that drives a seeded random workload of enqueues,
//! polls by several consumers, acknowledgements, consumer crashes, time
//! advances and reaper sweeps against a fault-injecting in-memory store.
//!
//! Checked after every poll, against the store's pending table as it was
//! just before the poll:
//! - a consumer never reclaims its own entries
//! - reclaimed entries were idle for at least `max_idle_ms`
//! - entries at `max_delivery_count` are never handed out again
//! - reclaimed entries precede new ones, each run ascending
//! - every returned entry is owned by the poller afterwards
//! - acknowledged entries are never redelivered
//!
//! Checked at the end of a run:
//! - no entry in the log that ingress never submitted
//! - accepted webhooks only disappear through acknowledgement or reaping
//! - one fault-free sweep after `reaper_min_idle_ms` empties every pending table
//!
//! ```text
//! for seed in 0..N {
//!     let mut harness = QueueDSTHarness::new(QueueDSTConfig::chaos(seed));
//!     harness.run(500).await;
//!     harness.check_invariants().await;  // violations carry the seed
//! }
//! ```

use crate::clock::SimulatedClock;
use crate::queue::{
    PollOptions, QueueError, Reaper, ReaperConfig, WebhookMessage, WebhookQueue,
    WebhookStreamObject,
};
use crate::simulation::{Rng, SimulatedRng};
use crate::store::{
    EntryId, InMemoryLogStore, LogStore, PendingInfo, SimulatedLogStore, SimulatedStoreConfig,
    SimulatedStoreStats,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

const PREFIX: &str = "dst";
const GROUP: &str = "dst-workers";
const REAPER_CONSUMER: &str = "dst-reaper";

/// Configuration for queue DST
#[derive(Debug, Clone)]
pub struct QueueDSTConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// Store fault configuration
    pub store_config: SimulatedStoreConfig,
    pub channels: usize,
    pub consumers: usize,
    pub max_idle_ms: u64,
    pub max_delivery_count: u64,
    /// Upper bound for a poll's `max_count`; 0 draws are "unlimited"
    pub max_poll_count: usize,
    pub reaper_min_idle_ms: u64,
    pub reaper_batch_size: usize,
    /// Largest single clock advance
    pub max_time_step_ms: u64,
    /// Chance that a crash slot actually crashes a consumer
    pub crash_probability: f64,
}

impl Default for QueueDSTConfig {
    fn default() -> Self {
        QueueDSTConfig {
            seed: 0,
            store_config: SimulatedStoreConfig::default(),
            channels: 3,
            consumers: 4,
            max_idle_ms: 1_000,
            max_delivery_count: 3,
            max_poll_count: 5,
            reaper_min_idle_ms: 5_000,
            reaper_batch_size: 20,
            max_time_step_ms: 600,
            crash_probability: 0.3,
        }
    }
}

impl QueueDSTConfig {
    pub fn new(seed: u64) -> Self {
        QueueDSTConfig {
            seed,
            ..Default::default()
        }
    }

    /// Calm mode - no faults, no crashes
    pub fn calm(seed: u64) -> Self {
        QueueDSTConfig {
            seed,
            store_config: SimulatedStoreConfig::no_faults(),
            crash_probability: 0.0,
            ..Default::default()
        }
    }

    /// Moderate fault injection
    pub fn moderate(seed: u64) -> Self {
        QueueDSTConfig {
            seed,
            store_config: SimulatedStoreConfig::default(),
            crash_probability: 0.3,
            ..Default::default()
        }
    }

    /// Chaos mode - aggressive faults, frequent crashes, tight idle window
    pub fn chaos(seed: u64) -> Self {
        QueueDSTConfig {
            seed,
            store_config: SimulatedStoreConfig::high_chaos(),
            crash_probability: 0.7,
            max_idle_ms: 300,
            max_delivery_count: 2,
            reaper_min_idle_ms: 2_000,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub enum QueueOperation {
    Enqueue { channel: usize },
    Poll {
        consumer: usize,
        channel: usize,
        max_count: Option<usize>,
    },
    /// Acknowledge one of the messages the consumer holds
    Ack { consumer: usize },
    /// Consumer forgets everything it holds without acknowledging
    Crash { consumer: usize },
    AdvanceTime { ms: u64 },
    Sweep,
}

/// Seeded operation generator
pub struct QueueWorkload {
    config: QueueDSTConfig,
    rng: SimulatedRng,
}

impl QueueWorkload {
    pub fn new(config: QueueDSTConfig) -> Self {
        let rng = SimulatedRng::new(config.seed);
        QueueWorkload { config, rng }
    }

    pub fn next_operation(&mut self) -> QueueOperation {
        let channel = self.rng.gen_range(0, self.config.channels as u64) as usize;
        let consumer = self.rng.gen_range(0, self.config.consumers as u64) as usize;

        match self.rng.gen_range(0, 100) {
            0..=29 => QueueOperation::Enqueue { channel },
            30..=54 => QueueOperation::Poll {
                consumer,
                channel,
                max_count: self.next_max_count(),
            },
            55..=74 => QueueOperation::Ack { consumer },
            75..=86 => QueueOperation::AdvanceTime {
                ms: self.rng.gen_range(1, self.config.max_time_step_ms + 1),
            },
            87..=91 => QueueOperation::Sweep,
            _ => {
                if self.rng.gen_bool(self.config.crash_probability) {
                    QueueOperation::Crash { consumer }
                } else {
                    QueueOperation::Poll {
                        consumer,
                        channel,
                        max_count: self.next_max_count(),
                    }
                }
            }
        }
    }

    /// Index in `[0, len)`; callers guarantee `len > 0`
    pub fn pick(&mut self, len: usize) -> usize {
        self.rng.gen_range(0, len as u64) as usize
    }

    fn next_max_count(&mut self) -> Option<usize> {
        match self.rng.gen_range(0, self.config.max_poll_count as u64 + 1) {
            0 => None,
            n => Some(n as usize),
        }
    }
}

/// Result of a DST run
#[derive(Debug, Clone)]
pub struct QueueDSTResult {
    pub seed: u64,
    pub total_operations: u64,
    pub successful_operations: u64,
    /// Operations that failed with an injected fault
    pub failed_operations: u64,
    pub enqueued: u64,
    pub delivered: u64,
    pub acknowledged: u64,
    pub reaped: u64,
    pub crashes: u64,
    pub sweeps: u64,
    pub store_stats: SimulatedStoreStats,
    pub invariant_violations: Vec<String>,
}

impl QueueDSTResult {
    pub fn new(seed: u64) -> Self {
        QueueDSTResult {
            seed,
            total_operations: 0,
            successful_operations: 0,
            failed_operations: 0,
            enqueued: 0,
            delivered: 0,
            acknowledged: 0,
            reaped: 0,
            crashes: 0,
            sweeps: 0,
            store_stats: SimulatedStoreStats::default(),
            invariant_violations: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.invariant_violations.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "Seed {}: {} ops ({} ok, {} failed), {} enqueued, {} delivered, {} acked, {} reaped, {} crashes, {} violations",
            self.seed,
            self.total_operations,
            self.successful_operations,
            self.failed_operations,
            self.enqueued,
            self.delivered,
            self.acknowledged,
            self.reaped,
            self.crashes,
            self.invariant_violations.len()
        )
    }
}

#[derive(Debug, Clone)]
struct HeldMessage {
    channel: usize,
    id: EntryId,
    request_id: String,
}

/// What the outside world knows, independent of the store
#[derive(Debug, Default)]
struct ShadowState {
    /// Enqueues the queue confirmed: request id -> channel
    accepted: HashMap<String, usize>,
    /// Enqueues that failed; the entry may or may not exist
    unconfirmed: HashSet<String>,
    /// Fully acknowledged and removed
    completed: HashSet<String>,
    /// Acknowledgements whose outcome was not a clean success
    ambiguous_removals: u64,
    /// Messages each consumer believes it is working on
    held: Vec<Vec<HeldMessage>>,
}

type DSTStore = SimulatedLogStore<InMemoryLogStore<SimulatedClock>, SimulatedRng>;

enum Outcome {
    Success,
    Failed,
}

/// Main DST harness for the webhook queue
pub struct QueueDSTHarness {
    config: QueueDSTConfig,
    clock: SimulatedClock,
    inner_store: InMemoryLogStore<SimulatedClock>,
    store: Arc<DSTStore>,
    queue: WebhookQueue<DSTStore>,
    reaper: Reaper<DSTStore>,
    workload: QueueWorkload,
    shadow: ShadowState,
    result: QueueDSTResult,
    next_request: u64,
}

impl QueueDSTHarness {
    pub fn new(config: QueueDSTConfig) -> Self {
        let clock = SimulatedClock::new(1_700_000_000_000);
        let inner_store = InMemoryLogStore::new(clock.clone());
        // Different seed for the store so faults and workload are independent.
        let rng = SimulatedRng::new(config.seed.wrapping_add(1));
        let store = Arc::new(SimulatedLogStore::new(
            inner_store.clone(),
            rng,
            config.store_config.clone(),
        ));

        let queue = WebhookQueue::new(Arc::clone(&store), PREFIX, GROUP);
        let reaper = Reaper::new(Arc::clone(&store), Self::reaper_config(&config));

        let shadow = ShadowState {
            held: vec![Vec::new(); config.consumers],
            ..Default::default()
        };

        QueueDSTHarness {
            workload: QueueWorkload::new(config.clone()),
            result: QueueDSTResult::new(config.seed),
            config,
            clock,
            inner_store,
            store,
            queue,
            reaper,
            shadow,
            next_request: 0,
        }
    }

    fn reaper_config(config: &QueueDSTConfig) -> ReaperConfig {
        ReaperConfig {
            stream_prefix: PREFIX.to_string(),
            group: GROUP.to_string(),
            consumer: REAPER_CONSUMER.to_string(),
            min_idle: Duration::from_millis(config.reaper_min_idle_ms),
            batch_size: config.reaper_batch_size,
            interval: Duration::from_millis(1_000),
        }
    }

    fn channel_id(channel: usize) -> String {
        format!("channel-{}", channel)
    }

    fn consumer_name(consumer: usize) -> String {
        format!("consumer-{}", consumer)
    }

    fn stream(channel: usize) -> String {
        format!("{}:{}", PREFIX, Self::channel_id(channel))
    }

    fn violation(&mut self, message: String) {
        self.result
            .invariant_violations
            .push(format!("seed {}: {}", self.config.seed, message));
    }

    /// Run the workload for a specified number of operations
    pub async fn run(&mut self, operations: usize) {
        for _ in 0..operations {
            let op = self.workload.next_operation();
            self.execute_operation(op).await;
        }
        self.result.store_stats = self.store.stats();
    }

    async fn execute_operation(&mut self, op: QueueOperation) {
        self.result.total_operations += 1;

        let outcome = match op {
            QueueOperation::Enqueue { channel } => self.execute_enqueue(channel).await,
            QueueOperation::Poll {
                consumer,
                channel,
                max_count,
            } => self.execute_poll(consumer, channel, max_count).await,
            QueueOperation::Ack { consumer } => self.execute_ack(consumer).await,
            QueueOperation::Crash { consumer } => {
                self.shadow.held[consumer].clear();
                self.result.crashes += 1;
                Outcome::Success
            }
            QueueOperation::AdvanceTime { ms } => {
                self.clock.advance_ms(ms);
                Outcome::Success
            }
            QueueOperation::Sweep => self.execute_sweep().await,
        };

        match outcome {
            Outcome::Success => self.result.successful_operations += 1,
            Outcome::Failed => self.result.failed_operations += 1,
        }
    }

    async fn execute_enqueue(&mut self, channel: usize) -> Outcome {
        self.next_request += 1;
        let request_id = format!("req-{}-{}", self.config.seed, self.next_request);
        let object = WebhookStreamObject {
            request_id: request_id.clone(),
            signature: "dst-signature".to_string(),
            destination: "dst-destination".to_string(),
            events: vec![serde_json::json!({ "seq": self.next_request })],
        };

        match self.queue.enqueue(&Self::channel_id(channel), &object).await {
            Ok(_) => {
                self.shadow.accepted.insert(request_id, channel);
                self.result.enqueued += 1;
                Outcome::Success
            }
            Err(_) => {
                self.shadow.unconfirmed.insert(request_id);
                Outcome::Failed
            }
        }
    }

    /// Pending table as the store sees it, bypassing fault injection
    async fn pending_snapshot(&self, stream: &str) -> HashMap<EntryId, PendingInfo> {
        self.inner_store
            .list_pending(stream, GROUP, Duration::ZERO, None, usize::MAX)
            .await
            .map(|pending| pending.into_iter().map(|p| (p.id, p)).collect())
            .unwrap_or_default()
    }

    async fn execute_poll(
        &mut self,
        consumer: usize,
        channel: usize,
        max_count: Option<usize>,
    ) -> Outcome {
        let stream = Self::stream(channel);
        let name = Self::consumer_name(consumer);
        let before = self.pending_snapshot(&stream).await;
        let options = PollOptions {
            max_count,
            max_idle_time_ms: self.config.max_idle_ms,
            max_delivery_count: self.config.max_delivery_count,
        };

        let messages = match self
            .queue
            .poll_ready(&Self::channel_id(channel), &name, options)
            .await
        {
            Ok(messages) => messages,
            Err(_) => return Outcome::Failed,
        };

        self.check_poll(&stream, &name, max_count, &before, &messages);
        self.result.delivered += messages.len() as u64;
        for message in messages {
            self.shadow.held[consumer].push(HeldMessage {
                channel,
                id: message.message_id,
                request_id: message.request_id,
            });
        }
        Outcome::Success
    }

    fn check_poll(
        &mut self,
        stream: &str,
        consumer: &str,
        max_count: Option<usize>,
        before: &HashMap<EntryId, PendingInfo>,
        messages: &[WebhookMessage],
    ) {
        if let Some(max) = max_count.filter(|&n| n > 0) {
            if messages.len() > max {
                self.violation(format!(
                    "poll by {} returned {} messages, max_count {}",
                    consumer,
                    messages.len(),
                    max
                ));
            }
        }

        let max_idle = Duration::from_millis(self.config.max_idle_ms);
        let mut seen_new = false;
        let mut last_reclaimed: Option<EntryId> = None;
        let mut last_new: Option<EntryId> = None;

        for message in messages {
            let id = message.message_id;
            if self.shadow.completed.contains(&message.request_id) {
                self.violation(format!("acknowledged {} redelivered", message.request_id));
            }

            match before.get(&id) {
                Some(pending) => {
                    if seen_new {
                        self.violation(format!("reclaimed {} returned after new entries", id));
                    }
                    if pending.consumer == consumer {
                        self.violation(format!("{} reclaimed its own entry {}", consumer, id));
                    }
                    if pending.idle < max_idle {
                        self.violation(format!(
                            "{} reclaimed after {:?}, threshold {:?}",
                            id, pending.idle, max_idle
                        ));
                    }
                    if pending.delivery_count >= self.config.max_delivery_count {
                        self.violation(format!(
                            "{} delivered again after {} deliveries",
                            id, pending.delivery_count
                        ));
                    }
                    if last_reclaimed.is_some_and(|last| last >= id) {
                        self.violation(format!("reclaimed entries out of order at {}", id));
                    }
                    last_reclaimed = Some(id);
                }
                None => {
                    seen_new = true;
                    if last_new.is_some_and(|last| last >= id) {
                        self.violation(format!("new entries out of order at {}", id));
                    }
                    last_new = Some(id);
                }
            }

            match self.inner_store.pending_owner(stream, GROUP, id) {
                Some((owner, _)) if owner == consumer => {}
                other => self.violation(format!(
                    "{} returned to {} but owned by {:?}",
                    id, consumer, other
                )),
            }
        }
    }

    async fn execute_ack(&mut self, consumer: usize) -> Outcome {
        if self.shadow.held[consumer].is_empty() {
            return Outcome::Success;
        }
        let index = self.workload.pick(self.shadow.held[consumer].len());
        let held = self.shadow.held[consumer].swap_remove(index);

        match self
            .queue
            .acknowledge_and_remove(&Self::channel_id(held.channel), held.id)
            .await
        {
            Ok(()) => {
                self.shadow.completed.insert(held.request_id);
                self.result.acknowledged += 1;
                Outcome::Success
            }
            Err(QueueError::NotFound { .. }) => {
                // Reclaimed and finished elsewhere, or reaped.
                self.shadow.ambiguous_removals += 1;
                Outcome::Success
            }
            Err(_) => {
                self.shadow.ambiguous_removals += 1;
                self.shadow.held[consumer].push(held);
                Outcome::Failed
            }
        }
    }

    async fn execute_sweep(&mut self) -> Outcome {
        self.result.sweeps += 1;
        match self.reaper.sweep().await {
            Some(report) => {
                self.result.reaped += report.deleted as u64;
                if report.failures > 0 {
                    Outcome::Failed
                } else {
                    Outcome::Success
                }
            }
            None => {
                self.violation("sweep skipped with no sweep in flight".to_string());
                Outcome::Failed
            }
        }
    }

    /// End-of-run checks; violations are recorded in the result
    pub async fn check_invariants(&mut self) {
        let mut present: HashSet<String> = HashSet::new();

        for channel in 0..self.config.channels {
            let stream = Self::stream(channel);
            let entries = self.inner_store.entries(&stream);

            let count = self.inner_store.count(&stream).await.unwrap_or(0);
            if count != entries.len() as u64 {
                self.violation(format!(
                    "{} count {} but {} entries",
                    stream,
                    count,
                    entries.len()
                ));
            }

            for entry in entries {
                let object = match serde_json::from_slice::<WebhookStreamObject>(&entry.payload) {
                    Ok(object) => object,
                    Err(e) => {
                        self.violation(format!("{} holds undecodable {}: {}", stream, entry.id, e));
                        continue;
                    }
                };
                let request_id = object.request_id;
                let known = self.shadow.accepted.get(&request_id) == Some(&channel)
                    || self.shadow.unconfirmed.contains(&request_id);
                if !known {
                    self.violation(format!("phantom {} in {}", request_id, stream));
                }
                if self.shadow.completed.contains(&request_id) {
                    self.violation(format!("acknowledged {} still in {}", request_id, stream));
                }
                present.insert(request_id);
            }
        }

        let missing = self
            .shadow
            .accepted
            .keys()
            .filter(|id| !self.shadow.completed.contains(*id) && !present.contains(*id))
            .count() as u64;
        let accounted = self.result.reaped + self.shadow.ambiguous_removals;
        if missing > accounted {
            self.violation(format!(
                "{} accepted webhooks vanished, only {} removals accounted for",
                missing, accounted
            ));
        }

        self.check_reaper_convergence().await;
    }

    /// Once everything is stale, one fault-free sweep must empty every pending table
    async fn check_reaper_convergence(&mut self) {
        self.clock.advance_ms(self.config.reaper_min_idle_ms);

        let pending_total: usize = (0..self.config.channels)
            .map(|channel| self.inner_store.pending_len(&Self::stream(channel), GROUP))
            .sum();
        let config = ReaperConfig {
            batch_size: pending_total.max(1),
            ..Self::reaper_config(&self.config)
        };
        let reaper = Reaper::new(Arc::new(self.inner_store.clone()), config);

        match reaper.sweep().await {
            Some(report) if report.failures == 0 => {}
            Some(report) => self.violation(format!("fault-free sweep failed: {:?}", report)),
            None => self.violation("fault-free sweep skipped".to_string()),
        }

        for channel in 0..self.config.channels {
            let stream = Self::stream(channel);
            let left = self.inner_store.pending_len(&stream, GROUP);
            if left > 0 {
                self.violation(format!("{} still has {} pending after sweep", stream, left));
            }
        }
    }

    pub fn result(&self) -> &QueueDSTResult {
        &self.result
    }

    pub fn into_result(self) -> QueueDSTResult {
        self.result
    }
}

/// Run a batch of DST tests with different seeds
pub async fn run_dst_batch(
    base_seed: u64,
    count: usize,
    ops_per_run: usize,
    config_fn: impl Fn(u64) -> QueueDSTConfig,
) -> Vec<QueueDSTResult> {
    let mut results = Vec::with_capacity(count);

    for i in 0..count {
        let seed = base_seed + i as u64;
        let mut harness = QueueDSTHarness::new(config_fn(seed));
        harness.run(ops_per_run).await;
        harness.check_invariants().await;
        results.push(harness.into_result());
    }

    results
}

/// Summary of batch results
pub fn summarize_batch(results: &[QueueDSTResult]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.is_success()).count();
    let failed_seeds: Vec<u64> = results
        .iter()
        .filter(|r| !r.is_success())
        .map(|r| r.seed)
        .collect();

    let total_ops: u64 = results.iter().map(|r| r.total_operations).sum();
    let total_delivered: u64 = results.iter().map(|r| r.delivered).sum();
    let total_reaped: u64 = results.iter().map(|r| r.reaped).sum();
    let total_faults: u64 = results.iter().map(|r| r.store_stats.total_failures()).sum();

    let mut summary = format!(
        "Batch: {}/{} passed, {} total ops, {} delivered, {} reaped, {} injected faults",
        passed, total, total_ops, total_delivered, total_reaped, total_faults
    );

    if !failed_seeds.is_empty() {
        summary.push_str(&format!("\nFailed seeds: {:?}", failed_seeds));
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dst_harness_calm() {
        let mut harness = QueueDSTHarness::new(QueueDSTConfig::calm(42));
        harness.run(300).await;
        harness.check_invariants().await;

        let result = harness.result();
        assert!(
            result.is_success(),
            "Calm mode should not have invariant violations: {:?}",
            result.invariant_violations
        );
        assert_eq!(result.failed_operations, 0);
        assert!(result.delivered > 0);
    }

    #[tokio::test]
    async fn test_dst_harness_with_faults() {
        let mut harness = QueueDSTHarness::new(QueueDSTConfig::moderate(123));
        harness.run(300).await;
        harness.check_invariants().await;

        let result = harness.result();
        assert!(result.is_success(), "{:?}", result.invariant_violations);
    }

    #[tokio::test]
    async fn test_dst_same_seed_same_run() {
        let run = || async {
            let mut harness = QueueDSTHarness::new(QueueDSTConfig::chaos(7));
            harness.run(200).await;
            harness.into_result().summary()
        };
        assert_eq!(run().await, run().await);
    }

    #[tokio::test]
    async fn test_summarize_batch_lists_failed_seeds() {
        let mut failed = QueueDSTResult::new(9);
        failed.invariant_violations.push("boom".to_string());
        let summary = summarize_batch(&[QueueDSTResult::new(8), failed]);
        assert!(summary.starts_with("Batch: 1/2 passed"));
        assert!(summary.contains("Failed seeds: [9]"));
    }
}
