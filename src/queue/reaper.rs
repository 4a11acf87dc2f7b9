//! Background Reaper
//!
//! Periodically sweeps every stream under the configured prefix and discards
//! entries that have been claimed but left unacknowledged for longer than
//! `min_idle`. Reaped entries are acknowledged and deleted, not redelivered:
//! anything nobody finished in time is presumed unprocessable.
//!
//! A sweep never aborts halfway. Failures on one entry or one stream are
//! logged and counted, and the sweep moves on.
//!
//! Only one sweep runs at a time. A tick that fires while the previous sweep
//! is still in flight is skipped.

use crate::store::{LogEntry, LogStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// TigerStyle: Explicit limits
pub const MAX_BATCH_SIZE: usize = 10_000;
pub const MIN_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Streams named `{stream_prefix}:*` are swept
    pub stream_prefix: String,
    pub group: String,
    /// Consumer identity the reaper claims stale entries under
    pub consumer: String,
    pub min_idle: Duration,
    pub batch_size: usize,
    pub interval: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        ReaperConfig {
            stream_prefix: "line".to_string(),
            group: "line-webhook".to_string(),
            consumer: "cleaner".to_string(),
            min_idle: Duration::from_secs(24 * 60 * 60),
            batch_size: 100,
            interval: Duration::from_secs(60),
        }
    }
}

/// What one sweep did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub streams: usize,
    pub reclaimed: usize,
    pub deleted: usize,
    pub failures: usize,
}

pub struct Reaper<S> {
    store: Arc<S>,
    config: ReaperConfig,
    sweeping: AtomicBool,
}

/// Clears the in-flight flag when a sweep ends, including by cancellation
struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<S: LogStore> Reaper<S> {
    pub fn new(store: Arc<S>, config: ReaperConfig) -> Self {
        debug_assert!(config.batch_size > 0, "Precondition violated: batch_size must be > 0");
        debug_assert!(
            config.interval > Duration::ZERO,
            "Precondition violated: interval must be > 0"
        );
        Reaper {
            store,
            config,
            sweeping: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ReaperConfig {
        &self.config
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweeping.load(Ordering::Acquire)
    }

    fn try_begin(&self) -> Option<SweepGuard<'_>> {
        self.sweeping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SweepGuard(&self.sweeping))
    }

    /// Sweep all streams once; `None` if another sweep is already running
    pub async fn sweep(&self) -> Option<SweepReport> {
        let Some(_guard) = self.try_begin() else {
            warn!("previous sweep still running, skipping");
            return None;
        };

        let mut report = SweepReport::default();
        let pattern = format!("{}:", self.config.stream_prefix);
        info!(prefix = %pattern, "start sweeping streams");

        let streams = match self.store.list_streams(&pattern).await {
            Ok(streams) => streams,
            Err(e) => {
                error!(error = %e, "failed to list streams");
                report.failures += 1;
                return Some(report);
            }
        };

        for stream in &streams {
            report.streams += 1;
            self.sweep_stream(stream, &mut report).await;
        }

        info!(
            streams = report.streams,
            reclaimed = report.reclaimed,
            deleted = report.deleted,
            failures = report.failures,
            "end sweeping streams"
        );
        Some(report)
    }

    async fn sweep_stream(&self, stream: &str, report: &mut SweepReport) {
        debug!(stream, "check stream");
        let stale = match self
            .store
            .auto_claim_stale(
                stream,
                &self.config.group,
                &self.config.consumer,
                self.config.min_idle,
                self.config.batch_size,
            )
            .await
        {
            Ok(stale) => stale,
            Err(e) => {
                error!(stream, error = %e, "failed to claim stale entries");
                report.failures += 1;
                return;
            }
        };
        report.reclaimed += stale.len();

        for entry in stale {
            if self.discard(stream, &entry).await {
                report.deleted += 1;
            } else {
                report.failures += 1;
            }
        }
    }

    /// Ack then delete one claimed entry; `false` if either call failed
    async fn discard(&self, stream: &str, entry: &LogEntry) -> bool {
        if let Err(e) = self.store.ack(stream, &self.config.group, entry.id).await {
            error!(stream, entry_id = %entry.id, error = %e, "failed to ack stale entry");
            return false;
        }
        if let Err(e) = self.store.delete(stream, entry.id).await {
            error!(stream, entry_id = %entry.id, error = %e, "failed to delete stale entry");
            return false;
        }
        error!(stream, entry_id = %entry.id, "deleted unhandled entry");
        true
    }

    /// Sweep every `interval` until `shutdown` is cancelled
    ///
    /// Each sweep runs as its own task so a slow sweep does not stall the
    /// ticker; overlapping ticks are dropped by the in-flight flag. On
    /// shutdown the last sweep is awaited.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let period = self.config.interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_ms = period.as_millis() as u64, "reaper started");

        let mut in_flight: Option<JoinHandle<()>> = None;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if self.is_sweeping() {
                        warn!("previous sweep still running, skipping tick");
                        continue;
                    }
                    let reaper = Arc::clone(&self);
                    in_flight = Some(tokio::spawn(async move {
                        reaper.sweep().await;
                    }));
                }
            }
        }

        if let Some(handle) = in_flight {
            if let Err(e) = handle.await {
                error!(error = %e, "sweep task failed");
            }
        }
        info!("reaper stopped");
    }
}
