//! Delivery queue properties
//!
//! Behavior the queue guarantees to workers, exercised against the in-memory
//! store with a simulated clock so idle times are exact.

use bytes::Bytes;
use messaging_gateway::clock::SimulatedClock;
use messaging_gateway::queue::{
    PollOptions, QueueError, Reaper, ReaperConfig, WebhookQueue, WebhookStreamObject,
};
use messaging_gateway::store::{GroupCreation, InMemoryLogStore, LogStore};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const PREFIX: &str = "line";
const GROUP: &str = "line-webhook";
const CHANNEL: &str = "1650000000";
const STREAM: &str = "line:1650000000";

type Store = InMemoryLogStore<SimulatedClock>;

fn setup() -> (WebhookQueue<Store>, Arc<Store>, SimulatedClock) {
    let clock = SimulatedClock::new(1_700_000_000_000);
    let store = Arc::new(InMemoryLogStore::new(clock.clone()));
    let queue = WebhookQueue::new(Arc::clone(&store), PREFIX, GROUP);
    (queue, store, clock)
}

fn webhook(request_id: &str) -> WebhookStreamObject {
    WebhookStreamObject {
        request_id: request_id.to_string(),
        signature: "c2lnbmF0dXJl".to_string(),
        destination: "Udeadbeef".to_string(),
        events: vec![json!({"type": "message", "message": {"type": "text", "text": request_id}})],
    }
}

fn options(max_idle_time_ms: u64, max_delivery_count: u64) -> PollOptions {
    PollOptions {
        max_count: None,
        max_idle_time_ms,
        max_delivery_count,
    }
}

async fn poll_ids(
    queue: &WebhookQueue<Store>,
    consumer: &str,
    options: PollOptions,
) -> Vec<String> {
    queue
        .poll_ready(CHANNEL, consumer, options)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.request_id)
        .collect()
}

// =============================================================================
// Store Properties
// =============================================================================

#[tokio::test]
async fn test_ensure_group_is_idempotent() {
    let (_, store, _) = setup();

    let first = store.ensure_group(STREAM, GROUP).await.unwrap();
    let second = store.ensure_group(STREAM, GROUP).await.unwrap();

    assert_eq!(first, GroupCreation::Created);
    assert_eq!(second, GroupCreation::AlreadyExists);
    assert!(!second.created());
}

#[tokio::test]
async fn test_read_unclaimed_returns_append_order() {
    let (_, store, _) = setup();
    let a = store.append(STREAM, Bytes::from_static(b"A")).await.unwrap();
    let b = store.append(STREAM, Bytes::from_static(b"B")).await.unwrap();
    let c = store.append(STREAM, Bytes::from_static(b"C")).await.unwrap();
    store.ensure_group(STREAM, GROUP).await.unwrap();

    let entries = store.read_unclaimed(STREAM, GROUP, "c1", None).await.unwrap();
    let ids: Vec<_> = entries.iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![a, b, c]);
    let payloads: Vec<&[u8]> = entries.iter().map(|e| &e.payload[..]).collect();
    assert_eq!(payloads, vec![&b"A"[..], &b"B"[..], &b"C"[..]]);
}

#[tokio::test]
async fn test_delete_then_count() {
    let (_, store, _) = setup();
    let a = store.append(STREAM, Bytes::from_static(b"A")).await.unwrap();
    store.append(STREAM, Bytes::from_static(b"B")).await.unwrap();
    assert_eq!(store.count(STREAM).await.unwrap(), 2);

    assert!(store.delete(STREAM, a).await.unwrap());
    assert_eq!(store.count(STREAM).await.unwrap(), 1);

    assert!(!store.delete(STREAM, a).await.unwrap());
    assert_eq!(store.count(STREAM).await.unwrap(), 1);
}

// =============================================================================
// Delivery Properties
// =============================================================================

#[tokio::test]
async fn test_self_exclusion() {
    let (queue, _, clock) = setup();
    queue.enqueue(CHANNEL, &webhook("e")).await.unwrap();

    assert_eq!(poll_ids(&queue, "c1", options(1_000, 10)).await, vec!["e"]);

    for _ in 0..5 {
        clock.advance_ms(10_000);
        assert!(poll_ids(&queue, "c1", options(1_000, 10)).await.is_empty());
    }
    assert_eq!(poll_ids(&queue, "c2", options(1_000, 10)).await, vec!["e"]);
}

#[tokio::test]
async fn test_idle_threshold_boundary() {
    let (queue, _, clock) = setup();
    queue.enqueue(CHANNEL, &webhook("e")).await.unwrap();
    poll_ids(&queue, "x", PollOptions::default()).await;

    let t = 500;
    clock.advance_ms(t);
    assert!(
        poll_ids(&queue, "y", options(t + 1, 3)).await.is_empty(),
        "entry idle for {}ms must not satisfy a {}ms threshold",
        t,
        t + 1
    );

    clock.advance_ms(1);
    assert_eq!(poll_ids(&queue, "y", options(t + 1, 3)).await, vec!["e"]);
}

#[tokio::test]
async fn test_max_delivery_quarantine() {
    let (queue, store, clock) = setup();
    let id = queue.enqueue(CHANNEL, &webhook("e")).await.unwrap();
    let limits = options(100, 3);

    // One read plus two reclaims reaches the cap
    assert_eq!(poll_ids(&queue, "c1", limits).await, vec!["e"]);
    clock.advance_ms(101);
    assert_eq!(poll_ids(&queue, "c2", limits).await, vec!["e"]);
    clock.advance_ms(101);
    assert_eq!(poll_ids(&queue, "c3", limits).await, vec!["e"]);
    assert_eq!(store.pending_owner(STREAM, GROUP, id), Some(("c3".to_string(), 3)));

    for consumer in ["c1", "c2", "c4"] {
        clock.advance_ms(10_000);
        assert!(
            poll_ids(&queue, consumer, limits).await.is_empty(),
            "{} received a quarantined entry",
            consumer
        );
    }
    assert_eq!(store.pending_owner(STREAM, GROUP, id), Some(("c3".to_string(), 3)));
}

#[tokio::test]
async fn test_reclaimed_entries_come_before_new_ones() {
    let (queue, _, clock) = setup();
    queue.enqueue(CHANNEL, &webhook("p")).await.unwrap();
    poll_ids(&queue, "c1", PollOptions::default()).await;

    clock.advance_ms(60_001);
    queue.enqueue(CHANNEL, &webhook("n")).await.unwrap();

    assert_eq!(
        poll_ids(&queue, "c2", PollOptions::default()).await,
        vec!["p", "n"]
    );
}

#[tokio::test]
async fn test_max_count_caps_reclaimed_plus_new() {
    let (queue, _, clock) = setup();
    for i in 0..3 {
        queue.enqueue(CHANNEL, &webhook(&format!("old-{}", i))).await.unwrap();
    }
    poll_ids(&queue, "c1", PollOptions::default()).await;
    clock.advance_ms(60_001);
    for i in 0..3 {
        queue.enqueue(CHANNEL, &webhook(&format!("new-{}", i))).await.unwrap();
    }

    let capped = PollOptions {
        max_count: Some(4),
        ..PollOptions::default()
    };
    assert_eq!(
        poll_ids(&queue, "c2", capped).await,
        vec!["old-0", "old-1", "old-2", "new-0"]
    );
    assert_eq!(
        poll_ids(&queue, "c3", PollOptions::default()).await,
        vec!["new-1", "new-2"]
    );
}

#[tokio::test]
async fn test_poll_on_unknown_channel_creates_nothing_to_deliver() {
    let (queue, _, _) = setup();
    assert!(poll_ids(&queue, "c1", PollOptions::default()).await.is_empty());
    assert_eq!(queue.count(CHANNEL).await.unwrap(), 0);
}

// =============================================================================
// Reaper
// =============================================================================

fn reaper(store: &Arc<Store>) -> Reaper<Store> {
    Reaper::new(
        Arc::clone(store),
        ReaperConfig {
            stream_prefix: PREFIX.to_string(),
            group: GROUP.to_string(),
            consumer: "cleaner".to_string(),
            min_idle: Duration::from_secs(86_400),
            batch_size: 100,
            interval: Duration::from_secs(60),
        },
    )
}

#[tokio::test]
async fn test_reaper_convergence() {
    let (queue, store, clock) = setup();
    let stale = queue.enqueue(CHANNEL, &webhook("stale")).await.unwrap();
    poll_ids(&queue, "c1", PollOptions::default()).await;
    let reaper = reaper(&store);

    let report = reaper.sweep().await.unwrap();
    assert_eq!(report.deleted, 0);
    assert_eq!(queue.count(CHANNEL).await.unwrap(), 1);

    clock.advance(Duration::from_secs(86_400));
    let report = reaper.sweep().await.unwrap();
    assert_eq!(report.streams, 1);
    assert_eq!(report.reclaimed, 1);
    assert_eq!(report.deleted, 1);
    assert_eq!(report.failures, 0);

    assert_eq!(queue.count(CHANNEL).await.unwrap(), 0);
    assert_eq!(store.pending_len(STREAM, GROUP), 0);
    assert_eq!(store.pending_owner(STREAM, GROUP, stale), None);
}

#[tokio::test]
async fn test_reaper_leaves_undelivered_entries() {
    let (queue, store, clock) = setup();
    queue.enqueue(CHANNEL, &webhook("claimed")).await.unwrap();
    poll_ids(&queue, "c1", PollOptions::default()).await;
    queue.enqueue(CHANNEL, &webhook("waiting")).await.unwrap();

    clock.advance(Duration::from_secs(86_401));
    let report = reaper(&store).sweep().await.unwrap();
    assert_eq!(report.deleted, 1);

    assert_eq!(
        poll_ids(&queue, "c2", PollOptions::default()).await,
        vec!["waiting"]
    );
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_scenario_poll_then_acknowledge_both() {
    let (queue, _, _) = setup();
    let first = queue.enqueue(CHANNEL, &webhook("first")).await.unwrap();
    let second = queue.enqueue(CHANNEL, &webhook("second")).await.unwrap();

    let messages = queue
        .poll_ready(
            CHANNEL,
            "c1",
            PollOptions {
                max_count: Some(2),
                ..PollOptions::default()
            },
        )
        .await
        .unwrap();
    let ids: Vec<_> = messages.iter().map(|m| m.message_id).collect();
    assert_eq!(ids, vec![first, second]);

    queue.acknowledge_and_remove(CHANNEL, first).await.unwrap();
    queue.acknowledge_and_remove(CHANNEL, second).await.unwrap();
    assert_eq!(queue.count(CHANNEL).await.unwrap(), 0);

    let err = queue.acknowledge_and_remove(CHANNEL, first).await.unwrap_err();
    assert!(matches!(err, QueueError::NotFound { .. }));
}

#[tokio::test]
async fn test_scenario_stalled_consumer_loses_entry() {
    let (queue, store, clock) = setup();
    let e = queue.enqueue(CHANNEL, &webhook("e")).await.unwrap();
    let limits = options(60_000, 2);

    assert_eq!(poll_ids(&queue, "c1", limits).await, vec!["e"]);
    assert_eq!(store.pending_owner(STREAM, GROUP, e), Some(("c1".to_string(), 1)));

    clock.advance_ms(60_001);
    assert_eq!(poll_ids(&queue, "c2", limits).await, vec!["e"]);
    assert_eq!(store.pending_owner(STREAM, GROUP, e), Some(("c2".to_string(), 2)));

    clock.advance_ms(60_001);
    assert!(poll_ids(&queue, "c1", limits).await.is_empty());
    assert_eq!(store.pending_owner(STREAM, GROUP, e), Some(("c2".to_string(), 2)));
}
