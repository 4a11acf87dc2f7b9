//! Webhook Queue DST Tests
//!
//! Seeded simulation runs of the delivery queue: several consumers poll,
//! acknowledge and crash while the store injects failures and ambiguous
//! replies. Each run checks delivery invariants against a shadow model.
//!
//! - **Calm**: no faults, every operation must succeed
//! - **Moderate**: occasional store failures
//! - **Chaos**: frequent failures, crashes and long clock jumps

use messaging_gateway::queue::{
    run_dst_batch, summarize_batch, QueueDSTConfig, QueueDSTHarness,
};

// =============================================================================
// Single Seed Tests
// =============================================================================

#[tokio::test]
async fn test_queue_dst_single_calm() {
    let mut harness = QueueDSTHarness::new(QueueDSTConfig::calm(12345));
    harness.run(500).await;
    harness.check_invariants().await;

    let result = harness.result();
    println!("{}", result.summary());

    assert!(
        result.is_success(),
        "Calm mode should not violate invariants: {:?}",
        result.invariant_violations
    );
    assert_eq!(result.total_operations, 500);
    assert_eq!(result.failed_operations, 0);
    assert!(result.enqueued > 0);
    assert!(result.delivered > 0);
}

#[tokio::test]
async fn test_queue_dst_single_moderate() {
    let mut harness = QueueDSTHarness::new(QueueDSTConfig::moderate(54321));
    harness.run(500).await;
    harness.check_invariants().await;

    let result = harness.result();
    println!("{}", result.summary());
    assert!(
        result.is_success(),
        "Moderate mode should not violate invariants: {:?}",
        result.invariant_violations
    );
}

#[tokio::test]
async fn test_queue_dst_single_chaos() {
    let mut harness = QueueDSTHarness::new(QueueDSTConfig::chaos(99999));
    harness.run(500).await;
    harness.check_invariants().await;

    let result = harness.result();
    println!("{}", result.summary());
    assert!(
        result.is_success(),
        "Chaos mode should not violate invariants: {:?}",
        result.invariant_violations
    );
}

// =============================================================================
// Multi-Seed Batches
// =============================================================================

#[tokio::test]
async fn test_queue_dst_batch_calm() {
    let results = run_dst_batch(0, 20, 300, QueueDSTConfig::calm).await;
    let summary = summarize_batch(&results);
    println!("{}", summary);

    assert!(results.iter().all(|r| r.is_success()), "{}", summary);
}

#[tokio::test]
async fn test_queue_dst_batch_moderate() {
    let results = run_dst_batch(1000, 20, 300, QueueDSTConfig::moderate).await;
    let summary = summarize_batch(&results);
    println!("{}", summary);

    assert!(results.iter().all(|r| r.is_success()), "{}", summary);
}

#[tokio::test]
async fn test_queue_dst_batch_chaos() {
    let results = run_dst_batch(5000, 20, 300, QueueDSTConfig::chaos).await;
    let summary = summarize_batch(&results);
    println!("{}", summary);

    assert!(results.iter().all(|r| r.is_success()), "{}", summary);
}

#[tokio::test]
async fn test_queue_dst_faults_are_injected_in_chaos() {
    let results = run_dst_batch(7000, 5, 300, QueueDSTConfig::chaos).await;
    let faults: u64 = results.iter().map(|r| r.store_stats.total_failures()).sum();
    assert!(faults > 0, "chaos runs should inject store faults");
}

#[tokio::test]
async fn test_queue_dst_deterministic_across_runs() {
    let first = run_dst_batch(42, 3, 200, QueueDSTConfig::moderate).await;
    let second = run_dst_batch(42, 3, 200, QueueDSTConfig::moderate).await;

    for (a, b) in first.iter().zip(&second) {
        assert_eq!(a.summary(), b.summary(), "seed {} diverged", a.seed);
    }
}

// =============================================================================
// Stress (run with --ignored)
// =============================================================================

#[tokio::test]
#[ignore]
async fn test_queue_dst_stress_many_seeds() {
    let results = run_dst_batch(100_000, 500, 1000, QueueDSTConfig::chaos).await;
    let summary = summarize_batch(&results);
    println!("{}", summary);

    assert!(results.iter().all(|r| r.is_success()), "{}", summary);
}
