//! Deterministic randomness for simulation testing
//!
//! Every random decision made by the fault-injecting store and the DST
//! workload flows through [`Rng`], so a failing run replays exactly from its
//! seed (FoundationDB-style BUGGIFY).

use rand::{Rng as _, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Source of randomness for simulation code
pub trait Rng: Send + 'static {
    fn next_u64(&mut self) -> u64;

    /// `true` with the given probability (clamped to `[0, 1]`)
    fn gen_bool(&mut self, probability: f64) -> bool;

    /// Uniform value in `[min, max)`; returns `min` when the range is empty
    fn gen_range(&mut self, min: u64, max: u64) -> u64;
}

/// Seeded ChaCha8 generator
pub struct SimulatedRng {
    inner: ChaCha8Rng,
}

impl SimulatedRng {
    pub fn new(seed: u64) -> Self {
        SimulatedRng {
            inner: ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

impl Rng for SimulatedRng {
    fn next_u64(&mut self) -> u64 {
        self.inner.next_u64()
    }

    fn gen_bool(&mut self, probability: f64) -> bool {
        self.inner.gen_bool(probability.clamp(0.0, 1.0))
    }

    fn gen_range(&mut self, min: u64, max: u64) -> u64 {
        if min >= max {
            return min;
        }
        self.inner.gen_range(min..max)
    }
}

/// Fault identifiers used by the simulated log store
pub mod faults {
    pub const APPEND_UNAVAILABLE: &str = "store.append_unavailable";
    pub const APPEND_REPLY_LOST: &str = "store.append_reply_lost";
    pub const READ_UNAVAILABLE: &str = "store.read_unavailable";
    pub const CLAIM_UNAVAILABLE: &str = "store.claim_unavailable";
    pub const ACK_UNAVAILABLE: &str = "store.ack_unavailable";
    pub const DELETE_UNAVAILABLE: &str = "store.delete_unavailable";
    pub const SCAN_UNAVAILABLE: &str = "store.scan_unavailable";
}

/// Decide whether the fault `_fault_id` fires on this call
///
/// Zero probability never consumes randomness, so a fault-free run draws the
/// same sequence as one without any injection points.
pub fn buggify<R: Rng + ?Sized>(rng: &mut R, _fault_id: &str, probability: f64) -> bool {
    if probability <= 0.0 {
        return false;
    }
    rng.gen_bool(probability)
}
