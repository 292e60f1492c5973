//! Deterministic counter-based request sampling.

use std::sync::atomic::{AtomicU64, Ordering};

/// Admits approximately `p%` of requests into the test pipeline using a
/// shared monotonic counter instead of an RNG. Request `n` (zero-based) is
/// admitted iff `n % 100 < max(0, p - 1)`, so admission is deterministic
/// and evenly spread over every window of one hundred requests.
#[derive(Debug, Default)]
pub struct Sampler {
    counter: AtomicU64,
}

impl Sampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one request against the sampling window and decide admission
    /// for the given probability (`0..=100`).
    pub fn admit(&self, probability: u8) -> bool {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        n % 100 < u64::from(probability.saturating_sub(1))
    }
}
