use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

/// One pacing window. Snapshots are published wholesale through an
/// `ArcSwap`; a reader never observes a partially updated window.
#[derive(Debug)]
pub struct Pacing {
    /// Requests observed since this snapshot was published.
    pub requests: AtomicI64,
    /// Remaining bid allowance. Decrement-then-test admission means the
    /// value can transiently go negative; a negative result is "no bid".
    pub bids: AtomicI64,
    pub timestamp: Instant,
    /// Request rate observed over the previous window.
    pub qps: f64,
    /// Smoothed probability that a request is allowed to bid.
    pub sampling: f64,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            requests: AtomicI64::new(0),
            bids: AtomicI64::new(0),
            timestamp: Instant::now(),
            qps: 0.0,
            sampling: 0.0,
        }
    }
}

impl Pacing {
    pub fn window(bids: i64, timestamp: Instant, qps: f64, sampling: f64) -> Self {
        Self {
            requests: AtomicI64::new(0),
            bids: AtomicI64::new(bids),
            timestamp,
            qps,
            sampling,
        }
    }

    pub fn note_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Consumes one unit of allowance; false once the window is spent.
    pub fn consume_bid(&self) -> bool {
        self.bids.fetch_sub(1, Ordering::AcqRel) - 1 >= 0
    }
}

/// Smoothing constant for the sampling EMA: heavy on history to damp
/// oscillation between over- and under-delivery.
pub const SAMPLING_EMA_KEEP: f64 = 0.8;

pub fn sampling_ema(previous: f64, instantaneous: f64) -> f64 {
    SAMPLING_EMA_KEEP * previous + (1.0 - SAMPLING_EMA_KEEP) * instantaneous
}
