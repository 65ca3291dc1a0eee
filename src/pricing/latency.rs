//! Per-source feed latency tracking.

use crate::market::SourceId;
use dashmap::DashMap;

/// Weight of the newest sample in the moving average.
const EWMA_ALPHA: f64 = 0.2;

/// Exponentially weighted moving average of quote delivery latency per source.
///
/// Latency is measured as receive time minus the quote's own timestamp.
#[derive(Debug, Default)]
pub struct LatencyTracker {
    averages: DashMap<SourceId, f64>,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one latency sample in milliseconds. Negative samples (clock skew) count as zero.
    pub fn record(&self, source: &SourceId, latency_ms: i64) {
        let sample = latency_ms.max(0) as f64;
        self.averages
            .entry(source.clone())
            .and_modify(|avg| *avg = EWMA_ALPHA * sample + (1.0 - EWMA_ALPHA) * *avg)
            .or_insert(sample);
    }

    /// Smoothed latency for a source, if any sample was recorded.
    pub fn latency_ms(&self, source: &SourceId) -> Option<f64> {
        self.averages.get(source).map(|avg| *avg)
    }

    /// Combined latency of two sources; `None` unless both are tracked.
    pub fn combined_ms(&self, a: &SourceId, b: &SourceId) -> Option<f64> {
        Some(self.latency_ms(a)? + self.latency_ms(b)?)
    }
}
