//! Per-operation latency histograms
//!
//! Workers report one telemetry record per batch; the aggregator records the
//! batch's mean per-operation time here, once per operation in the batch.

use hdrhistogram::Histogram;
use std::time::Duration;

/// Upper bound of a recorded value (1 hour, in microseconds)
const MAX_MICROS: u64 = 3_600_000_000;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatencySummary {
    pub count: u64,
    pub mean_us: f64,
    pub p50_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

#[derive(Debug, Clone)]
pub struct OpLatency {
    hist: Histogram<u64>,
}

impl OpLatency {
    pub fn new() -> Self {
        OpLatency {
            hist: Histogram::<u64>::new_with_bounds(1, MAX_MICROS, 3).expect("failed to allocate histogram"),
        }
    }

    /// Record `per_op` for each of `ops` operations.
    pub fn record_batch(&mut self, per_op: Duration, ops: u64) {
        if ops == 0 {
            return;
        }
        let micros = (per_op.as_micros() as u64).clamp(1, MAX_MICROS);
        let _ = self.hist.record_n(micros, ops);
    }

    pub fn summary(&self) -> LatencySummary {
        if self.hist.is_empty() {
            return LatencySummary::default();
        }
        LatencySummary {
            count: self.hist.len(),
            mean_us: self.hist.mean(),
            p50_us: self.hist.value_at_quantile(0.50),
            p99_us: self.hist.value_at_quantile(0.99),
            max_us: self.hist.max(),
        }
    }
}

impl Default for OpLatency {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_batch_weights_by_ops() {
        let mut h = OpLatency::new();
        h.record_batch(Duration::from_micros(100), 9);
        h.record_batch(Duration::from_millis(10), 1);
        let s = h.summary();
        assert_eq!(s.count, 10);
        assert!(s.p50_us >= 99 && s.p50_us <= 101);
        assert!(s.max_us >= 9_990);
    }

    #[test]
    fn test_empty_and_sub_microsecond() {
        assert_eq!(OpLatency::new().summary().count, 0);
        let mut b = OpLatency::new();
        b.record_batch(Duration::from_micros(400), 1);
        // sub-microsecond values are recorded as 1
        b.record_batch(Duration::from_nanos(10), 1);
        assert_eq!(b.summary().count, 2);
    }
}
