// src/bandwidth.rs
//! Round-trip throughput probe used to size load batches.
//!
//! Each pass writes and reads one scratch document, doubling its size from
//! 1 KiB until throughput stops improving (previous / current >= 0.9). The
//! stable throughput of every pass is averaged. A single key measures payload
//! cost, not connection parallelism, so the result is a heuristic.

use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{debug, info, warn};

use crate::cluster::{Keyspace, Session};
use crate::constants::*;
use crate::error::CbResult;

const PROBE_KEY: &str = "bandwidth:probe";

#[derive(Debug, Clone)]
pub struct BandwidthProbe {
    keyspace: Keyspace,
    passes: usize,
    start_size: usize,
    max_size: usize,
}

impl BandwidthProbe {
    /// Probe inside `bucket` using a scratch `bandwidth` collection.
    pub fn new(bucket: &str) -> Self {
        Self {
            keyspace: Keyspace::new(bucket, DEFAULT_SCOPE, BANDWIDTH_COLLECTION),
            passes: BANDWIDTH_MAX_PASSES,
            start_size: BANDWIDTH_START_SIZE,
            max_size: BANDWIDTH_MAX_SIZE,
        }
    }

    /// Average stable throughput in bytes per second. The scratch collection
    /// is dropped whether or not the probe succeeds.
    pub async fn run(&self, session: &Session) -> CbResult<f64> {
        session.create_collection(&self.keyspace).await?;
        let result = self.measure(session).await;
        if let Err(e) = session.drop_collection(&self.keyspace).await {
            warn!("could not drop {}: {}", self.keyspace, e);
        }
        let throughput = result?;
        info!("measured throughput {:.0} bytes/s over {} passes", throughput, self.passes);
        Ok(throughput)
    }

    async fn measure(&self, session: &Session) -> CbResult<f64> {
        let mut total = 0.0;
        for pass in 0..self.passes {
            let stable = self.one_pass(session).await?;
            debug!("bandwidth pass {}: {:.0} bytes/s", pass + 1, stable);
            total += stable;
        }
        Ok(total / self.passes as f64)
    }

    async fn one_pass(&self, session: &Session) -> CbResult<f64> {
        let mut size = self.start_size;
        let mut previous: Option<f64> = None;
        loop {
            let current = self.round_trip(session, size).await?;
            if let Some(prev) = previous {
                if is_stable(prev, current) {
                    return Ok(current);
                }
            }
            if size >= self.max_size {
                return Ok(current);
            }
            previous = Some(current);
            size = (size * 2).min(self.max_size);
        }
    }

    async fn round_trip(&self, session: &Session, size: usize) -> CbResult<f64> {
        let doc = json!({ "data": "x".repeat(size) });
        let started = Instant::now();
        session.upsert(&self.keyspace, PROBE_KEY, &doc).await?;
        session.get(&self.keyspace, PROBE_KEY).await?;
        let elapsed = started.elapsed().max(Duration::from_micros(1));
        Ok((2 * size) as f64 / elapsed.as_secs_f64())
    }
}

/// Growth has flattened when the previous step was within 10% of this one.
pub fn is_stable(previous: f64, current: f64) -> bool {
    current <= 0.0 || previous / current >= BANDWIDTH_STABLE_RATIO
}

/// `floor(0.7 * throughput / (doc_size * workers))`, kept within
/// `[1, default]`.
pub fn batch_size_for(throughput: f64, doc_size: usize, workers: usize, default: u64) -> u64 {
    let denom = (doc_size.max(1) * workers.max(1)) as f64;
    let raw = (BANDWIDTH_HEADROOM * throughput / denom).floor();
    if !raw.is_finite() {
        return default;
    }
    (raw as u64).clamp(1, default.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::MemoryCluster;
    use crate::cluster::BucketSettings;
    use crate::retry::RetryPolicy;
    use std::sync::Arc;

    #[test]
    fn test_batch_size_formula() {
        // 0.7 * 1_000_000 / (1000 * 7) = 100
        assert_eq!(batch_size_for(1_000_000.0, 1000, 7, 500), 100);
        assert_eq!(batch_size_for(1e12, 1000, 1, 100), 100);
        assert_eq!(batch_size_for(10.0, 4096, 32, 100), 1);
        assert_eq!(batch_size_for(f64::INFINITY, 1, 1, 100), 100);
    }

    #[test]
    fn test_stability_ratio() {
        assert!(is_stable(95.0, 100.0));
        assert!(!is_stable(50.0, 100.0));
        assert!(is_stable(120.0, 100.0));
    }

    #[tokio::test]
    async fn test_probe_drops_scratch_collection() {
        let mc = MemoryCluster::new();
        let session = Session::from_api(Arc::new(mc.clone()), RetryPolicy::new(2, 0.001))
            .await
            .unwrap();
        session
            .create_bucket(&BucketSettings {
                name: "cbperf".into(),
                ram_quota_mb: 256,
                replicas: 0,
            })
            .await
            .unwrap();
        let probe = BandwidthProbe {
            passes: 2,
            max_size: 8 * 1024,
            ..BandwidthProbe::new("cbperf")
        };
        let tp = probe.run(&session).await.unwrap();
        assert!(tp > 0.0);
        let ks = Keyspace::new("cbperf", DEFAULT_SCOPE, BANDWIDTH_COLLECTION);
        assert!(!session.collection_exists(&ks).await.unwrap());
    }
}
