// tests/common/mod.rs
//
// Shared fixtures: an in-memory cluster, a session over it, and driver
// settings short enough for tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use cbperf::cluster::memory::MemoryCluster;
use cbperf::cluster::Session;
use cbperf::driver::{RunContext, RunSettings, StatusVector};
use cbperf::retry::RetryPolicy;

pub async fn session(mc: &MemoryCluster) -> Session {
    Session::from_api(Arc::new(mc.clone()), RetryPolicy::new(1, 0.001))
        .await
        .expect("session over memory cluster")
}

pub fn settings(threads: usize, thread_max: usize) -> RunSettings {
    RunSettings {
        threads,
        thread_max,
        parallel_batches: true,
        latency_limit: Duration::from_secs(5),
        throttle_interval: Duration::from_millis(10),
        throttle_attempts: 200,
        ramp_pause: Duration::from_millis(20),
        ramp_accelerate_every: Duration::from_millis(40),
        ramp_grace: Duration::from_millis(500),
        show_progress: false,
    }
}

pub async fn context(mc: &MemoryCluster, threads: usize) -> RunContext {
    RunContext::new(session(mc).await, settings(threads, threads * 2), Arc::new(StatusVector::new()))
}
