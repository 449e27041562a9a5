//! Worker launches against the in-memory cluster: fixed runs, random
//! operation budgets, ramps, and the error and latency stop paths.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use cbperf::cluster::memory::MemoryCluster;
use cbperf::driver::worker::{Worker, WorkerExit};
use cbperf::driver::{run_fixed, run_ramp, OpMode, RunContext, StatusVector, Task};
use cbperf::inventory::{Collection, Inventory, Schema, Variables};
use cbperf::provision::Provisioner;

async fn provisioned(mc: &MemoryCluster) -> Schema {
    let session = common::session(mc).await;
    let schema = Inventory::bundled().unwrap().build("default", &Variables::default()).unwrap();
    Provisioner::new(&session, 100, 0).provision(&schema).await.unwrap();
    schema
}

fn collection(schema: &Schema) -> &Collection {
    schema.collections().next().unwrap()
}

#[tokio::test]
async fn test_fixed_run_writes_every_record_once() {
    let mc = MemoryCluster::new();
    let schema = provisioned(&mc).await;
    let ctx = common::context(&mc, 4).await;
    let coll = collection(&schema);

    let summary = run_fixed(&ctx, Task::from_collection(coll, 100, 9, OpMode::KV, 100))
        .await
        .unwrap();
    assert!(!summary.failed());
    assert_eq!(summary.total_ops, 100);
    assert!(summary.admitted >= 1 && summary.admitted <= 4);
    assert_eq!(mc.doc_count(&coll.keyspace()), 100);
}

#[tokio::test]
async fn test_random_run_honors_operation_budget() {
    let mc = MemoryCluster::new();
    let schema = provisioned(&mc).await;
    let ctx = common::context(&mc, 2).await;
    let coll = collection(&schema);

    let task = Task::from_collection(coll, 10, 5, OpMode::KV.with_random(true), 100).with_operations(60);
    let summary = run_fixed(&ctx, task).await.unwrap();
    assert!(!summary.failed());
    assert_eq!(summary.total_ops, 60);
    // every write lands inside the 10-record key range
    assert!(mc.doc_count(&coll.keyspace()) <= 10);
}

#[tokio::test]
async fn test_read_only_run_leaves_collection_empty() {
    let mc = MemoryCluster::new();
    let schema = provisioned(&mc).await;
    let ctx = common::context(&mc, 2).await;
    let coll = collection(&schema);

    let summary = run_fixed(&ctx, Task::from_collection(coll, 20, 5, OpMode::KV, 0))
        .await
        .unwrap();
    assert!(!summary.failed());
    assert_eq!(summary.total_ops, 20);
    assert_eq!(mc.doc_count(&coll.keyspace()), 0);
}

#[tokio::test]
async fn test_operation_failure_stops_the_run() {
    let mc = MemoryCluster::new();
    let schema = provisioned(&mc).await;
    let ctx = common::context(&mc, 2).await;
    let coll = collection(&schema);
    mc.fail_after(15);

    let summary = run_fixed(&ctx, Task::from_collection(coll, 200, 10, OpMode::KV, 100))
        .await
        .unwrap();
    assert!(summary.failed());
    assert!(summary.errors >= 1);
    assert!(ctx.status.is_stopped());
    assert!(summary.total_ops < 200);
}

#[tokio::test]
async fn test_slow_batches_trip_the_latency_limit() {
    let mc = MemoryCluster::new();
    let schema = provisioned(&mc).await;
    let mut settings = common::settings(1, 2);
    settings.latency_limit = Duration::from_millis(5);
    let ctx = RunContext::new(common::session(&mc).await, settings, Arc::new(StatusVector::new()));
    let coll = collection(&schema);
    mc.set_latency(Duration::from_millis(20));

    let summary = run_fixed(&ctx, Task::from_collection(coll, 50, 5, OpMode::KV, 100))
        .await
        .unwrap();
    assert!(summary.failed());
    assert!(summary.total_ops < 50);
}

#[tokio::test]
async fn test_stalled_batch_is_cut_at_latency_limit() {
    let mc = MemoryCluster::new();
    let schema = provisioned(&mc).await;
    let mut settings = common::settings(1, 2);
    settings.latency_limit = Duration::from_millis(200);
    let ctx = RunContext::new(common::session(&mc).await, settings, Arc::new(StatusVector::new()));
    let coll = collection(&schema);
    mc.set_latency(Duration::from_secs(3));

    let started = Instant::now();
    let summary = run_fixed(&ctx, Task::from_collection(coll, 5, 5, OpMode::KV, 100))
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(1500));
    assert!(summary.failed());
    assert_eq!(summary.errors, 1);
    assert_eq!(summary.total_ops, 0);
    assert!(ctx.status.is_stopped());
}

#[tokio::test(start_paused = true)]
async fn test_stalled_cluster_ends_run_after_data_wait() {
    let mc = MemoryCluster::new();
    let schema = provisioned(&mc).await;
    let mut settings = common::settings(1, 2);
    settings.latency_limit = Duration::from_secs(60);
    let ctx = RunContext::new(common::session(&mc).await, settings, Arc::new(StatusVector::new()));
    let coll = collection(&schema);
    mc.set_latency(Duration::from_secs(30));

    let summary = run_fixed(&ctx, Task::from_collection(coll, 5, 5, OpMode::KV, 100))
        .await
        .unwrap();
    assert!(summary.data_timeout);
    assert!(summary.failed());
    assert_eq!(summary.total_ops, 0);
    assert!(ctx.status.is_stopped());
}

#[tokio::test]
async fn test_worker_stops_when_aggregator_is_gone() {
    let mc = MemoryCluster::new();
    let schema = provisioned(&mc).await;
    let ctx = common::context(&mc, 1).await;
    let coll = collection(&schema);
    let task = Task::from_collection(coll, 5, 5, OpMode::KV, 100);
    let counter = Arc::new(task.counter());
    let (tx, rx) = tokio::sync::mpsc::channel(4);
    drop(rx);

    let exit = Worker::new(0, ctx.clone(), Arc::new(task), counter, tx).run().await;
    assert_eq!(exit, WorkerExit::Stopped);
    assert!(ctx.status.is_stopped());
    assert_eq!(ctx.status.errors(), 0);
    assert_eq!(mc.doc_count(&coll.keyspace()), 5);
}

#[tokio::test]
async fn test_ramp_aborts_workers_past_grace() {
    let mc = MemoryCluster::new();
    let schema = provisioned(&mc).await;
    let mut settings = common::settings(1, 2);
    settings.latency_limit = Duration::from_secs(60);
    settings.ramp_grace = Duration::from_millis(200);
    let ctx = RunContext::new(common::session(&mc).await, settings, Arc::new(StatusVector::new()));
    let coll = collection(&schema);
    mc.set_latency(Duration::from_secs(5));

    let started = Instant::now();
    let summary = run_ramp(&ctx, Task::from_collection(coll, 50, 5, OpMode::KV, 100))
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(summary.admitted, 2);
    assert_eq!(summary.errors, 0);
    assert_eq!(summary.total_ops, 0);
    assert_eq!(mc.doc_count(&coll.keyspace()), 0);
}

#[tokio::test]
async fn test_ramp_stops_at_thread_cap() {
    let mc = MemoryCluster::new();
    let schema = provisioned(&mc).await;
    let ctx = RunContext::new(common::session(&mc).await, common::settings(1, 8), Arc::new(StatusVector::new()));
    let coll = collection(&schema);

    let summary = run_ramp(&ctx, Task::from_collection(coll, 50, 5, OpMode::KV, 50))
        .await
        .unwrap();
    assert_eq!(summary.admitted, 8);
    assert_eq!(summary.errors, 0);
    assert!(ctx.status.is_stopped());
    assert!(summary.total_ops > 0);
}

#[tokio::test]
async fn test_zero_records_is_a_no_op() {
    let mc = MemoryCluster::new();
    let schema = provisioned(&mc).await;
    let ctx = common::context(&mc, 2).await;
    let before = mc.op_count();

    let summary = run_fixed(&ctx, Task::from_collection(collection(&schema), 0, 5, OpMode::KV, 100))
        .await
        .unwrap();
    assert_eq!(summary.total_ops, 0);
    assert_eq!(summary.admitted, 0);
    assert_eq!(mc.op_count(), before);
}
