// src/driver/launcher.rs
//
// Worker admission: fixed-size launches for load/read steps and
// accelerating cohorts for ramp tests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::worker::{Worker, WorkerExit};
use super::{RecordCounter, RunContext, Task};
use crate::constants::{RAMP_INITIAL_ACCELERATOR, TELEMETRY_QUEUE_DEPTH};
use crate::error::CbResult;
use crate::live_stats::{Aggregator, RunSummary, TelemetrySender};

/// Wait until every admitted worker has connected. False when the stop
/// flag goes up or the attempts run out.
async fn throttle(ctx: &RunContext) -> bool {
    let s = &ctx.settings;
    for attempt in 0..=s.throttle_attempts {
        if ctx.status.is_stopped() {
            return false;
        }
        if ctx.status.caught_up() {
            return true;
        }
        if attempt < s.throttle_attempts {
            tokio::time::sleep(s.throttle_interval).await;
        }
    }
    false
}

/// Sleep for `total`, waking early when the stop flag goes up.
async fn pause(ctx: &RunContext, total: Duration) {
    let slice = Duration::from_millis(100);
    let started = Instant::now();
    while !ctx.status.is_stopped() {
        let left = total.saturating_sub(started.elapsed());
        if left.is_zero() {
            break;
        }
        tokio::time::sleep(left.min(slice)).await;
    }
}

fn spawn_worker(
    id: usize,
    ctx: &RunContext,
    task: &Arc<Task>,
    counter: &Arc<RecordCounter>,
    tx: &TelemetrySender,
) -> JoinHandle<WorkerExit> {
    ctx.status.admit();
    let worker = Worker::new(id, ctx.clone(), task.clone(), counter.clone(), tx.clone());
    tokio::spawn(worker.run())
}

fn start_aggregator(ctx: &RunContext, expected: Option<u64>) -> (TelemetrySender, JoinHandle<RunSummary>) {
    let (tx, rx) = mpsc::channel(TELEMETRY_QUEUE_DEPTH);
    let mut agg = Aggregator::new(rx, ctx.status.clone(), ctx.settings.thread_max, expected);
    if ctx.settings.show_progress {
        agg = agg.with_progress();
    }
    (tx, tokio::spawn(agg.run()))
}

fn collect(ctx: &RunContext, exit: Result<WorkerExit, tokio::task::JoinError>) {
    match exit {
        Ok(e) => debug!("worker exited: {:?}", e),
        Err(e) if e.is_cancelled() => debug!("worker aborted"),
        Err(e) => {
            error!("worker crashed: {}", e);
            ctx.status.record_error();
            ctx.status.stop();
        }
    }
}

async fn finish(ctx: &RunContext, agg: JoinHandle<RunSummary>) -> RunSummary {
    ctx.status.finish();
    agg.await.unwrap_or_else(|e| {
        error!("status aggregator failed: {}", e);
        RunSummary {
            admitted: ctx.status.admitted(),
            errors: ctx.status.errors() + 1,
            ..Default::default()
        }
    })
}

/// Run `task` with up to `threads` workers. Sequential runs stop when every
/// record has been handed out; random runs after `record_count` draws.
pub async fn run_fixed(ctx: &RunContext, task: Task) -> CbResult<RunSummary> {
    let mode = task.mode.validate()?;
    ctx.status.reset();
    if task.record_count == 0 || task.operations == 0 {
        info!("no records to process for {}", task.keyspace);
        ctx.status.finish();
        return Ok(RunSummary::default());
    }

    let expected = if mode.is_random() { task.operations } else { task.record_count };
    let batches = expected.div_ceil(task.batch_size) as usize;
    let threads = ctx.settings.threads.min(batches).max(1);
    info!(
        "running {:?} on {}: {} operations over {} records, batch {}, {} workers",
        mode, task.keyspace, expected, task.record_count, task.batch_size, threads
    );

    let counter = Arc::new(task.counter());
    let (tx, agg) = start_aggregator(ctx, Some(expected));
    let task = Arc::new(task);

    let mut handles = Vec::with_capacity(threads);
    for id in 0..threads {
        if !throttle(ctx).await {
            if !ctx.status.is_stopped() {
                warn!("workers did not connect in time; ending step");
                ctx.status.stop();
            }
            break;
        }
        handles.push(spawn_worker(id, ctx, &task, &counter, &tx));
    }
    drop(tx);

    for h in handles {
        collect(ctx, h.await);
    }
    Ok(finish(ctx, agg).await)
}

/// Admit workers in cohorts of `accelerator`, pausing between cohorts and
/// doubling the cohort every `ramp_accelerate_every`, until the stop flag
/// goes up. Keys are always random. Workers still running `ramp_grace`
/// after the stop are aborted.
pub async fn run_ramp(ctx: &RunContext, task: Task) -> CbResult<RunSummary> {
    let mut task = task;
    task.mode = task.mode.with_random(true).validate()?;
    ctx.status.reset();

    let s = ctx.settings.clone();
    info!(
        "ramp on {}: up to {} workers, cohort pause {:?}, doubling every {:?}",
        task.keyspace, s.thread_max, s.ramp_pause, s.ramp_accelerate_every
    );

    let counter = Arc::new(RecordCounter::open(task.record_count.max(1)));
    let (tx, agg) = start_aggregator(ctx, None);
    let task = Arc::new(task);

    let mut handles = Vec::new();
    let mut accelerator = RAMP_INITIAL_ACCELERATOR;
    let mut last_accel = Instant::now();

    'ramp: while !ctx.status.is_stopped() {
        for _ in 0..accelerator {
            if handles.len() >= s.thread_max {
                info!("thread cap {} reached", s.thread_max);
                ctx.status.stop();
                break 'ramp;
            }
            if !throttle(ctx).await {
                if !ctx.status.is_stopped() {
                    warn!("workers did not connect in time; ending ramp");
                    ctx.status.stop();
                }
                break 'ramp;
            }
            handles.push(spawn_worker(handles.len(), ctx, &task, &counter, &tx));
        }
        pause(ctx, s.ramp_pause).await;
        if last_accel.elapsed() >= s.ramp_accelerate_every {
            accelerator *= 2;
            last_accel = Instant::now();
            info!("ramp cohort size now {} ({} workers running)", accelerator, handles.len());
        }
    }
    drop(tx);

    let deadline = tokio::time::Instant::now() + s.ramp_grace;
    let mut aborted = 0;
    for mut h in handles {
        match tokio::time::timeout_at(deadline, &mut h).await {
            Ok(exit) => collect(ctx, exit),
            Err(_) => {
                h.abort();
                aborted += 1;
            }
        }
    }
    if aborted > 0 {
        warn!("aborted {} workers still running after {:?}", aborted, s.ramp_grace);
    }
    Ok(finish(ctx, agg).await)
}
