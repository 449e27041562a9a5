// Live run statistics
//
// The aggregator consumes batch telemetry from every worker over a bounded
// channel, keeps each worker's last throughput, and renders progress until
// the expected operation count is reached, the driver lowers the run flag,
// or no telemetry arrives for the data-wait window.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::constants::{DATA_WAIT_ITERATIONS, DATA_WAIT_POLL, TREND_WINDOW};
use crate::driver::status::StatusVector;
use crate::metrics::{LatencySummary, OpLatency};

/// One completed batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Telemetry {
    pub worker: usize,
    pub ops: u64,
    pub elapsed: Duration,
}

impl Telemetry {
    /// Mean time of one operation in the batch.
    pub fn per_op(&self) -> Duration {
        match self.elapsed.as_nanos().checked_div(u128::from(self.ops)) {
            Some(ns) => Duration::from_nanos(u64::try_from(ns).unwrap_or(u64::MAX)),
            None => Duration::ZERO,
        }
    }

    pub fn tps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.ops as f64 / secs
        } else {
            self.ops as f64 / 1e-6
        }
    }
}

pub type TelemetrySender = mpsc::Sender<Telemetry>;
pub type TelemetryReceiver = mpsc::Receiver<Telemetry>;

/// Ordinary least squares slope of `ys` against their index.
pub fn ols_slope<'a>(ys: impl ExactSizeIterator<Item = &'a f64> + Clone) -> f64 {
    let n = ys.len();
    if n < 2 {
        return 0.0;
    }
    let nf = n as f64;
    let mean_x = (nf - 1.0) / 2.0;
    let mean_y = ys.clone().sum::<f64>() / nf;
    let (mut num, mut den) = (0.0, 0.0);
    for (i, y) in ys.enumerate() {
        let dx = i as f64 - mean_x;
        num += dx * (y - mean_y);
        den += dx * dx;
    }
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

/// Final numbers for one step.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub admitted: u64,
    pub errors: u64,
    pub total_ops: u64,
    pub wall: Duration,
    pub trend: f64,
    pub avg_tps: f64,
    pub max_tps: f64,
    pub avg_op_time: Duration,
    pub max_op_time: Duration,
    pub latency: LatencySummary,
    /// No telemetry arrived for the whole data-wait window
    pub data_timeout: bool,
}

impl RunSummary {
    pub fn failed(&self) -> bool {
        self.errors > 0 || self.data_timeout
    }

    pub fn print(&self, label: &str) {
        println!("\n=== {} ===", label);
        println!("Workers admitted: {}", self.admitted);
        println!("Errors:           {}", self.errors);
        println!("Operations:       {}", self.total_ops);
        println!("Wall time:        {:.2}s", self.wall.as_secs_f64());
        println!("TPS trend:        {:+.3}", self.trend);
        println!("Average TPS:      {:.0}", self.avg_tps);
        println!("Maximum TPS:      {:.0}", self.max_tps);
        println!("Average op time:  {:.3}ms", self.avg_op_time.as_secs_f64() * 1000.0);
        println!("Maximum op time:  {:.3}ms", self.max_op_time.as_secs_f64() * 1000.0);
        if self.latency.count > 0 {
            println!(
                "Op latency (µs):  mean={:.0} p50={} p99={} max={}",
                self.latency.mean_us, self.latency.p50_us, self.latency.p99_us, self.latency.max_us
            );
        }
        if self.data_timeout {
            println!("Run ended after waiting {:?} for worker data", DATA_WAIT_POLL * DATA_WAIT_ITERATIONS);
        }
    }
}

pub struct Aggregator {
    rx: TelemetryReceiver,
    status: Arc<StatusVector>,
    worker_tps: Vec<f64>,
    window: VecDeque<f64>,
    expected: Option<u64>,
    progress: ProgressBar,
    latency: OpLatency,
}

impl Aggregator {
    /// `expected` ends the run once that many operations are reported.
    pub fn new(rx: TelemetryReceiver, status: Arc<StatusVector>, thread_max: usize, expected: Option<u64>) -> Self {
        Self {
            rx,
            status,
            worker_tps: vec![0.0; thread_max.max(1)],
            window: VecDeque::with_capacity(TREND_WINDOW),
            expected,
            progress: ProgressBar::hidden(),
            latency: OpLatency::new(),
        }
    }

    /// Render progress on stderr.
    pub fn with_progress(mut self) -> Self {
        let pb = match self.expected {
            Some(n) => {
                let pb = ProgressBar::with_draw_target(Some(n), ProgressDrawTarget::stderr());
                pb.set_style(
                    ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ops {msg}")
                        .unwrap_or_else(|_| ProgressStyle::default_bar()),
                );
                pb
            }
            None => {
                let pb = ProgressBar::with_draw_target(None, ProgressDrawTarget::stderr());
                pb.set_style(
                    ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {pos} ops {msg}")
                        .unwrap_or_else(|_| ProgressStyle::default_spinner()),
                );
                pb
            }
        };
        self.progress = pb;
        self
    }

    pub async fn run(mut self) -> RunSummary {
        let started = Instant::now();
        let mut total_ops = 0u64;
        let mut max_tps = 0.0f64;
        let mut max_op = Duration::ZERO;
        let mut idle_polls = 0u32;
        let mut data_timeout = false;

        loop {
            match tokio::time::timeout(DATA_WAIT_POLL, self.rx.recv()).await {
                Ok(Some(t)) => {
                    idle_polls = 0;
                    total_ops += t.ops;
                    let slot = t.worker % self.worker_tps.len();
                    self.worker_tps[slot] = t.tps();
                    let tps: f64 = self.worker_tps.iter().sum();
                    max_tps = max_tps.max(tps);
                    if self.window.len() == TREND_WINDOW {
                        self.window.pop_front();
                    }
                    self.window.push_back(tps);

                    if t.ops > 0 {
                        let per_op = t.per_op();
                        max_op = max_op.max(per_op);
                        self.latency.record_batch(per_op, t.ops);
                    }

                    self.progress.set_position(total_ops);
                    self.progress.set_message(format!(
                        "workers {} | batch {:.3}s | tps {:.0} | errors {} | trend {:+.2}",
                        self.status.admitted(),
                        t.elapsed.as_secs_f64(),
                        tps,
                        self.status.errors(),
                        ols_slope(self.window.iter())
                    ));

                    if matches!(self.expected, Some(n) if total_ops >= n) {
                        debug!("aggregator reached {} operations", total_ops);
                        break;
                    }
                }
                // every sender dropped
                Ok(None) => break,
                Err(_) => {
                    if !self.status.is_running() {
                        break;
                    }
                    idle_polls += 1;
                    if idle_polls >= DATA_WAIT_ITERATIONS {
                        warn!(
                            "no worker data for {:?}; ending run",
                            DATA_WAIT_POLL * DATA_WAIT_ITERATIONS
                        );
                        data_timeout = true;
                        self.status.stop();
                        break;
                    }
                }
            }
        }
        self.progress.finish_and_clear();

        let wall = started.elapsed();
        let latency = self.latency.summary();
        RunSummary {
            admitted: self.status.admitted(),
            errors: self.status.errors(),
            total_ops,
            wall,
            trend: ols_slope(self.window.iter()),
            avg_tps: if wall.as_secs_f64() > 0.0 {
                total_ops as f64 / wall.as_secs_f64()
            } else {
                0.0
            },
            max_tps,
            avg_op_time: Duration::from_secs_f64(latency.mean_us / 1e6),
            max_op_time: max_op,
            latency,
            data_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ols_slope() {
        let flat = [5.0, 5.0, 5.0];
        assert_eq!(ols_slope(flat.iter()), 0.0);
        let rising = [1.0, 3.0, 5.0, 7.0];
        assert!((ols_slope(rising.iter()) - 2.0).abs() < 1e-9);
        let falling = [10.0, 8.0, 6.0];
        assert!((ols_slope(falling.iter()) + 2.0).abs() < 1e-9);
        assert_eq!(ols_slope([1.0].iter()), 0.0);
    }

    #[tokio::test]
    async fn test_stops_at_expected_ops() {
        let (tx, rx) = mpsc::channel(16);
        let status = Arc::new(StatusVector::new());
        status.reset();
        let agg = Aggregator::new(rx, status.clone(), 4, Some(30));
        let handle = tokio::spawn(agg.run());
        for w in 0..3 {
            tx.send(Telemetry {
                worker: w,
                ops: 10,
                elapsed: Duration::from_millis(10),
            })
            .await
            .unwrap();
        }
        let summary = handle.await.unwrap();
        assert_eq!(summary.total_ops, 30);
        assert!((summary.max_tps - 3000.0).abs() < 1.0);
        assert!(!summary.failed());
        assert_eq!(summary.latency.count, 30);
    }

    #[test]
    fn test_per_op_wide_and_empty_batches() {
        let wide = Telemetry {
            worker: 0,
            ops: 1u64 << 32,
            elapsed: Duration::from_secs(1u64 << 33),
        };
        assert_eq!(wide.per_op(), Duration::from_secs(2));
        let empty = Telemetry {
            worker: 0,
            ops: 0,
            elapsed: Duration::from_secs(1),
        };
        assert_eq!(empty.per_op(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_workers_end_run_after_data_wait() {
        let (tx, rx) = mpsc::channel(16);
        let status = Arc::new(StatusVector::new());
        status.reset();
        let summary = Aggregator::new(rx, status.clone(), 2, Some(10)).run().await;
        assert!(summary.data_timeout);
        assert!(summary.failed());
        assert_eq!(summary.total_ops, 0);
        assert!(status.is_stopped());
        drop(tx);
    }

    #[tokio::test]
    async fn test_run_flag_ends_open_run() {
        let (tx, rx) = mpsc::channel(16);
        let status = Arc::new(StatusVector::new());
        status.reset();
        let handle = tokio::spawn(Aggregator::new(rx, status.clone(), 2, None).run());
        tx.send(Telemetry {
            worker: 1,
            ops: 5,
            elapsed: Duration::from_millis(5),
        })
        .await
        .unwrap();
        status.finish();
        let summary = tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert_eq!(summary.total_ops, 5);
        assert!(!summary.data_timeout);
        drop(tx);
    }
}
