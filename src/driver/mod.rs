// src/driver/mod.rs
//! Workload driver.
//!
//! A step drives one collection: workers are tokio tasks admitted under the
//! connection throttle, each pulling record numbers from a shared counter,
//! rendering documents from the collection template, and reporting one
//! telemetry record per batch to the aggregator in [`crate::live_stats`].

pub mod launcher;
pub mod mixer;
pub mod status;
pub mod worker;

use std::fmt;
use std::ops::BitOr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand_distr::{Distribution, Uniform};

use crate::cluster::{Keyspace, Session};
use crate::config::RunConfig;
use crate::error::{CbError, CbResult};
use crate::inventory::Collection;
use crate::template::DocTemplate;

pub use launcher::{run_fixed, run_ramp};
pub use mixer::Mixer;
pub use status::StatusVector;

/// Operation mode bits. Exactly one of KV, QUERY, REMOVE is set;
/// RANDOM_KEYS may be added to any of them.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpMode(u8);

impl OpMode {
    pub const KV: OpMode = OpMode(0x01);
    pub const QUERY: OpMode = OpMode(0x02);
    pub const REMOVE: OpMode = OpMode(0x04);
    pub const RANDOM_KEYS: OpMode = OpMode(0x08);

    const BASE_MASK: u8 = 0x07;

    pub fn contains(self, other: OpMode) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn base(self) -> OpMode {
        OpMode(self.0 & Self::BASE_MASK)
    }

    pub fn is_random(self) -> bool {
        self.contains(Self::RANDOM_KEYS)
    }

    pub fn with_random(self, random: bool) -> Self {
        if random {
            self | Self::RANDOM_KEYS
        } else {
            OpMode(self.0 & !Self::RANDOM_KEYS.0)
        }
    }

    pub fn validate(self) -> CbResult<Self> {
        if self.base().0.count_ones() != 1 || self.0 & !0x0f != 0 {
            return Err(CbError::Config(format!("invalid operation mode {:?}", self)));
        }
        Ok(self)
    }
}

impl BitOr for OpMode {
    type Output = OpMode;

    fn bitor(self, rhs: OpMode) -> OpMode {
        OpMode(self.0 | rhs.0)
    }
}

impl fmt::Debug for OpMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        for (bit, name) in [
            (Self::KV, "KV"),
            (Self::QUERY, "QUERY"),
            (Self::REMOVE, "REMOVE"),
            (Self::RANDOM_KEYS, "RANDOM_KEYS"),
        ] {
            if self.contains(bit) {
                names.push(name);
            }
        }
        write!(f, "OpMode({})", names.join("|"))
    }
}

/// Driver knobs for one step, taken from the run configuration.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub threads: usize,
    pub thread_max: usize,
    pub parallel_batches: bool,
    pub latency_limit: Duration,
    pub throttle_interval: Duration,
    pub throttle_attempts: u32,
    pub ramp_pause: Duration,
    pub ramp_accelerate_every: Duration,
    pub ramp_grace: Duration,
    pub show_progress: bool,
}

impl RunSettings {
    pub fn from_config(run: &RunConfig) -> Self {
        Self {
            threads: run.threads,
            thread_max: run.thread_max,
            parallel_batches: run.parallel_batches,
            latency_limit: run.latency_limit,
            throttle_interval: run.throttle_interval,
            throttle_attempts: run.throttle_attempts,
            ramp_pause: run.ramp_pause,
            ramp_accelerate_every: run.ramp_accelerate_every,
            ramp_grace: run.ramp_grace,
            show_progress: false,
        }
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }
}

impl Default for RunSettings {
    fn default() -> Self {
        Self::from_config(&RunConfig::default())
    }
}

/// One collection's worth of work.
#[derive(Debug, Clone)]
pub struct Task {
    pub keyspace: Keyspace,
    pub template: Arc<DocTemplate>,
    pub id_field: String,
    pub record_count: u64,
    /// Operations to issue; random steps may differ from `record_count`
    pub operations: u64,
    pub batch_size: u64,
    pub mode: OpMode,
    pub write_percent: u32,
}

impl Task {
    pub fn from_collection(coll: &Collection, record_count: u64, batch_size: u64, mode: OpMode, write_percent: u32) -> Self {
        Self {
            keyspace: coll.keyspace(),
            template: Arc::new(coll.template.clone()),
            id_field: coll.id_field.clone(),
            record_count,
            operations: record_count,
            batch_size: batch_size.max(1),
            mode,
            write_percent,
        }
    }

    /// Issue `ops` operations over the key range. Only random steps honor
    /// it; a sequential step always covers each record once.
    pub fn with_operations(mut self, ops: u64) -> Self {
        if self.mode.is_random() {
            self.operations = ops;
        }
        self
    }

    pub fn counter(&self) -> RecordCounter {
        RecordCounter::with_budget(self.record_count, self.operations)
    }

    pub fn mixer(&self) -> Mixer {
        Mixer::new(self.write_percent)
    }
}

/// Hands out record numbers. Sequential calls yield numbers no other caller
/// sees, up to the limit. Random calls draw from `[1, limit]`; a bounded
/// counter stops after its draw budget, an open one never does.
#[derive(Debug)]
pub struct RecordCounter {
    next: AtomicU64,
    limit: u64,
    budget: u64,
    open: bool,
    uniform: Option<Uniform<u64>>,
}

impl RecordCounter {
    pub fn new(limit: u64) -> Self {
        Self::with_budget(limit, limit)
    }

    pub fn with_budget(limit: u64, budget: u64) -> Self {
        Self {
            next: AtomicU64::new(0),
            limit,
            budget,
            open: false,
            uniform: Uniform::new_inclusive(1, limit.max(1)).ok(),
        }
    }

    /// Random draws without an operation budget, for ramp runs.
    pub fn open(limit: u64) -> Self {
        Self {
            open: true,
            ..Self::new(limit)
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn next_sequential(&self) -> Option<u64> {
        let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        (n <= self.limit).then_some(n)
    }

    pub fn next_random(&self) -> Option<u64> {
        if self.limit == 0 {
            return None;
        }
        if !self.open && self.next.fetch_add(1, Ordering::SeqCst) >= self.budget {
            return None;
        }
        self.uniform.as_ref().map(|u| u.sample(&mut rand::rng()))
    }

    pub fn next(&self, random: bool) -> Option<u64> {
        if random {
            self.next_random()
        } else {
            self.next_sequential()
        }
    }
}

/// What a step needs besides its task.
#[derive(Clone)]
pub struct RunContext {
    pub session: Session,
    pub settings: Arc<RunSettings>,
    pub status: Arc<StatusVector>,
}

impl RunContext {
    pub fn new(session: Session, settings: RunSettings, status: Arc<StatusVector>) -> Self {
        Self {
            session,
            settings: Arc::new(settings),
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_mode_bits() {
        let m = (OpMode::KV | OpMode::RANDOM_KEYS).validate().unwrap();
        assert!(m.is_random());
        assert_eq!(m.base(), OpMode::KV);
        assert!(!m.with_random(false).is_random());
        assert!((OpMode::KV | OpMode::QUERY).validate().is_err());
        assert!(OpMode::RANDOM_KEYS.validate().is_err());
        assert_eq!(format!("{:?}", m), "OpMode(KV|RANDOM_KEYS)");
    }

    #[test]
    fn test_counter_sequential_is_unique_across_threads() {
        let counter = Arc::new(RecordCounter::new(10_000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let c = counter.clone();
                std::thread::spawn(move || {
                    let mut seen = Vec::new();
                    while let Some(n) = c.next_sequential() {
                        seen.push(n);
                    }
                    seen
                })
            })
            .collect();
        let mut all = HashSet::new();
        for h in handles {
            for n in h.join().unwrap() {
                assert!(all.insert(n));
            }
        }
        assert_eq!(all.len(), 10_000);
        assert!(all.iter().all(|n| (1..=10_000).contains(n)));
    }

    #[test]
    fn test_counter_random_range_and_zero() {
        let c = RecordCounter::new(5);
        for _ in 0..5 {
            let n = c.next_random().unwrap();
            assert!((1..=5).contains(&n));
        }
        assert_eq!(c.next_random(), None);
        let open = RecordCounter::open(5);
        assert!((0..200).all(|_| open.next_random().is_some_and(|n| (1..=5).contains(&n))));
        let budget = RecordCounter::with_budget(3, 50);
        assert_eq!((0..60).filter_map(|_| budget.next_random()).count(), 50);
        let empty = RecordCounter::new(0);
        assert_eq!(empty.next(false), None);
        assert_eq!(empty.next(true), None);
    }
}
