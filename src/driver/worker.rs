// src/driver/worker.rs
//
// One worker: connect, build a renderer, then run batches until the record
// counter is exhausted or the stop flag is raised.

use std::sync::Arc;
use std::time::Instant;

use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use tracing::{debug, error, warn};

use super::{OpMode, RecordCounter, RunContext, Task};
use crate::cluster::Session;
use crate::error::{CbError, CbResult};
use crate::inventory::document_key;
use crate::live_stats::{Telemetry, TelemetrySender};

/// How a worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Stop flag was already up before connecting
    NotStarted,
    /// Counter exhausted
    Finished,
    /// Stop flag raised by someone else
    Stopped,
    /// This worker raised the stop flag
    Failed,
}

/// One planned operation of a batch.
#[derive(Debug)]
enum Op {
    Get(String),
    Upsert(String, Value),
    Remove(String),
    Query(u64),
}

pub struct Worker {
    id: usize,
    ctx: RunContext,
    task: Arc<Task>,
    counter: Arc<RecordCounter>,
    telemetry: TelemetrySender,
}

impl Worker {
    pub fn new(id: usize, ctx: RunContext, task: Arc<Task>, counter: Arc<RecordCounter>, telemetry: TelemetrySender) -> Self {
        Self {
            id,
            ctx,
            task,
            counter,
            telemetry,
        }
    }

    fn fail(&self, what: &str, err: &CbError) -> WorkerExit {
        error!("worker {}: {}: {}", self.id, what, err);
        self.ctx.status.record_error();
        self.ctx.status.stop();
        WorkerExit::Failed
    }

    pub async fn run(self) -> WorkerExit {
        let status = self.ctx.status.clone();
        if status.is_stopped() {
            return WorkerExit::NotStarted;
        }

        // connecting: own data connections, shared discovery
        let session = self.ctx.session.fork();
        match session.collection_exists(&self.task.keyspace).await {
            Ok(true) => {}
            Ok(false) => {
                let err = CbError::NotFound(format!("collection {}", self.task.keyspace));
                return self.fail("connect", &err);
            }
            Err(e) => return self.fail("connect", &e),
        }

        // compiling
        if self.task.mode.base() == OpMode::QUERY && self.task.id_field.is_empty() {
            let err = CbError::Template("query mode needs an id field".into());
            return self.fail("template", &err);
        }
        let mut renderer = self.task.template.renderer();
        let mixer = self.task.mixer();
        let random = self.task.mode.is_random();

        status.mark_connected();
        debug!("worker {} connected to {}", self.id, self.task.keyspace);

        loop {
            if status.is_stopped() {
                return WorkerExit::Stopped;
            }

            let mut plan = Vec::with_capacity(self.task.batch_size as usize);
            for _ in 0..self.task.batch_size {
                let Some(n) = self.counter.next(random) else { break };
                let key = document_key(&self.task.keyspace, n);
                let op = match self.task.mode.base() {
                    OpMode::REMOVE => Op::Remove(key),
                    _ if mixer.is_write(n) => Op::Upsert(key, renderer.render(Some(n))),
                    OpMode::QUERY => Op::Query(n),
                    _ => Op::Get(key),
                };
                plan.push(op);
            }
            if plan.is_empty() {
                return WorkerExit::Finished;
            }

            let ops = plan.len() as u64;
            let limit = self.ctx.settings.latency_limit;
            let started = Instant::now();
            let dispatch = async {
                if self.ctx.settings.parallel_batches {
                    self.dispatch_parallel(&session, plan).await
                } else {
                    self.dispatch_serial(&session, plan).await
                }
            };
            let result = match tokio::time::timeout(limit, dispatch).await {
                Ok(r) => r,
                Err(_) => Err(CbError::Timeout(format!("batch of {} still running after {:?}", ops, limit))),
            };
            let elapsed = started.elapsed();

            if let Err(e) = result {
                return self.fail("batch", &e);
            }
            let sent = self
                .telemetry
                .send(Telemetry {
                    worker: self.id,
                    ops,
                    elapsed,
                })
                .await;
            if sent.is_err() {
                debug!("worker {}: status aggregator is gone; stopping run", self.id);
                status.stop();
                return WorkerExit::Stopped;
            }

            if elapsed >= limit {
                warn!(
                    "worker {}: batch of {} took {:.2?} (limit {:?}); stopping run",
                    self.id, ops, elapsed, limit
                );
                status.record_error();
                status.stop();
                return WorkerExit::Failed;
            }
        }
    }

    async fn execute(&self, session: &Session, op: Op) -> CbResult<()> {
        let ks = &self.task.keyspace;
        match op {
            Op::Get(key) => session.get(ks, &key).await.map(|_| ()),
            Op::Upsert(key, doc) => session.upsert(ks, &key, &doc).await,
            Op::Remove(key) => session.remove(ks, &key).await.map(|_| ()),
            Op::Query(n) => {
                let value = n.to_string();
                session
                    .query_rows(
                        ks,
                        Some(self.task.id_field.as_str()),
                        Some((self.task.id_field.as_str(), value.as_str())),
                        None,
                        false,
                    )
                    .await
                    .map(|_| ())
            }
        }
    }

    async fn dispatch_parallel(&self, session: &Session, plan: Vec<Op>) -> CbResult<()> {
        let mut pending: FuturesUnordered<_> = plan.into_iter().map(|op| self.execute(session, op)).collect();
        let mut first_err = None;
        while let Some(r) = pending.next().await {
            if let Err(e) = r {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    async fn dispatch_serial(&self, session: &Session, plan: Vec<Op>) -> CbResult<()> {
        let mut first_err = None;
        for op in plan {
            if let Err(e) = self.execute(session, op).await {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
