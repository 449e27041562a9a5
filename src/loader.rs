// src/loader.rs
//
// Entry points that move documents into or out of collections: the
// inventory-driven load, streamed JSON ingest, and key or scan reads.

use std::io::Write;

use futures::stream::{self, StreamExt};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

use crate::bandwidth::{batch_size_for, BandwidthProbe};
use crate::cluster::{Keyspace, Session};
use crate::config::RunConfig;
use crate::constants::{KEY_COUNTER_TOKEN, STREAM_BUFFER_SIZE};
use crate::driver::{run_fixed, run_ramp, OpMode, RunContext, Task};
use crate::error::{CbError, CbResult};
use crate::inventory::{document_key, Schema};
use crate::live_stats::RunSummary;
use crate::provision::{ProvisionReport, Provisioner};
use crate::rules::apply_rules;

// =============================================================================
// Inventory load
// =============================================================================

#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub record_count: u64,
    pub batch_size: u64,
    pub replicas: u32,
    /// Size batches from a bandwidth probe
    pub probe: bool,
    /// Operations of the mixed step after loading; 0 skips the step
    pub operations: u64,
    pub write_percent: u32,
    pub random_keys: bool,
    /// Replace the mixed step with a ramp run
    pub ramp: bool,
}

impl LoadOptions {
    pub fn from_config(run: &RunConfig) -> Self {
        Self {
            record_count: run.record_count,
            batch_size: run.batch_size,
            replicas: run.replicas,
            probe: run.bandwidth_probe,
            operations: 0,
            write_percent: run.write_percent,
            random_keys: run.random_keys,
            ramp: false,
        }
    }

    pub fn with_operations(mut self, ops: u64) -> Self {
        self.operations = ops;
        self
    }

    pub fn with_ramp(mut self, ramp: bool) -> Self {
        self.ramp = ramp;
        self
    }
}

/// One driver step and its outcome.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub label: String,
    pub keyspace: Keyspace,
    pub summary: RunSummary,
}

#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub provisioned: ProvisionReport,
    pub steps: Vec<StepReport>,
    pub linked: usize,
    /// A step failed; the steps after it and the rules did not run
    pub aborted: bool,
}

impl LoadReport {
    pub fn failed(&self) -> bool {
        self.aborted
    }

    pub fn total_ops(&self) -> u64 {
        self.steps.iter().map(|s| s.summary.total_ops).sum()
    }

    fn push(&mut self, label: &str, keyspace: Keyspace, summary: RunSummary) -> bool {
        let failed = summary.failed();
        if failed {
            warn!("{} step on {} failed; stopping the load", label, keyspace);
            self.aborted = true;
        }
        self.steps.push(StepReport {
            label: label.to_string(),
            keyspace,
            summary,
        });
        !failed
    }
}

/// Provision `schema`, load every collection, apply the rules and wait for
/// the indexes to cover the data. A mixed or ramp step follows when asked.
pub async fn load_from_inventory(ctx: &RunContext, schema: &Schema, opts: &LoadOptions) -> CbResult<LoadReport> {
    let session = &ctx.session;
    let provisioner = Provisioner::new(session, opts.record_count, opts.replicas);
    let mut report = LoadReport {
        provisioned: provisioner.provision(schema).await?,
        ..Default::default()
    };

    let throughput = match (opts.probe, schema.buckets.first()) {
        (true, Some(bucket)) => match BandwidthProbe::new(&bucket.name).run(session).await {
            Ok(tp) => Some(tp),
            Err(e) => {
                warn!("bandwidth probe failed, keeping configured batch sizes: {}", e);
                None
            }
        },
        _ => None,
    };

    for coll in schema.collections() {
        let count = coll.effective_count(opts.record_count);
        let mut batch = coll.effective_batch_size(opts.batch_size);
        if let Some(tp) = throughput {
            batch = batch_size_for(tp, coll.doc_size, ctx.settings.threads, batch);
        }
        debug!("{}: {} records in batches of {}", coll.keyspace(), count, batch);
        let task = Task::from_collection(coll, count, batch, OpMode::KV, 100);
        let summary = run_fixed(ctx, task).await?;
        if !report.push("Load", coll.keyspace(), summary) {
            return Ok(report);
        }
    }

    if !schema.rules.is_empty() {
        report.linked = apply_rules(session, schema).await?;
        info!("rules linked {} documents", report.linked);
    }
    if session.query_available() {
        provisioner.wait_for_indexes(schema).await?;
    } else {
        warn!("query service unavailable; not waiting for indexes");
    }

    if opts.operations == 0 && !opts.ramp {
        return Ok(report);
    }
    for coll in schema.collections() {
        let count = coll.effective_count(opts.record_count);
        let batch = coll.effective_batch_size(opts.batch_size);
        let mode = OpMode::KV.with_random(opts.random_keys);
        let task = Task::from_collection(coll, count, batch, mode, opts.write_percent);
        let (label, summary) = if opts.ramp {
            ("Ramp", run_ramp(ctx, task).await?)
        } else {
            ("Run", run_fixed(ctx, task.with_operations(opts.operations)).await?)
        };
        // a ramp always ends on the stop flag, so only errors count
        if !report.push(label, coll.keyspace(), summary) {
            break;
        }
    }
    Ok(report)
}

// =============================================================================
// Streamed ingest
// =============================================================================

/// Decode every complete JSON value at the front of `buf`, returning them
/// with the number of bytes consumed. A value cut off by the end of the
/// buffer is left for the next read unless the input has ended.
fn decode_available(buf: &[u8], at_eof: bool) -> CbResult<(Vec<Value>, usize)> {
    let mut values = serde_json::Deserializer::from_slice(buf).into_iter::<Value>();
    let mut out = Vec::new();
    loop {
        match values.next() {
            Some(Ok(v)) => out.push(v),
            Some(Err(e)) if e.is_eof() && !at_eof => break,
            Some(Err(e)) => return Err(e.into()),
            None => break,
        }
    }
    Ok((out, values.byte_offset()))
}

/// The stored key of a streamed object: its `key_field` value when present
/// (strings verbatim, integers as record numbers), else the next counter.
fn stream_key(ks: &Keyspace, obj: &Map<String, Value>, key_field: Option<&str>, counter: &mut u64) -> String {
    match key_field.and_then(|f| obj.get(f)) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) if n.as_u64().is_some() => document_key(ks, n.as_u64().unwrap_or_default()),
        _ => {
            *counter += 1;
            document_key(ks, *counter)
        }
    }
}

async fn upsert_all(session: &Session, ks: &Keyspace, docs: &[(String, Value)], width: usize) -> CbResult<u64> {
    let results: Vec<CbResult<()>> = stream::iter(docs)
        .map(|(key, doc)| session.upsert(ks, key, doc))
        .buffer_unordered(width.max(1))
        .collect()
        .await;
    for r in results {
        r?;
    }
    Ok(docs.len() as u64)
}

/// Insert every JSON object read from `reader` into `ks`. Top-level arrays
/// are flattened; other values are skipped. Returns the number inserted.
pub async fn load_from_stream<R>(
    session: &Session,
    ks: &Keyspace,
    key_field: Option<&str>,
    width: usize,
    mut reader: R,
) -> CbResult<u64>
where
    R: AsyncRead + Unpin,
{
    let mut counter = match session.collection_count(ks).await {
        Ok(n) => n,
        Err(e) => {
            warn!("cannot count {}, numbering keys from 1: {}", ks, e);
            0
        }
    };
    debug!("streaming into {} with keys above {}", ks, counter);

    let mut buf: Vec<u8> = Vec::with_capacity(STREAM_BUFFER_SIZE);
    let mut chunk = vec![0u8; STREAM_BUFFER_SIZE];
    let mut inserted = 0u64;
    let mut skipped = 0u64;
    loop {
        let n = reader.read(&mut chunk).await?;
        let at_eof = n == 0;
        buf.extend_from_slice(&chunk[..n]);

        let (values, consumed) = decode_available(&buf, at_eof)?;
        buf.drain(..consumed);

        let mut docs = Vec::with_capacity(values.len());
        for value in values {
            let items = match value {
                Value::Array(items) => items,
                other => vec![other],
            };
            for item in items {
                match item {
                    Value::Object(obj) => {
                        let key = stream_key(ks, &obj, key_field, &mut counter);
                        docs.push((key, Value::Object(obj)));
                    }
                    other => {
                        skipped += 1;
                        warn!("skipping non-object input value: {}", other);
                    }
                }
            }
        }
        inserted += upsert_all(session, ks, &docs, width).await?;

        if at_eof {
            break;
        }
    }
    info!("inserted {} documents into {} ({} skipped)", inserted, ks, skipped);
    Ok(inserted)
}

// =============================================================================
// Reads
// =============================================================================

fn write_document(out: &mut dyn Write, doc: &Value) -> CbResult<()> {
    serde_json::to_writer_pretty(&mut *out, doc)?;
    writeln!(out)?;
    Ok(())
}

/// Print the document stored under `key`. A key containing `%N` is read
/// with N = 1, 2, ... until the first missing document.
pub async fn read_by_key(session: &Session, ks: &Keyspace, key: &str, out: &mut dyn Write) -> CbResult<u64> {
    if !key.contains(KEY_COUNTER_TOKEN) {
        let doc = session
            .get(ks, key)
            .await?
            .ok_or_else(|| CbError::DocumentNotFound(key.to_string()))?;
        write_document(out, &doc)?;
        return Ok(1);
    }

    let mut printed = 0u64;
    loop {
        let current = key.replace(KEY_COUNTER_TOKEN, &(printed + 1).to_string());
        match session.get(ks, &current).await? {
            Some(doc) => write_document(out, &doc)?,
            None => {
                debug!("no document {}; done", current);
                break;
            }
        }
        printed += 1;
    }
    Ok(printed)
}

/// Print every document of `ks`, enumerated through a `meta().id` query.
pub async fn read_by_scan(session: &Session, ks: &Keyspace, out: &mut dyn Write) -> CbResult<u64> {
    let rows = session.query_rows(ks, Some("meta().id"), None, None, false).await?;
    let mut printed = 0u64;
    for row in rows {
        let Some(id) = row.get("id").and_then(Value::as_str) else {
            continue;
        };
        match session.get(ks, id).await? {
            Some(doc) => {
                write_document(out, &doc)?;
                printed += 1;
            }
            None => debug!("{} vanished during scan", id),
        }
    }
    Ok(printed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_leaves_partial_value() {
        let (vals, used) = decode_available(br#"{"a":1} {"b":2} {"c":"#, false).unwrap();
        assert_eq!(vals, vec![json!({"a":1}), json!({"b":2})]);
        assert_eq!(&br#"{"a":1} {"b":2} {"c":"#[used..], br#" {"c":"#);
        assert!(decode_available(br#"{"c":"#, true).is_err());
        assert!(decode_available(b"{]", false).is_err());
    }

    #[test]
    fn test_stream_key_choices() {
        let ks = Keyspace::new("b", "s", "people");
        let mut n = 3;
        let obj = json!({"id": "alice", "num": 9}).as_object().cloned().unwrap();
        assert_eq!(stream_key(&ks, &obj, Some("id"), &mut n), "alice");
        assert_eq!(stream_key(&ks, &obj, Some("num"), &mut n), "people:9");
        assert_eq!(stream_key(&ks, &obj, Some("missing"), &mut n), "people:4");
        assert_eq!(stream_key(&ks, &obj, None, &mut n), "people:5");
    }
}
