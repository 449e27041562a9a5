// src/import.rs
//! Relational table import.
//!
//! A [`TableSource`] yields a table description and its rows. The importer
//! sizes and provisions the target keyspace, renders each row as a JSON
//! document keyed by an incrementing integer, and writes rows through a
//! bounded set of in-flight upserts. When more than `batch_size` upserts are
//! pending the producer backs off exponentially until some complete.

use std::fs::File;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use csv::{ReaderBuilder, StringRecord};
use serde_json::{Map, Number, Value};
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::cluster::{Keyspace, Session};
use crate::constants::{IMPORT_BACKOFF_MAX, IMPORT_BACKOFF_START};
use crate::error::{CbError, CbResult};
use crate::inventory::bucket_quota;
use crate::provision::Provisioner;

#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<String>,
    /// Bytes of table data at the source
    pub total_bytes: u64,
}

impl TableSchema {
    pub fn size_mb(&self) -> f64 {
        self.total_bytes as f64 / (1024.0 * 1024.0)
    }
}

/// A row-at-a-time reader over one source table.
#[async_trait]
pub trait TableSource: Send {
    fn schema(&self) -> &TableSchema;

    /// Next row with one value per column, `None` once the table is drained.
    async fn next_row(&mut self) -> CbResult<Option<Vec<Value>>>;
}

/// Bucket quota for a table of `size_mb`: four times the data, rounded to
/// the nearest GiB.
pub fn import_quota_mb(size_mb: f64) -> u64 {
    1024 * (size_mb * 4.0 / 1024.0).round() as u64
}

/// Pair each column with its value; missing trailing values become null.
pub fn row_document(columns: &[String], row: Vec<Value>) -> Value {
    let mut values = row.into_iter();
    let doc: Map<String, Value> = columns
        .iter()
        .map(|c| (c.clone(), values.next().unwrap_or(Value::Null)))
        .collect();
    Value::Object(doc)
}

// -----------------------------------------------------------------------------
// CSV source
// -----------------------------------------------------------------------------

/// Typed value of one CSV cell: empty is null, then integer, float,
/// boolean, else the text.
pub fn parse_cell(text: &str) -> Value {
    let t = text.trim();
    if t.is_empty() {
        return Value::Null;
    }
    if let Ok(i) = t.parse::<i64>() {
        return Value::from(i);
    }
    if let Some(n) = t.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(n);
    }
    match t.to_ascii_lowercase().as_str() {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(text.to_string()),
    }
}

/// Header-first CSV file; the table is named after the file stem.
pub struct CsvSource {
    path: PathBuf,
    schema: TableSchema,
    reader: csv::Reader<File>,
    record: StringRecord,
}

impl CsvSource {
    pub fn open(path: &Path) -> CbResult<Self> {
        let file = File::open(path)
            .map_err(|e| CbError::Config(format!("cannot open {}: {}", path.display(), e)))?;
        let total_bytes = file.metadata()?.len();
        let mut reader = ReaderBuilder::new().has_headers(true).flexible(true).from_reader(file);
        let columns = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("table")
            .to_string();
        Ok(Self {
            path: path.to_path_buf(),
            schema: TableSchema {
                name,
                columns,
                total_bytes,
            },
            reader,
            record: StringRecord::new(),
        })
    }
}

#[async_trait]
impl TableSource for CsvSource {
    fn schema(&self) -> &TableSchema {
        &self.schema
    }

    async fn next_row(&mut self) -> CbResult<Option<Vec<Value>>> {
        if !self.reader.read_record(&mut self.record)? {
            debug!("{} drained", self.path.display());
            return Ok(None);
        }
        Ok(Some(self.record.iter().map(parse_cell).collect()))
    }
}

// -----------------------------------------------------------------------------
// Importer
// -----------------------------------------------------------------------------

fn reap(tasks: &mut JoinSet<CbResult<()>>) -> CbResult<()> {
    while let Some(done) = tasks.try_join_next() {
        done.map_err(std::io::Error::from)??;
    }
    Ok(())
}

/// Copy every row of `source` into `ks`, keyed 1, 2, ... Returns the row count.
pub async fn import_table(
    session: &Session,
    source: &mut dyn TableSource,
    ks: &Keyspace,
    batch_size: usize,
    replicas: u32,
) -> CbResult<u64> {
    let schema = source.schema().clone();
    let quota = bucket_quota(
        &ks.bucket,
        import_quota_mb(schema.size_mb()),
        session.info().memory_quota_mb,
    );
    info!(
        "importing table {} ({} columns, {:.1} MiB) into {} with a {} MiB bucket",
        schema.name,
        schema.columns.len(),
        schema.size_mb(),
        ks,
        quota
    );
    Provisioner::new(session, 0, replicas).ensure_keyspace(ks, quota).await?;

    let limit = batch_size.max(1);
    let mut tasks: JoinSet<CbResult<()>> = JoinSet::new();
    let mut key = 0u64;
    while let Some(row) = source.next_row().await? {
        let mut backoff = IMPORT_BACKOFF_START;
        reap(&mut tasks)?;
        while tasks.len() > limit {
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(IMPORT_BACKOFF_MAX);
            reap(&mut tasks)?;
        }

        key += 1;
        let doc = row_document(&schema.columns, row);
        let session = session.clone();
        let ks = ks.clone();
        tasks.spawn(async move { session.upsert(&ks, &key.to_string(), &doc).await });
    }
    while let Some(done) = tasks.join_next().await {
        done.map_err(std::io::Error::from)??;
    }
    info!("imported {} rows into {}", key, ks);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_import_quota() {
        assert_eq!(import_quota_mb(0.5), 0);
        assert_eq!(import_quota_mb(200.0), 1024);
        assert_eq!(import_quota_mb(1000.0), 4096);
    }

    #[test]
    fn test_parse_cell_types() {
        assert_eq!(parse_cell(""), Value::Null);
        assert_eq!(parse_cell("42"), json!(42));
        assert_eq!(parse_cell("-1.5"), json!(-1.5));
        assert_eq!(parse_cell("TRUE"), json!(true));
        assert_eq!(parse_cell("Main St"), json!("Main St"));
    }

    #[test]
    fn test_row_document_pads_missing_values() {
        let cols = vec!["id".to_string(), "name".to_string(), "age".to_string()];
        let doc = row_document(&cols, vec![json!(1), json!("ann")]);
        assert_eq!(doc, json!({"id": 1, "name": "ann", "age": null}));
    }

    #[tokio::test]
    async fn test_csv_source_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("people.csv");
        std::fs::write(&path, "id,name,active\n1,ann,true\n2,bob,false\n").unwrap();
        let mut src = CsvSource::open(&path).unwrap();
        assert_eq!(src.schema().name, "people");
        assert_eq!(src.schema().columns, vec!["id", "name", "active"]);
        assert_eq!(src.next_row().await.unwrap(), Some(vec![json!(1), json!("ann"), json!(true)]));
        assert!(src.next_row().await.unwrap().is_some());
        assert_eq!(src.next_row().await.unwrap(), None);
    }
}
