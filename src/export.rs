//! Collection export to CSV or JSON files
//!
//! Every selected keyspace is drained with `SELECT *` (a primary index is
//! created first when missing) and written to
//! `<directory>/<bucket>.<scope>.<collection>.{csv,json}`. JSON files hold
//! one array of documents, which `load` can stream back in.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cluster::{Keyspace, Session};
use crate::error::{CbError, CbResult};

/// Scopes the cluster manages for itself.
const SYSTEM_SCOPE: &str = "_system";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Json,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
        }
    }
}

/// Restricts the export. Each level takes a name or a glob (`*` any run,
/// `?` one character); `None` matches everything at that level.
#[derive(Debug, Clone, Default)]
pub struct ExportFilter {
    pub bucket: Option<String>,
    pub scope: Option<String>,
    pub collection: Option<String>,
}

/// One level of a compiled [`ExportFilter`].
#[derive(Debug, Clone)]
enum NameMatch {
    Any,
    Exact(String),
    Glob(Regex),
}

impl NameMatch {
    fn compile(want: Option<&str>) -> CbResult<Self> {
        let Some(w) = want else {
            return Ok(NameMatch::Any);
        };
        if !w.contains(['*', '?']) {
            return Ok(NameMatch::Exact(w.to_string()));
        }
        let pattern = format!(
            "^{}$",
            regex::escape(w).replace(r"\*", ".*").replace(r"\?", ".")
        );
        Regex::new(&pattern)
            .map(NameMatch::Glob)
            .map_err(|e| CbError::Config(format!("bad export pattern '{}': {}", w, e)))
    }

    fn matches(&self, name: &str) -> bool {
        match self {
            NameMatch::Any => true,
            NameMatch::Exact(w) => w == name,
            NameMatch::Glob(re) => re.is_match(name),
        }
    }
}

#[derive(Debug, Clone)]
struct KeyspaceMatcher {
    bucket: NameMatch,
    scope: NameMatch,
    collection: NameMatch,
}

impl ExportFilter {
    fn compile(&self) -> CbResult<KeyspaceMatcher> {
        Ok(KeyspaceMatcher {
            bucket: NameMatch::compile(self.bucket.as_deref())?,
            scope: NameMatch::compile(self.scope.as_deref())?,
            collection: NameMatch::compile(self.collection.as_deref())?,
        })
    }
}

pub struct Exporter {
    directory: PathBuf,
    format: ExportFormat,
}

impl Exporter {
    pub fn new<P: AsRef<Path>>(directory: P, format: ExportFormat) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
            format,
        }
    }

    pub fn path_for(&self, ks: &Keyspace) -> PathBuf {
        self.directory.join(format!("{}.{}", ks, self.format.extension()))
    }

    /// Keyspaces selected by `filter`, in listing order.
    pub async fn keyspaces(&self, session: &Session, filter: &ExportFilter) -> CbResult<Vec<Keyspace>> {
        let want = filter.compile()?;
        let mut out = Vec::new();
        for bucket in session.list_buckets().await? {
            if !want.bucket.matches(&bucket) {
                continue;
            }
            for scope in session.list_scopes(&bucket).await? {
                if scope.name == SYSTEM_SCOPE || !want.scope.matches(&scope.name) {
                    continue;
                }
                for coll in &scope.collections {
                    if want.collection.matches(coll) {
                        out.push(Keyspace::new(&bucket, &scope.name, coll));
                    }
                }
            }
        }
        Ok(out)
    }

    /// Export every selected keyspace; returns the files written.
    pub async fn export(&self, session: &Session, filter: &ExportFilter) -> CbResult<Vec<PathBuf>> {
        std::fs::create_dir_all(&self.directory).map_err(|e| {
            CbError::Config(format!("cannot create {}: {}", self.directory.display(), e))
        })?;
        let keyspaces = self.keyspaces(session, filter).await?;
        if keyspaces.is_empty() {
            warn!("nothing matched the export selection");
        }
        let mut written = Vec::with_capacity(keyspaces.len());
        for ks in keyspaces {
            let docs = drain(session, &ks).await?;
            let path = self.path_for(&ks);
            match self.format {
                ExportFormat::Csv => write_csv(&path, &docs)?,
                ExportFormat::Json => write_json(&path, &docs)?,
            }
            info!("exported {} documents from {} to {}", docs.len(), ks, path.display());
            written.push(path);
        }
        Ok(written)
    }
}

/// Every document of `ks`. `SELECT *` rows wrap the document under the
/// collection name.
async fn drain(session: &Session, ks: &Keyspace) -> CbResult<Vec<Value>> {
    session.create_primary_index(ks, 0).await?;
    let rows = session.query_rows(ks, Some("*"), None, None, false).await?;
    debug!("{} rows from {}", rows.len(), ks);
    Ok(rows
        .into_iter()
        .map(|mut row| match row.get_mut(&ks.collection).map(Value::take) {
            Some(doc) => doc,
            None => row,
        })
        .collect())
}

/// Union of top-level field names, in first-seen order.
pub fn columns(docs: &[Value]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut cols = Vec::new();
    for obj in docs.iter().filter_map(Value::as_object) {
        for key in obj.keys() {
            if seen.insert(key.as_str()) {
                cols.push(key.clone());
            }
        }
    }
    cols
}

/// Text of one CSV cell; nested values are written as JSON.
pub fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

pub fn write_csv(path: &Path, docs: &[Value]) -> CbResult<()> {
    let cols = columns(docs);
    let mut w = csv::Writer::from_path(path)?;
    w.write_record(&cols)?;
    for doc in docs {
        w.write_record(cols.iter().map(|c| cell(doc.get(c))))?;
    }
    w.flush()?;
    Ok(())
}

pub fn write_json(path: &Path, docs: &[Value]) -> CbResult<()> {
    let mut w = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut w, docs)?;
    writeln!(w)?;
    w.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_columns_and_cells() {
        let docs = vec![json!({"b": 1, "a": "x"}), json!({"a": "y", "c": {"d": [1, 2]}})];
        let cols = columns(&docs);
        assert_eq!(cols.len(), 3);
        assert!(cols.contains(&"c".to_string()));
        assert_eq!(cell(docs[1].get("c")), r#"{"d":[1,2]}"#);
        assert_eq!(cell(docs[1].get("b")), "");
        assert_eq!(cell(docs[0].get("a")), "x");
    }

    #[test]
    fn test_write_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.s.c.csv");
        write_csv(&path, &[json!({"id": 1, "tags": ["a"]}), json!({"id": 2})]).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "id,tags");
        assert_eq!(lines[1], r#"1,"[""a""]""#);
        assert_eq!(lines[2], "2,");
    }

    #[test]
    fn test_filter_globs() {
        assert!(NameMatch::compile(None).unwrap().matches("x"));
        let exact = NameMatch::compile(Some("user_data")).unwrap();
        assert!(exact.matches("user_data"));
        assert!(!exact.matches("user_images"));
        let glob = NameMatch::compile(Some("user_*")).unwrap();
        assert!(glob.matches("user_images"));
        assert!(!glob.matches("timecards"));
        let one = NameMatch::compile(Some("a.?")).unwrap();
        assert!(one.matches("a.b"));
        assert!(!one.matches("axb"));
        assert!(!one.matches("a.bc"));
    }

    #[test]
    fn test_path_for() {
        let e = Exporter::new("/tmp/out", ExportFormat::Json);
        let ks = Keyspace::new("b", "s", "c");
        assert_eq!(e.path_for(&ks), PathBuf::from("/tmp/out/b.s.c.json"));
    }
}
