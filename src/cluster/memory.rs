//! In-process cluster backend.
//!
//! Holds buckets, scopes, collections, documents and indexes in memory and
//! answers the query shapes this crate emits. Faults can be injected (fail
//! after N data operations, added latency, whole-cluster outage, failing
//! services) so shutdown paths can be exercised without a real cluster.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use serde_json::{json, Map, Value};

use super::{
    BucketSettings, ClusterApi, ClusterInfo, EndpointPing, IndexInfo, Keyspace, NodeInfo, PingReport, ScopeInfo,
    Service,
};
use crate::constants::{DEFAULT_COLLECTION, DEFAULT_SCOPE, PRIMARY_INDEX_NAME};
use crate::error::{CbError, CbResult};

const DEFAULT_MEMORY_QUOTA_MB: u64 = 8192;

#[derive(Debug, Clone)]
struct MemIndex {
    /// `None` for the primary index
    field: Option<String>,
    /// Covering queries against this index see no rows while non-zero
    pending_polls: u32,
}

#[derive(Debug, Default)]
struct MemCollection {
    docs: BTreeMap<String, Value>,
    indexes: BTreeMap<String, MemIndex>,
}

#[derive(Debug, Default)]
struct MemBucket {
    quota_mb: u64,
    scopes: BTreeMap<String, BTreeMap<String, MemCollection>>,
}

#[derive(Debug, Default)]
struct State {
    buckets: BTreeMap<String, MemBucket>,
}

#[derive(Debug)]
struct Faults {
    /// Data operations left before every data operation fails; negative disables
    fail_after: AtomicI64,
    latency: Mutex<Duration>,
    down: AtomicBool,
    failed_services: Mutex<BTreeSet<Service>>,
    index_build_polls: Mutex<u32>,
}

impl Default for Faults {
    fn default() -> Self {
        Self {
            fail_after: AtomicI64::new(-1),
            latency: Mutex::new(Duration::ZERO),
            down: AtomicBool::new(false),
            failed_services: Mutex::new(BTreeSet::new()),
            index_build_polls: Mutex::new(0),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
    faults: Faults,
    ops: AtomicU64,
    memory_quota_mb: u64,
}

/// Cloneable handle; clones share one cluster.
#[derive(Debug, Clone)]
pub struct MemoryCluster {
    inner: Arc<Inner>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::with_quota(DEFAULT_MEMORY_QUOTA_MB)
    }

    pub fn with_quota(memory_quota_mb: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                faults: Faults::default(),
                ops: AtomicU64::new(0),
                memory_quota_mb,
            }),
        }
    }

    // ---- fault injection -------------------------------------------------

    /// Every data operation after the next `n` fails with a timeout.
    pub fn fail_after(&self, n: u64) {
        self.inner.faults.fail_after.store(n as i64, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.inner.faults.latency.lock() = latency;
    }

    /// Simulate a partition: every call fails as unreachable.
    pub fn set_down(&self, down: bool) {
        self.inner.faults.down.store(down, Ordering::SeqCst);
    }

    pub fn fail_service(&self, service: Service) {
        self.inner.faults.failed_services.lock().insert(service);
    }

    /// Indexes created from now on stay building for the next `n` polls,
    /// counting both index listings and covering queries.
    pub fn lag_index_builds(&self, n: u32) {
        *self.inner.faults.index_build_polls.lock() = n;
    }

    // ---- inspection ------------------------------------------------------

    pub fn op_count(&self) -> u64 {
        self.inner.ops.load(Ordering::SeqCst)
    }

    pub fn bucket_names(&self) -> Vec<String> {
        self.inner.state.lock().buckets.keys().cloned().collect()
    }

    pub fn bucket_quota(&self, bucket: &str) -> Option<u64> {
        self.inner.state.lock().buckets.get(bucket).map(|b| b.quota_mb)
    }

    pub fn doc_count(&self, keyspace: &Keyspace) -> usize {
        self.with_collection(keyspace, |c| c.docs.len()).unwrap_or(0)
    }

    pub fn keys(&self, keyspace: &Keyspace) -> Vec<String> {
        self.with_collection(keyspace, |c| c.docs.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn document(&self, keyspace: &Keyspace, key: &str) -> Option<Value> {
        self.with_collection(keyspace, |c| c.docs.get(key).cloned()).flatten()
    }

    pub fn index_names(&self, keyspace: &Keyspace) -> Vec<String> {
        self.with_collection(keyspace, |c| c.indexes.keys().cloned().collect())
            .unwrap_or_default()
    }

    // ---- internals -------------------------------------------------------

    fn with_collection<T>(&self, ks: &Keyspace, f: impl FnOnce(&MemCollection) -> T) -> Option<T> {
        let state = self.inner.state.lock();
        state
            .buckets
            .get(&ks.bucket)
            .and_then(|b| b.scopes.get(&ks.scope))
            .and_then(|s| s.get(&ks.collection))
            .map(f)
    }

    fn with_collection_mut<T>(&self, ks: &Keyspace, f: impl FnOnce(&mut MemCollection) -> CbResult<T>) -> CbResult<T> {
        let mut state = self.inner.state.lock();
        let coll = state
            .buckets
            .get_mut(&ks.bucket)
            .and_then(|b| b.scopes.get_mut(&ks.scope))
            .and_then(|s| s.get_mut(&ks.collection))
            .ok_or_else(|| CbError::NotFound(format!("keyspace {}", ks)))?;
        f(coll)
    }

    fn check_reachable(&self) -> CbResult<()> {
        if self.inner.faults.down.load(Ordering::SeqCst) {
            return Err(CbError::NodeUnreachable("memory cluster is down".into()));
        }
        Ok(())
    }

    fn service_failed(&self, s: Service) -> bool {
        self.inner.faults.failed_services.lock().contains(&s)
    }

    async fn data_op(&self) -> CbResult<()> {
        let latency = *self.inner.faults.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.check_reachable()?;
        if self.service_failed(Service::Kv) {
            return Err(CbError::KvService("kv endpoint refused".into()));
        }
        let left = self.inner.faults.fail_after.load(Ordering::SeqCst);
        if left == 0 {
            return Err(CbError::Timeout("injected fault".into()));
        }
        if left > 0 {
            self.inner.faults.fail_after.fetch_sub(1, Ordering::SeqCst);
        }
        self.inner.ops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn new_index(&self, field: Option<String>) -> MemIndex {
        MemIndex {
            field,
            pending_polls: *self.inner.faults.index_build_polls.lock(),
        }
    }
}

// =============================================================================
// Query evaluation
// =============================================================================

fn select_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)^\s*SELECT\s+(.+?)\s+FROM\s+`([^`]+)`\.`([^`]+)`\.`([^`]+)`(?:\s+WHERE\s+(.+?))?\s*;?\s*$")
            .expect("static regex")
    })
}

fn like_all_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)^TOSTRING\((.+?)\)\s+LIKE\s+["']%["']$"#).expect("static regex"))
}

fn equals_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([A-Za-z0-9_.]+)\s*=\s*'(.*)'$").expect("static regex"))
}

fn lookup<'v>(doc: &'v Value, path: &str) -> Option<&'v Value> {
    path.split('.').try_fold(doc, |cur, part| cur.get(part))
}

fn as_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

enum Projection {
    Count(String),
    MetaId,
    Star,
    Field(String),
}

enum Filter {
    All,
    Exists(String),
    Equals(String, String),
}

fn parse_projection(text: &str) -> Projection {
    let t = text.trim();
    let lower = t.to_ascii_lowercase();
    if lower.starts_with("count(*)") {
        let alias = lower
            .split_once(" as ")
            .map(|(_, a)| a.trim().trim_matches('`').to_string())
            .unwrap_or_else(|| "$1".to_string());
        Projection::Count(alias)
    } else if lower == "meta().id" {
        Projection::MetaId
    } else if t == "*" {
        Projection::Star
    } else {
        Projection::Field(t.trim_matches('`').to_string())
    }
}

fn parse_filter(text: Option<&str>) -> CbResult<Filter> {
    let Some(w) = text.map(str::trim) else {
        return Ok(Filter::All);
    };
    if let Some(c) = like_all_regex().captures(w) {
        return Ok(Filter::Exists(c[1].trim_matches('`').to_string()));
    }
    if let Some(c) = equals_regex().captures(w) {
        return Ok(Filter::Equals(c[1].to_string(), c[2].to_string()));
    }
    Err(CbError::Couchbase {
        code: 3000,
        message: format!("unsupported WHERE clause: {}", w),
    })
}

impl MemoryCluster {
    fn run_query(&self, statement: &str) -> CbResult<Vec<Value>> {
        let caps = select_regex().captures(statement).ok_or_else(|| CbError::Couchbase {
            code: 3000,
            message: format!("syntax error: {}", statement),
        })?;
        let ks = Keyspace::new(&caps[2], &caps[3], &caps[4]);
        let projection = parse_projection(&caps[1]);
        let filter = parse_filter(caps.get(5).map(|m| m.as_str()))?;

        self.with_collection_mut(&ks, |coll| {
            if let Projection::Count(alias) = &projection {
                if matches!(filter, Filter::All) {
                    return Ok(vec![json!({ alias.clone(): coll.docs.len() })]);
                }
            }

            // An index must cover the filter field, or a primary index must exist.
            let wanted = match &filter {
                Filter::Exists(f) | Filter::Equals(f, _) => Some(f.as_str()),
                Filter::All => None,
            };
            let covering = coll
                .indexes
                .iter()
                .find(|(_, ix)| wanted.is_some() && ix.field.as_deref() == wanted)
                .or_else(|| coll.indexes.iter().find(|(_, ix)| ix.field.is_none()))
                .map(|(name, _)| name.clone());
            let Some(ix) = covering.and_then(|name| coll.indexes.get_mut(&name)) else {
                return Err(CbError::Couchbase {
                    code: 4000,
                    message: format!("No index available on keyspace {} that matches your query", ks),
                });
            };
            if ix.pending_polls > 0 {
                ix.pending_polls -= 1;
                return Ok(Vec::new());
            }

            let matching = coll.docs.iter().filter(|(_, d)| match &filter {
                Filter::All => true,
                Filter::Exists(f) => lookup(d, f).is_some(),
                Filter::Equals(f, v) => lookup(d, f).map(as_text).as_deref() == Some(v.as_str()),
            });

            let rows = match &projection {
                Projection::Count(alias) => vec![json!({ alias.clone(): matching.count() })],
                Projection::MetaId => matching.map(|(k, _)| json!({ "id": k })).collect(),
                Projection::Star => matching
                    .map(|(_, d)| json!({ ks.collection.clone(): d.clone() }))
                    .collect(),
                Projection::Field(f) => {
                    let name = f.rsplit('.').next().unwrap_or(f).to_string();
                    matching
                        .map(|(_, d)| {
                            let mut row = Map::new();
                            if let Some(v) = lookup(d, f) {
                                row.insert(name.clone(), v.clone());
                            }
                            Value::Object(row)
                        })
                        .collect()
                }
            };
            Ok(rows)
        })
    }
}

// =============================================================================
// ClusterApi
// =============================================================================

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn cluster_info(&self) -> CbResult<ClusterInfo> {
        self.check_reachable()?;
        Ok(ClusterInfo {
            rally_host: "127.0.0.1".into(),
            srv_targets: Vec::new(),
            nodes: vec![NodeInfo {
                hostname: "127.0.0.1".into(),
                external_hostname: None,
                external_ports: BTreeMap::new(),
                version: "7.6.0-memory".into(),
                os: std::env::consts::OS.into(),
                services: vec![Service::Kv, Service::Query, Service::Index],
                status: "healthy".into(),
            }],
            memory_quota_mb: self.inner.memory_quota_mb,
            tls: false,
            external: false,
        })
    }

    async fn ping(&self) -> CbResult<PingReport> {
        let down = self.inner.faults.down.load(Ordering::SeqCst);
        let endpoints = [
            (Service::Kv, "127.0.0.1:11210"),
            (Service::Query, "127.0.0.1:8093"),
            (Service::Management, "127.0.0.1:8091"),
            (Service::View, "127.0.0.1:8092"),
            (Service::Index, "127.0.0.1:9102"),
        ]
        .into_iter()
        .map(|(service, endpoint)| EndpointPing {
            service,
            endpoint: endpoint.into(),
            latency: Duration::from_micros(50),
            error: if down {
                Some("connection refused".into())
            } else if self.service_failed(service) {
                Some(format!("{} endpoint not ready", service))
            } else {
                None
            },
        })
        .collect();
        Ok(PingReport { endpoints })
    }

    async fn list_buckets(&self) -> CbResult<Vec<String>> {
        self.check_reachable()?;
        Ok(self.bucket_names())
    }

    async fn create_bucket(&self, settings: &BucketSettings) -> CbResult<()> {
        self.check_reachable()?;
        let mut state = self.inner.state.lock();
        if state.buckets.contains_key(&settings.name) {
            return Err(CbError::AlreadyExists(format!("bucket {}", settings.name)));
        }
        let mut bucket = MemBucket {
            quota_mb: settings.ram_quota_mb,
            scopes: BTreeMap::new(),
        };
        bucket
            .scopes
            .entry(DEFAULT_SCOPE.to_string())
            .or_default()
            .insert(DEFAULT_COLLECTION.to_string(), MemCollection::default());
        state.buckets.insert(settings.name.clone(), bucket);
        Ok(())
    }

    async fn drop_bucket(&self, bucket: &str) -> CbResult<()> {
        self.check_reachable()?;
        match self.inner.state.lock().buckets.remove(bucket) {
            Some(_) => Ok(()),
            None => Err(CbError::NotFound(format!("bucket {}", bucket))),
        }
    }

    async fn list_scopes(&self, bucket: &str) -> CbResult<Vec<ScopeInfo>> {
        self.check_reachable()?;
        let state = self.inner.state.lock();
        let b = state
            .buckets
            .get(bucket)
            .ok_or_else(|| CbError::NotFound(format!("bucket {}", bucket)))?;
        Ok(b.scopes
            .iter()
            .map(|(name, colls)| ScopeInfo {
                name: name.clone(),
                collections: colls.keys().cloned().collect(),
            })
            .collect())
    }

    async fn create_scope(&self, bucket: &str, scope: &str) -> CbResult<()> {
        self.check_reachable()?;
        let mut state = self.inner.state.lock();
        let b = state
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| CbError::NotFound(format!("bucket {}", bucket)))?;
        if b.scopes.contains_key(scope) {
            return Err(CbError::AlreadyExists(format!("scope {}", scope)));
        }
        b.scopes.insert(scope.to_string(), BTreeMap::new());
        Ok(())
    }

    async fn drop_scope(&self, bucket: &str, scope: &str) -> CbResult<()> {
        self.check_reachable()?;
        let mut state = self.inner.state.lock();
        let removed = state.buckets.get_mut(bucket).and_then(|b| b.scopes.remove(scope));
        removed
            .map(|_| ())
            .ok_or_else(|| CbError::NotFound(format!("scope {}.{}", bucket, scope)))
    }

    async fn create_collection(&self, keyspace: &Keyspace) -> CbResult<()> {
        self.check_reachable()?;
        let mut state = self.inner.state.lock();
        let scope = state
            .buckets
            .get_mut(&keyspace.bucket)
            .and_then(|b| b.scopes.get_mut(&keyspace.scope))
            .ok_or_else(|| CbError::NotFound(format!("scope {}.{}", keyspace.bucket, keyspace.scope)))?;
        if scope.contains_key(&keyspace.collection) {
            return Err(CbError::AlreadyExists(format!("collection {}", keyspace)));
        }
        scope.insert(keyspace.collection.clone(), MemCollection::default());
        Ok(())
    }

    async fn drop_collection(&self, keyspace: &Keyspace) -> CbResult<()> {
        self.check_reachable()?;
        let mut state = self.inner.state.lock();
        let removed = state
            .buckets
            .get_mut(&keyspace.bucket)
            .and_then(|b| b.scopes.get_mut(&keyspace.scope))
            .and_then(|s| s.remove(&keyspace.collection));
        removed
            .map(|_| ())
            .ok_or_else(|| CbError::NotFound(format!("collection {}", keyspace)))
    }

    async fn create_primary_index(&self, keyspace: &Keyspace, _replicas: u32) -> CbResult<()> {
        self.check_reachable()?;
        let ix = self.new_index(None);
        self.with_collection_mut(keyspace, |c| {
            if c.indexes.contains_key(PRIMARY_INDEX_NAME) {
                return Err(CbError::IndexExists(format!("{} on {}", PRIMARY_INDEX_NAME, keyspace)));
            }
            c.indexes.insert(PRIMARY_INDEX_NAME.to_string(), ix);
            Ok(())
        })
    }

    async fn drop_primary_index(&self, keyspace: &Keyspace) -> CbResult<()> {
        self.drop_index(keyspace, PRIMARY_INDEX_NAME).await
    }

    async fn create_index(&self, keyspace: &Keyspace, name: &str, field: &str, _replicas: u32) -> CbResult<()> {
        self.check_reachable()?;
        let ix = self.new_index(Some(field.to_string()));
        self.with_collection_mut(keyspace, |c| {
            if c.indexes.contains_key(name) {
                return Err(CbError::IndexExists(format!("{} on {}", name, keyspace)));
            }
            c.indexes.insert(name.to_string(), ix);
            Ok(())
        })
    }

    async fn drop_index(&self, keyspace: &Keyspace, name: &str) -> CbResult<()> {
        self.check_reachable()?;
        self.with_collection_mut(keyspace, |c| match c.indexes.remove(name) {
            Some(_) => Ok(()),
            None => Err(CbError::IndexNotFound(format!("{} on {}", name, keyspace))),
        })
    }

    async fn list_indexes(&self, keyspace: &Keyspace) -> CbResult<Vec<IndexInfo>> {
        self.check_reachable()?;
        let listed: CbResult<Vec<IndexInfo>> = self.with_collection_mut(keyspace, |c| {
            Ok(c.indexes
                .iter_mut()
                .map(|(name, ix)| {
                    let building = ix.pending_polls > 0;
                    ix.pending_polls = ix.pending_polls.saturating_sub(1);
                    IndexInfo {
                        name: name.clone(),
                        keyspace: keyspace.clone(),
                        state: if building { "building" } else { "online" }.into(),
                        is_primary: ix.field.is_none(),
                        fields: ix.field.iter().cloned().collect(),
                    }
                })
                .collect())
        });
        match listed {
            Err(CbError::NotFound(_)) => Ok(Vec::new()),
            other => other,
        }
    }

    async fn get(&self, keyspace: &Keyspace, key: &str) -> CbResult<Option<Value>> {
        self.data_op().await?;
        self.with_collection_mut(keyspace, |c| Ok(c.docs.get(key).cloned()))
    }

    async fn upsert(&self, keyspace: &Keyspace, key: &str, doc: &Value) -> CbResult<()> {
        self.data_op().await?;
        self.with_collection_mut(keyspace, |c| {
            c.docs.insert(key.to_string(), doc.clone());
            Ok(())
        })
    }

    async fn remove(&self, keyspace: &Keyspace, key: &str) -> CbResult<bool> {
        self.data_op().await?;
        self.with_collection_mut(keyspace, |c| Ok(c.docs.remove(key).is_some()))
    }

    async fn subdoc_get(&self, keyspace: &Keyspace, key: &str, path: &str) -> CbResult<Option<Value>> {
        self.data_op().await?;
        self.with_collection_mut(keyspace, |c| Ok(c.docs.get(key).and_then(|d| lookup(d, path)).cloned()))
    }

    async fn subdoc_upsert(&self, keyspace: &Keyspace, key: &str, path: &str, value: &Value) -> CbResult<()> {
        self.data_op().await?;
        self.with_collection_mut(keyspace, |c| {
            let doc = c
                .docs
                .get_mut(key)
                .ok_or_else(|| CbError::DocumentNotFound(key.to_string()))?;
            crate::template::set_path(doc, path, value.clone());
            Ok(())
        })
    }

    async fn query(&self, statement: &str) -> CbResult<Vec<Value>> {
        self.check_reachable()?;
        if self.service_failed(Service::Query) {
            return Err(CbError::QueryService("query endpoint refused".into()));
        }
        self.run_query(statement)
    }

    fn fork(&self) -> Arc<dyn ClusterApi> {
        Arc::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded() -> (MemoryCluster, Keyspace) {
        let mc = MemoryCluster::new();
        let ks = Keyspace::new("b", "s", "c");
        mc.create_bucket(&BucketSettings {
            name: "b".into(),
            ram_quota_mb: 256,
            replicas: 0,
        })
        .await
        .unwrap();
        mc.create_scope("b", "s").await.unwrap();
        mc.create_collection(&ks).await.unwrap();
        for n in 1..=3 {
            mc.upsert(&ks, &format!("c:{}", n), &json!({"n": n, "tag": if n == 2 { "x" } else { "y" }}))
                .await
                .unwrap();
        }
        (mc, ks)
    }

    #[tokio::test]
    async fn test_queries_require_index() {
        let (mc, ks) = seeded().await;
        let count = mc
            .query(&format!("SELECT COUNT(*) AS count FROM {}", ks.query_name()))
            .await
            .unwrap();
        assert_eq!(count[0]["count"], 3);

        let err = mc
            .query(&format!("SELECT meta().id FROM {}", ks.query_name()))
            .await
            .unwrap_err();
        assert!(matches!(err, CbError::Couchbase { code: 4000, .. }));

        mc.create_primary_index(&ks, 0).await.unwrap();
        let ids = mc
            .query(&format!("SELECT meta().id FROM {}", ks.query_name()))
            .await
            .unwrap();
        assert_eq!(ids.len(), 3);

        let tagged = mc
            .query(&format!("SELECT n FROM {} WHERE tag = 'x'", ks.query_name()))
            .await
            .unwrap();
        assert_eq!(tagged, vec![json!({"n": 2})]);
    }

    #[tokio::test]
    async fn test_covering_query_and_lagging_build() {
        let (mc, ks) = seeded().await;
        mc.lag_index_builds(2);
        mc.create_index(&ks, "c_n_ix", "n", 0).await.unwrap();
        let q = format!("SELECT n FROM {} WHERE TOSTRING(n) LIKE \"%\"", ks.query_name());
        assert!(mc.query(&q).await.unwrap().is_empty());
        assert!(mc.query(&q).await.unwrap().is_empty());
        assert_eq!(mc.query(&q).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_create_and_drop_report_state() {
        let (mc, ks) = seeded().await;
        assert!(matches!(mc.create_scope("b", "s").await, Err(CbError::AlreadyExists(_))));
        assert!(matches!(mc.drop_bucket("zz").await, Err(CbError::NotFound(_))));
        assert!(matches!(
            mc.drop_index(&ks, "nope").await,
            Err(CbError::IndexNotFound(_))
        ));
        assert!(mc.remove(&ks, "c:1").await.unwrap());
        assert!(!mc.remove(&ks, "c:1").await.unwrap());
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let (mc, ks) = seeded().await;
        mc.fail_after(1);
        assert!(mc.get(&ks, "c:2").await.unwrap().is_some());
        assert!(matches!(mc.get(&ks, "c:2").await, Err(CbError::Timeout(_))));
        mc.set_down(true);
        assert!(matches!(mc.list_buckets().await, Err(CbError::NodeUnreachable(_))));
        let report = mc.ping().await.unwrap();
        assert_eq!(report.service_ok(Service::Kv), Some(false));
    }
}
