// src/cluster/session.rs
//
// Cluster session: discovery (SRV, TCP probe, /pools/default), connect
// string handling, and the retrying, idempotent operation layer every other
// component uses.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use serde_json::Value;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use url::Url;

use super::network::NetworkCluster;
use super::rest::{host_port, RestClient};
use super::{BucketSettings, ClusterApi, ClusterInfo, IndexInfo, Keyspace, NodeInfo, PingReport, ScopeInfo, Service};
use crate::config::ClusterConfig;
use crate::constants::*;
use crate::error::{CbError, CbResult, ErrorKind};
use crate::retry::{retry_with_backoff, RetryPolicy};

/// Kinds worth retrying on a data or query path.
pub const TRANSIENT_KINDS: &[ErrorKind] = &[
    ErrorKind::Transient,
    ErrorKind::Timeout,
    ErrorKind::NodeUnreachable,
    ErrorKind::DnsLookupTimeout,
    ErrorKind::Io,
];

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub username: String,
    pub password: String,
    pub tls: bool,
    pub external: bool,
    pub kv_timeout: Duration,
    pub query_timeout: Duration,
    pub retry: RetryPolicy,
}

impl ConnectOptions {
    pub fn from_config(cfg: &ClusterConfig, retry: RetryPolicy) -> Self {
        let mut opts = Self {
            host: cfg.host.clone(),
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            tls: cfg.tls,
            external: cfg.external_network,
            kv_timeout: cfg.kv_timeout,
            query_timeout: cfg.query_timeout,
            retry,
        };
        if opts.host.contains("://") {
            if let Ok((host, tls, external)) = parse_connect_string(&opts.host) {
                opts.host = host;
                opts.tls |= tls;
                opts.external |= external;
            }
        }
        opts
    }

    pub fn connect_string(&self) -> String {
        connect_string(&self.host, self.tls, self.external)
    }

    fn mgmt_port(&self) -> u16 {
        if self.tls {
            MGMT_PORT_TLS
        } else {
            MGMT_PORT
        }
    }
}

// =============================================================================
// Connect string
// =============================================================================

/// `couchbase[s]://host[?ssl=no_verify&network=external|default]`
pub fn connect_string(host: &str, tls: bool, external: bool) -> String {
    let scheme = if tls { "couchbases" } else { "couchbase" };
    let mut params = Vec::new();
    if tls {
        params.push("ssl=no_verify".to_string());
    }
    params.push(format!("network={}", if external { "external" } else { "default" }));
    format!("{}://{}?{}", scheme, host, params.join("&"))
}

/// Inverse of [`connect_string`]: `(host, tls, external)`.
pub fn parse_connect_string(s: &str) -> CbResult<(String, bool, bool)> {
    let url = Url::parse(s).map_err(|e| CbError::Config(format!("bad connect string '{}': {}", s, e)))?;
    let tls = match url.scheme() {
        "couchbase" => false,
        "couchbases" => true,
        other => return Err(CbError::Config(format!("unsupported scheme '{}'", other))),
    };
    let host = url
        .host_str()
        .ok_or_else(|| CbError::Config(format!("connect string '{}' has no host", s)))?
        .trim_matches(|c| c == '[' || c == ']')
        .to_string();
    let external = url
        .query_pairs()
        .any(|(k, v)| k == "network" && v == "external");
    Ok((host, tls, external))
}

// =============================================================================
// Discovery
// =============================================================================

/// SRV targets for `_couchbase[s]._tcp.<host>`. An empty list means no
/// records; a lookup that outlives its lifetime is `DnsLookupTimeout`.
pub async fn srv_lookup(host: &str, tls: bool) -> CbResult<Vec<String>> {
    if host.parse::<IpAddr>().is_ok() || host == "localhost" {
        return Ok(Vec::new());
    }
    let service = if tls { "_couchbases" } else { "_couchbase" };
    let name = format!("{}._tcp.{}", service, host);

    let mut opts = ResolverOpts::default();
    opts.timeout = DNS_TIMEOUT;
    let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), opts);

    match tokio::time::timeout(DNS_LIFETIME, resolver.srv_lookup(name.as_str())).await {
        Err(_) => Err(CbError::DnsLookupTimeout(name)),
        Ok(Err(e)) => {
            debug!("no SRV records for {}: {}", name, e);
            Ok(Vec::new())
        }
        Ok(Ok(lookup)) => Ok(lookup
            .iter()
            .map(|srv| srv.target().to_utf8().trim_end_matches('.').to_string())
            .collect()),
    }
}

pub async fn probe_tcp(host: &str, port: u16) -> CbResult<()> {
    let addr = host_port(host, port);
    match tokio::time::timeout(TCP_PROBE_TIMEOUT, TcpStream::connect(&addr)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(CbError::NodeUnreachable(format!("{}: {}", addr, e))),
        Err(_) => Err(CbError::NodeUnreachable(format!("{}: timed out", addr))),
    }
}

fn strip_port(host: &str) -> String {
    if host.starts_with('[') {
        return host
            .split(']')
            .next()
            .unwrap_or(host)
            .trim_start_matches('[')
            .to_string();
    }
    match host.rsplit_once(':') {
        Some((h, p)) if !h.contains(':') && p.chars().all(|c| c.is_ascii_digit()) => h.to_string(),
        _ => host.to_string(),
    }
}

/// Nodes and memory quota (MiB) from a `/pools/default` document.
pub fn parse_pools_default(v: &Value) -> (Vec<NodeInfo>, u64) {
    let quota = v.get("memoryQuota").and_then(Value::as_u64).unwrap_or(0);
    let nodes = v
        .get("nodes")
        .and_then(Value::as_array)
        .map(|nodes| {
            nodes
                .iter()
                .map(|n| {
                    let alt = n.pointer("/alternateAddresses/external");
                    let external_ports: BTreeMap<String, u16> = alt
                        .and_then(|a| a.get("ports"))
                        .and_then(Value::as_object)
                        .map(|p| {
                            p.iter()
                                .filter_map(|(k, v)| v.as_u64().map(|port| (k.clone(), port as u16)))
                                .collect()
                        })
                        .unwrap_or_default();
                    NodeInfo {
                        hostname: strip_port(n.get("hostname").and_then(Value::as_str).unwrap_or_default()),
                        external_hostname: alt
                            .and_then(|a| a.get("hostname"))
                            .and_then(Value::as_str)
                            .map(String::from),
                        external_ports,
                        version: n.get("version").and_then(Value::as_str).unwrap_or_default().to_string(),
                        os: n.get("os").and_then(Value::as_str).unwrap_or_default().to_string(),
                        services: n
                            .get("services")
                            .and_then(Value::as_array)
                            .map(|s| s.iter().filter_map(Value::as_str).filter_map(Service::from_pool_name).collect())
                            .unwrap_or_default(),
                        status: n.get("status").and_then(Value::as_str).unwrap_or_default().to_string(),
                    }
                })
                .collect()
        })
        .unwrap_or_default();
    (nodes, quota)
}

/// Resolve the rally node and read the cluster topology.
pub async fn discover(opts: &ConnectOptions) -> CbResult<ClusterInfo> {
    let dns_policy = opts.retry.clone().allow(&[ErrorKind::DnsLookupTimeout]);
    let srv_targets = retry_with_backoff("SRV lookup", &dns_policy, || srv_lookup(&opts.host, opts.tls)).await?;
    let candidates = if srv_targets.is_empty() {
        vec![opts.host.clone()]
    } else {
        info!("SRV records for {}: {}", opts.host, srv_targets.join(", "));
        srv_targets.clone()
    };

    let probe_policy = opts.retry.clone().allow(&[ErrorKind::NodeUnreachable]);
    let port = opts.mgmt_port();
    let rally_host = retry_with_backoff("node probe", &probe_policy, || {
        let candidates = candidates.clone();
        async move {
            let mut last = None;
            for c in &candidates {
                match probe_tcp(c, port).await {
                    Ok(()) => return Ok(c.clone()),
                    Err(e) => last = Some(e),
                }
            }
            Err(last.unwrap_or_else(|| CbError::NodeUnreachable("no candidate nodes".into())))
        }
    })
    .await
    .map_err(|e| CbError::ClusterInit(format!("cannot reach {}: {}", opts.host, e)))?;

    let rest = RestClient::new(&opts.username, &opts.password, opts.tls, opts.query_timeout)?;
    let pools = rest.pools_default(&rally_host).await.map_err(|e| match e {
        CbError::ClusterInit(m) => CbError::ClusterInit(m),
        other => CbError::ClusterInit(format!("/pools/default on {}: {}", rally_host, other)),
    })?;
    let (nodes, memory_quota_mb) = parse_pools_default(&pools);
    if nodes.is_empty() {
        return Err(CbError::ClusterInit(format!("{} reported no nodes", rally_host)));
    }
    debug!("discovered {} nodes, memory quota {} MiB", nodes.len(), memory_quota_mb);

    Ok(ClusterInfo {
        rally_host,
        srv_targets,
        nodes,
        memory_quota_mb,
        tls: opts.tls,
        external: opts.external,
    })
}

// =============================================================================
// Session
// =============================================================================

/// Shared handle onto a cluster backend with retry and idempotency rules
/// applied. Cloning is cheap; [`Session::fork`] gives a worker its own data
/// connections.
#[derive(Clone)]
pub struct Session {
    api: Arc<dyn ClusterApi>,
    info: Arc<ClusterInfo>,
    policy: RetryPolicy,
    query_available: Arc<AtomicBool>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("rally_host", &self.info.rally_host)
            .field("nodes", &self.info.nodes.len())
            .finish()
    }
}

impl Session {
    /// Discover and connect to a live cluster, then wait for the data,
    /// query and management services.
    pub async fn connect(opts: &ConnectOptions) -> CbResult<Self> {
        let info = discover(opts).await?;
        let api = NetworkCluster::new(info, &opts.username, &opts.password, opts.kv_timeout, opts.query_timeout)?;
        let session = Self::from_api(Arc::new(api), opts.retry.clone()).await?;
        session.wait_ready().await?;
        Ok(session)
    }

    pub async fn from_api(api: Arc<dyn ClusterApi>, policy: RetryPolicy) -> CbResult<Self> {
        let info = retry_with_backoff("cluster info", &policy, || api.cluster_info()).await?;
        Ok(Self {
            api,
            info: Arc::new(info),
            policy,
            query_available: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn api(&self) -> &Arc<dyn ClusterApi> {
        &self.api
    }

    pub fn info(&self) -> &ClusterInfo {
        &self.info
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn query_available(&self) -> bool {
        self.query_available.load(Ordering::Relaxed)
    }

    /// Same discovery result, fresh data connections.
    pub fn fork(&self) -> Self {
        Self {
            api: self.api.fork(),
            info: self.info.clone(),
            policy: self.policy.clone(),
            query_available: self.query_available.clone(),
        }
    }

    fn data_policy(&self) -> RetryPolicy {
        self.policy.clone().allow(TRANSIENT_KINDS)
    }

    async fn wait_ready(&self) -> CbResult<()> {
        let attempts = (SERVICE_READY_BUDGET.as_secs_f64() / 0.5).ceil() as u32;
        let mut last: Option<PingReport> = None;
        for _ in 0..attempts.max(1) {
            let report = self.api.ping().await?;
            let kv = report.service_ok(Service::Kv).unwrap_or(false);
            let mgmt = report.service_ok(Service::Management).unwrap_or(true);
            if kv && mgmt {
                if report.service_ok(Service::Query) == Some(false) {
                    warn!("query service not reachable; continuing without it");
                    self.query_available.store(false, Ordering::Relaxed);
                }
                return Ok(());
            }
            last = Some(report);
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        let detail = last
            .as_ref()
            .and_then(|r| r.first_error(Service::Kv).or(r.first_error(Service::Management)))
            .unwrap_or("services not ready")
            .to_string();
        Err(CbError::KvService(detail))
    }

    // ---- health ----------------------------------------------------------

    /// Ping every service. With `restrict` only the data service must be
    /// healthy.
    pub async fn health_check(&self, restrict: bool) -> CbResult<PingReport> {
        let report = self
            .api
            .ping()
            .await
            .map_err(|e| CbError::HealthCheck(e.to_string()))?;
        if report.service_ok(Service::Kv) == Some(false) {
            let msg = report.first_error(Service::Kv).unwrap_or("unreachable").to_string();
            return Err(CbError::KvService(msg));
        }
        if restrict {
            return Ok(report);
        }
        if report.service_ok(Service::Query) == Some(false) {
            let msg = report.first_error(Service::Query).unwrap_or("unreachable").to_string();
            return Err(CbError::QueryService(msg));
        }
        if report.service_ok(Service::View) == Some(false) {
            let msg = report.first_error(Service::View).unwrap_or("unreachable").to_string();
            return Err(CbError::ViewService(msg));
        }
        if let Some(bad) = report.endpoints.iter().find(|e| !e.ok()) {
            return Err(CbError::HealthCheck(format!(
                "{} {}: {}",
                bad.service,
                bad.endpoint,
                bad.error.as_deref().unwrap_or("failed")
            )));
        }
        Ok(report)
    }

    // ---- management ------------------------------------------------------

    pub async fn list_buckets(&self) -> CbResult<Vec<String>> {
        retry_with_backoff("list buckets", &self.data_policy(), || self.api.list_buckets()).await
    }

    pub async fn list_scopes(&self, bucket: &str) -> CbResult<Vec<ScopeInfo>> {
        retry_with_backoff("list scopes", &self.data_policy(), || self.api.list_scopes(bucket)).await
    }

    pub async fn bucket_exists(&self, bucket: &str) -> CbResult<bool> {
        Ok(self.list_buckets().await?.iter().any(|b| b == bucket))
    }

    pub async fn scope_exists(&self, bucket: &str, scope: &str) -> CbResult<bool> {
        match self.api.list_scopes(bucket).await {
            Ok(scopes) => Ok(scopes.iter().any(|s| s.name == scope)),
            Err(CbError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn collection_exists(&self, ks: &Keyspace) -> CbResult<bool> {
        match self.api.list_scopes(&ks.bucket).await {
            Ok(scopes) => Ok(scopes
                .iter()
                .any(|s| s.name == ks.scope && s.collections.iter().any(|c| *c == ks.collection))),
            Err(CbError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Creates the bucket; an existing bucket counts as success.
    pub async fn create_bucket(&self, settings: &BucketSettings) -> CbResult<()> {
        let r = retry_with_backoff(
            &format!("create bucket {}", settings.name),
            &self.policy.clone().allow(TRANSIENT_KINDS),
            || self.api.create_bucket(settings),
        )
        .await;
        ignore(r, ErrorKind::AlreadyExists)
    }

    /// Drops the bucket; a missing bucket counts as success.
    pub async fn drop_bucket(&self, bucket: &str) -> CbResult<()> {
        let r = retry_with_backoff(&format!("drop bucket {}", bucket), &self.data_policy(), || {
            self.api.drop_bucket(bucket)
        })
        .await;
        ignore(r, ErrorKind::NotFound)
    }

    pub async fn create_scope(&self, bucket: &str, scope: &str) -> CbResult<()> {
        let r = retry_with_backoff(&format!("create scope {}", scope), &self.data_policy(), || {
            self.api.create_scope(bucket, scope)
        })
        .await;
        ignore(r, ErrorKind::AlreadyExists)
    }

    pub async fn drop_scope(&self, bucket: &str, scope: &str) -> CbResult<()> {
        let r = retry_with_backoff(&format!("drop scope {}", scope), &self.data_policy(), || {
            self.api.drop_scope(bucket, scope)
        })
        .await;
        ignore(r, ErrorKind::NotFound)
    }

    pub async fn create_collection(&self, ks: &Keyspace) -> CbResult<()> {
        let r = retry_with_backoff(&format!("create collection {}", ks), &self.data_policy(), || {
            self.api.create_collection(ks)
        })
        .await;
        ignore(r, ErrorKind::AlreadyExists)
    }

    pub async fn drop_collection(&self, ks: &Keyspace) -> CbResult<()> {
        let r = retry_with_backoff(&format!("drop collection {}", ks), &self.data_policy(), || {
            self.api.drop_collection(ks)
        })
        .await;
        ignore(r, ErrorKind::NotFound)
    }

    pub async fn create_primary_index(&self, ks: &Keyspace, replicas: u32) -> CbResult<()> {
        let policy = self.data_policy().always_raise(&[ErrorKind::IndexExists]);
        let r = retry_with_backoff(&format!("primary index on {}", ks), &policy, || {
            self.api.create_primary_index(ks, replicas)
        })
        .await;
        ignore(r, ErrorKind::IndexExists)
    }

    pub async fn drop_primary_index(&self, ks: &Keyspace) -> CbResult<()> {
        ignore(self.api.drop_primary_index(ks).await, ErrorKind::IndexNotFound)
    }

    pub async fn create_index(&self, ks: &Keyspace, name: &str, field: &str, replicas: u32) -> CbResult<()> {
        let policy = self.data_policy().always_raise(&[ErrorKind::IndexExists]);
        let r = retry_with_backoff(&format!("index {}", name), &policy, || {
            self.api.create_index(ks, name, field, replicas)
        })
        .await;
        ignore(r, ErrorKind::IndexExists)
    }

    pub async fn drop_index(&self, ks: &Keyspace, name: &str) -> CbResult<()> {
        ignore(self.api.drop_index(ks, name).await, ErrorKind::IndexNotFound)
    }

    pub async fn list_indexes(&self, ks: &Keyspace) -> CbResult<Vec<IndexInfo>> {
        retry_with_backoff("list indexes", &self.data_policy(), || self.api.list_indexes(ks)).await
    }

    /// Poll the index listing of `ks` until every index in `names` is online
    /// (every listed index when `names` is empty). A named index that never
    /// shows up counts as not online.
    pub async fn watch_indexes(&self, ks: &Keyspace, names: &[String], timeout: Duration) -> CbResult<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut delay = Duration::from_secs_f64(self.policy.factor.max(0.001));
        loop {
            let indexes = self.list_indexes(ks).await?;
            let pending: Vec<&str> = if names.is_empty() {
                indexes
                    .iter()
                    .filter(|ix| !ix.is_online())
                    .map(|ix| ix.name.as_str())
                    .collect()
            } else {
                names
                    .iter()
                    .filter(|n| !indexes.iter().any(|ix| ix.name == **n && ix.is_online()))
                    .map(String::as_str)
                    .collect()
            };
            if pending.is_empty() {
                debug!("{} indexes on {} online", indexes.len(), ks);
                return Ok(());
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(CbError::Timeout(format!(
                    "indexes on {} not online after {:?}: {}",
                    ks,
                    timeout,
                    pending.join(", ")
                )));
            }
            debug!("waiting for {} on {}", pending.join(", "), ks);
            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = (delay * 2).min(INDEX_WATCH_MAX_DELAY);
        }
    }

    // ---- key-value -------------------------------------------------------

    pub async fn get(&self, ks: &Keyspace, key: &str) -> CbResult<Option<Value>> {
        retry_with_backoff("get", &self.data_policy(), || self.api.get(ks, key)).await
    }

    pub async fn upsert(&self, ks: &Keyspace, key: &str, doc: &Value) -> CbResult<()> {
        retry_with_backoff("upsert", &self.data_policy(), || self.api.upsert(ks, key, doc)).await
    }

    pub async fn remove(&self, ks: &Keyspace, key: &str) -> CbResult<bool> {
        retry_with_backoff("remove", &self.data_policy(), || self.api.remove(ks, key)).await
    }

    pub async fn subdoc_get(&self, ks: &Keyspace, key: &str, field: &str) -> CbResult<Option<Value>> {
        retry_with_backoff("subdoc get", &self.data_policy(), || self.api.subdoc_get(ks, key, field)).await
    }

    pub async fn subdoc_upsert(&self, ks: &Keyspace, key: &str, field: &str, value: &Value) -> CbResult<()> {
        retry_with_backoff("subdoc upsert", &self.data_policy(), || {
            self.api.subdoc_upsert(ks, key, field, value)
        })
        .await
    }

    /// Write `values[i]` into `field` of document `keys[i]`, several at a time.
    pub async fn subdoc_multi_upsert(&self, ks: &Keyspace, keys: &[String], field: &str, values: &[Value]) -> CbResult<()> {
        if keys.len() != values.len() {
            return Err(CbError::Rules(format!(
                "{} keys but {} values for {}",
                keys.len(),
                values.len(),
                field
            )));
        }
        let mut results = stream::iter(keys.iter().zip(values.iter()))
            .map(|(k, v)| self.subdoc_upsert(ks, k, field, v))
            .buffer_unordered(DEFAULT_BATCH_SIZE as usize);
        while let Some(r) = results.next().await {
            r?;
        }
        Ok(())
    }

    // ---- query -----------------------------------------------------------

    pub async fn query(&self, statement: &str) -> CbResult<Vec<Value>> {
        retry_with_backoff("query", &self.data_policy(), || self.api.query(statement)).await
    }

    /// Run `sql`, or compose `SELECT <field> FROM <keyspace> [WHERE w = 'v']`.
    /// With `empty_retry`, an empty result is retried and finally reported
    /// as `QueryEmpty`.
    pub async fn query_rows(
        &self,
        ks: &Keyspace,
        field: Option<&str>,
        filter: Option<(&str, &str)>,
        sql: Option<&str>,
        empty_retry: bool,
    ) -> CbResult<Vec<Value>> {
        let statement = match (sql, field) {
            (Some(s), _) => s.to_string(),
            (None, Some(f)) => {
                let mut s = format!("SELECT {} FROM {}", f, ks.query_name());
                if let Some((w, v)) = filter {
                    s.push_str(&format!(" WHERE {} = '{}'", w, v.replace('\'', "''")));
                }
                s
            }
            (None, None) => return Err(CbError::QueryArguments),
        };
        let mut allowed = TRANSIENT_KINDS.to_vec();
        if empty_retry {
            allowed.push(ErrorKind::QueryEmpty);
        }
        let policy = self.policy.clone().allow(&allowed);
        retry_with_backoff("query", &policy, || {
            let statement = statement.clone();
            async move {
                let rows = self.api.query(&statement).await?;
                if empty_retry && rows.is_empty() {
                    return Err(CbError::QueryEmpty);
                }
                Ok(rows)
            }
        })
        .await
    }

    /// Document count of a collection.
    pub async fn collection_count(&self, ks: &Keyspace) -> CbResult<u64> {
        let rows = self
            .query_rows(ks, Some("COUNT(*) AS count"), None, None, false)
            .await?;
        Ok(rows
            .first()
            .and_then(|r| r.get("count"))
            .and_then(Value::as_u64)
            .unwrap_or(0))
    }
}

fn ignore(r: CbResult<()>, kind: ErrorKind) -> CbResult<()> {
    match r {
        Err(e) if e.kind() == kind => {
            debug!("ignoring {:?}: {}", kind, e);
            Ok(())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::MemoryCluster;
    use serde_json::json;

    async fn session() -> (MemoryCluster, Session) {
        let mc = MemoryCluster::new();
        let s = Session::from_api(Arc::new(mc.clone()), RetryPolicy::new(2, 0.001))
            .await
            .unwrap();
        (mc, s)
    }

    #[test]
    fn test_connect_string_round_trip() {
        let s = connect_string("cb.example.com", true, true);
        assert_eq!(s, "couchbases://cb.example.com?ssl=no_verify&network=external");
        assert_eq!(
            parse_connect_string(&s).unwrap(),
            ("cb.example.com".to_string(), true, true)
        );
        assert_eq!(
            parse_connect_string("couchbase://10.1.1.1").unwrap(),
            ("10.1.1.1".to_string(), false, false)
        );
        assert!(parse_connect_string("http://x").is_err());
    }

    #[test]
    fn test_pools_default_parsing() {
        let v = json!({
            "memoryQuota": 4096,
            "nodes": [{
                "hostname": "10.0.0.1:8091",
                "version": "7.2.0-5325-enterprise",
                "os": "x86_64-pc-linux-gnu",
                "services": ["kv", "n1ql", "index"],
                "status": "healthy",
                "alternateAddresses": {"external": {"hostname": "cb1.example.com", "ports": {"kv": 31210}}}
            }]
        });
        let (nodes, quota) = parse_pools_default(&v);
        assert_eq!(quota, 4096);
        assert_eq!(nodes[0].hostname, "10.0.0.1");
        assert_eq!(nodes[0].external_hostname.as_deref(), Some("cb1.example.com"));
        assert_eq!(nodes[0].external_ports["kv"], 31210);
        assert!(nodes[0].has_service(Service::Query));
        assert_eq!(strip_port("[::1]:8091"), "::1");
    }

    #[tokio::test]
    async fn test_create_and_drop_are_idempotent() {
        let (mc, s) = session().await;
        let settings = BucketSettings {
            name: "b".into(),
            ram_quota_mb: 256,
            replicas: 0,
        };
        s.create_bucket(&settings).await.unwrap();
        s.create_bucket(&settings).await.unwrap();
        s.create_scope("b", "s").await.unwrap();
        s.create_scope("b", "s").await.unwrap();
        let ks = Keyspace::new("b", "s", "c");
        s.create_collection(&ks).await.unwrap();
        s.create_collection(&ks).await.unwrap();
        assert!(s.collection_exists(&ks).await.unwrap());
        s.create_primary_index(&ks, 0).await.unwrap();
        s.create_primary_index(&ks, 0).await.unwrap();
        s.drop_index(&ks, "missing_ix").await.unwrap();
        s.drop_bucket("b").await.unwrap();
        s.drop_bucket("b").await.unwrap();
        assert!(mc.bucket_names().is_empty());
    }

    #[tokio::test]
    async fn test_watch_indexes_waits_for_builds() {
        let (mc, s) = session().await;
        s.create_bucket(&BucketSettings {
            name: "b".into(),
            ram_quota_mb: 256,
            replicas: 0,
        })
        .await
        .unwrap();
        let ks = Keyspace::bucket_only("b");
        mc.lag_index_builds(3);
        s.create_index(&ks, "b_n_ix", "n", 0).await.unwrap();
        assert!(!s.list_indexes(&ks).await.unwrap()[0].is_online());

        let names = vec!["b_n_ix".to_string()];
        s.watch_indexes(&ks, &names, Duration::from_secs(5)).await.unwrap();
        assert!(s.list_indexes(&ks).await.unwrap()[0].is_online());
        s.watch_indexes(&ks, &[], Duration::from_secs(5)).await.unwrap();

        let missing = vec!["b_gone_ix".to_string()];
        let err = s
            .watch_indexes(&ks, &missing, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, CbError::Timeout(ref m) if m.contains("b_gone_ix")));
    }

    #[tokio::test]
    async fn test_query_helper_errors() {
        let (_mc, s) = session().await;
        let ks = Keyspace::bucket_only("b");
        assert!(matches!(
            s.query_rows(&ks, None, None, None, false).await,
            Err(CbError::QueryArguments)
        ));
        s.create_bucket(&BucketSettings {
            name: "b".into(),
            ram_quota_mb: 256,
            replicas: 0,
        })
        .await
        .unwrap();
        assert_eq!(s.collection_count(&ks).await.unwrap(), 0);
        let err = s
            .query_rows(&ks, Some("COUNT(*) AS count"), None, Some("SELECT meta().id FROM `b`.`_default`.`_default`"), true)
            .await
            .unwrap_err();
        // no primary index on the collection
        assert_eq!(err.kind(), ErrorKind::Couchbase);

        s.create_primary_index(&ks, 0).await.unwrap();
        let err = s
            .query_rows(&ks, Some("meta().id"), None, None, true)
            .await
            .unwrap_err();
        assert!(matches!(err, CbError::QueryEmpty));
    }

    #[tokio::test]
    async fn test_health_check_mapping() {
        let (mc, s) = session().await;
        s.health_check(false).await.unwrap();
        mc.fail_service(Service::Query);
        s.health_check(true).await.unwrap();
        assert!(matches!(s.health_check(false).await, Err(CbError::QueryService(_))));
        mc.fail_service(Service::Kv);
        assert!(matches!(s.health_check(true).await, Err(CbError::KvService(_))));
    }
}
