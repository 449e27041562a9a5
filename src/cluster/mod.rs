//! Cluster access.
//!
//! [`ClusterApi`] is the seam every other component talks through. Two
//! backends implement it: [`network::NetworkCluster`] speaks to a real
//! cluster (management REST, query service, KV binary protocol) and
//! [`memory::MemoryCluster`] keeps everything in process for tests and dry
//! runs. [`session::Session`] layers retry, idempotent create/drop and query
//! helpers on top of either.

pub mod kv;
pub mod memory;
pub mod network;
pub mod rest;
pub mod session;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{DEFAULT_COLLECTION, DEFAULT_SCOPE};
use crate::error::CbResult;

pub use session::{ConnectOptions, Session};

/// `bucket.scope.collection`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Keyspace {
    pub bucket: String,
    pub scope: String,
    pub collection: String,
}

impl Keyspace {
    pub fn new(bucket: impl Into<String>, scope: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            scope: scope.into(),
            collection: collection.into(),
        }
    }

    /// Bucket with the default scope and collection.
    pub fn bucket_only(bucket: impl Into<String>) -> Self {
        Self::new(bucket, DEFAULT_SCOPE, DEFAULT_COLLECTION)
    }

    pub fn is_default_scope(&self) -> bool {
        self.scope == DEFAULT_SCOPE
    }

    pub fn is_default_collection(&self) -> bool {
        self.collection == DEFAULT_COLLECTION
    }

    /// Back-quoted form usable in a query statement.
    pub fn query_name(&self) -> String {
        format!("`{}`.`{}`.`{}`", self.bucket, self.scope, self.collection)
    }

    /// `scope.collection`, as the KV collection-id lookup expects it.
    pub fn collection_path(&self) -> String {
        format!("{}.{}", self.scope, self.collection)
    }

    /// Base name for index names and generated keys.
    pub fn base_name(&self) -> &str {
        if self.is_default_collection() {
            &self.bucket
        } else {
            &self.collection
        }
    }
}

impl fmt::Display for Keyspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.bucket, self.scope, self.collection)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSettings {
    pub name: String,
    pub ram_quota_mb: u64,
    pub replicas: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeInfo {
    pub name: String,
    pub collections: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexInfo {
    pub name: String,
    pub keyspace: Keyspace,
    pub state: String,
    pub is_primary: bool,
    pub fields: Vec<String>,
}

impl IndexInfo {
    pub fn is_online(&self) -> bool {
        self.state.eq_ignore_ascii_case("online")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Service {
    Kv,
    Query,
    Index,
    Management,
    View,
    Search,
    Analytics,
    Eventing,
}

impl Service {
    /// Map a `/pools/default` service name to the enum.
    pub fn from_pool_name(name: &str) -> Option<Self> {
        match name {
            "kv" => Some(Service::Kv),
            "n1ql" => Some(Service::Query),
            "index" => Some(Service::Index),
            "fts" => Some(Service::Search),
            "cbas" => Some(Service::Analytics),
            "eventing" => Some(Service::Eventing),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Service::Kv => "kv",
            Service::Query => "query",
            Service::Index => "index",
            Service::Management => "mgmt",
            Service::View => "views",
            Service::Search => "search",
            Service::Analytics => "analytics",
            Service::Eventing => "eventing",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One node as reported by `/pools/default`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodeInfo {
    /// Configured (internal) hostname without port
    pub hostname: String,
    pub external_hostname: Option<String>,
    /// Service label to external port, when alternate addresses are set
    pub external_ports: BTreeMap<String, u16>,
    pub version: String,
    pub os: String,
    pub services: Vec<Service>,
    pub status: String,
}

impl NodeInfo {
    /// Hostname to dial given the external-network preference.
    pub fn address(&self, external: bool) -> &str {
        match (&self.external_hostname, external) {
            (Some(h), true) => h,
            _ => &self.hostname,
        }
    }

    pub fn has_service(&self, s: Service) -> bool {
        self.services.contains(&s)
    }
}

/// Discovery result shared by every worker.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClusterInfo {
    pub rally_host: String,
    pub srv_targets: Vec<String>,
    pub nodes: Vec<NodeInfo>,
    pub memory_quota_mb: u64,
    pub tls: bool,
    pub external: bool,
}

impl ClusterInfo {
    pub fn version(&self) -> &str {
        self.nodes.first().map(|n| n.version.as_str()).unwrap_or("unknown")
    }

    pub fn nodes_with(&self, s: Service) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.iter().filter(move |n| n.has_service(s))
    }

    /// Rows of the host map: internal name, external name, services, version, OS.
    pub fn host_map(&self) -> Vec<[String; 5]> {
        self.nodes
            .iter()
            .map(|n| {
                [
                    n.hostname.clone(),
                    n.external_hostname.clone().unwrap_or_else(|| "-".into()),
                    n.services.iter().map(|s| s.label()).collect::<Vec<_>>().join(","),
                    n.version.clone(),
                    n.os.clone(),
                ]
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointPing {
    pub service: Service,
    pub endpoint: String,
    pub latency: Duration,
    pub error: Option<String>,
}

impl EndpointPing {
    pub fn ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PingReport {
    pub endpoints: Vec<EndpointPing>,
}

impl PingReport {
    /// `None` when no endpoint of `service` was pinged.
    pub fn service_ok(&self, service: Service) -> Option<bool> {
        let mut seen = false;
        for e in self.endpoints.iter().filter(|e| e.service == service) {
            seen = true;
            if !e.ok() {
                return Some(false);
            }
        }
        seen.then_some(true)
    }

    pub fn first_error(&self, service: Service) -> Option<&str> {
        self.endpoints
            .iter()
            .filter(|e| e.service == service)
            .find_map(|e| e.error.as_deref())
    }
}

/// Primitive cluster operations. Create/drop calls report `AlreadyExists`,
/// `IndexExists`, `NotFound` or `IndexNotFound`; [`Session`] decides which
/// of those count as success.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn cluster_info(&self) -> CbResult<ClusterInfo>;
    async fn ping(&self) -> CbResult<PingReport>;

    async fn list_buckets(&self) -> CbResult<Vec<String>>;
    async fn create_bucket(&self, settings: &BucketSettings) -> CbResult<()>;
    async fn drop_bucket(&self, bucket: &str) -> CbResult<()>;
    async fn list_scopes(&self, bucket: &str) -> CbResult<Vec<ScopeInfo>>;
    async fn create_scope(&self, bucket: &str, scope: &str) -> CbResult<()>;
    async fn drop_scope(&self, bucket: &str, scope: &str) -> CbResult<()>;
    async fn create_collection(&self, keyspace: &Keyspace) -> CbResult<()>;
    async fn drop_collection(&self, keyspace: &Keyspace) -> CbResult<()>;

    async fn create_primary_index(&self, keyspace: &Keyspace, replicas: u32) -> CbResult<()>;
    async fn drop_primary_index(&self, keyspace: &Keyspace) -> CbResult<()>;
    async fn create_index(&self, keyspace: &Keyspace, name: &str, field: &str, replicas: u32) -> CbResult<()>;
    async fn drop_index(&self, keyspace: &Keyspace, name: &str) -> CbResult<()>;
    async fn list_indexes(&self, keyspace: &Keyspace) -> CbResult<Vec<IndexInfo>>;

    /// `Ok(None)` when the document does not exist.
    async fn get(&self, keyspace: &Keyspace, key: &str) -> CbResult<Option<Value>>;
    async fn upsert(&self, keyspace: &Keyspace, key: &str, doc: &Value) -> CbResult<()>;
    /// `Ok(false)` when the document did not exist.
    async fn remove(&self, keyspace: &Keyspace, key: &str) -> CbResult<bool>;
    async fn subdoc_get(&self, keyspace: &Keyspace, key: &str, path: &str) -> CbResult<Option<Value>>;
    async fn subdoc_upsert(&self, keyspace: &Keyspace, key: &str, path: &str, value: &Value) -> CbResult<()>;

    async fn query(&self, statement: &str) -> CbResult<Vec<Value>>;

    /// A handle with its own data connections that shares discovery state.
    fn fork(&self) -> Arc<dyn ClusterApi>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyspace_names() {
        let ks = Keyspace::new("sample_app", "profiles", "user_data");
        assert_eq!(ks.to_string(), "sample_app.profiles.user_data");
        assert_eq!(ks.query_name(), "`sample_app`.`profiles`.`user_data`");
        assert_eq!(ks.base_name(), "user_data");
        assert_eq!(Keyspace::bucket_only("cbperf").base_name(), "cbperf");
    }

    #[test]
    fn test_ping_report_service_state() {
        let report = PingReport {
            endpoints: vec![
                EndpointPing {
                    service: Service::Kv,
                    endpoint: "a:11210".into(),
                    latency: Duration::from_millis(1),
                    error: None,
                },
                EndpointPing {
                    service: Service::Query,
                    endpoint: "a:8093".into(),
                    latency: Duration::from_millis(1),
                    error: Some("refused".into()),
                },
            ],
        };
        assert_eq!(report.service_ok(Service::Kv), Some(true));
        assert_eq!(report.service_ok(Service::Query), Some(false));
        assert_eq!(report.service_ok(Service::View), None);
        assert_eq!(report.first_error(Service::Query), Some("refused"));
    }
}
