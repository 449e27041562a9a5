//! Network backend: management REST and query over HTTP, data over KV.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use super::kv::{BucketRouter, Credentials, KvConnection, VbucketMap};
use super::rest::RestClient;
use super::{
    BucketSettings, ClusterApi, ClusterInfo, EndpointPing, IndexInfo, Keyspace, NodeInfo, PingReport, ScopeInfo,
    Service,
};
use crate::constants::*;
use crate::error::{CbError, CbResult};

#[derive(Debug)]
struct Shared {
    info: ClusterInfo,
    rest: RestClient,
    creds: Credentials,
    kv_timeout: Duration,
}

/// One handle onto a live cluster. [`ClusterApi::fork`] yields a handle
/// sharing discovery and the HTTP client but opening its own KV sockets.
#[derive(Debug)]
pub struct NetworkCluster {
    shared: Arc<Shared>,
    routers: Mutex<HashMap<String, Arc<BucketRouter>>>,
}

fn service_port(service: Service, tls: bool) -> u16 {
    match (service, tls) {
        (Service::Kv, false) => KV_PORT,
        (Service::Kv, true) => KV_PORT_TLS,
        (Service::Query, false) => QUERY_PORT,
        (Service::Query, true) => QUERY_PORT_TLS,
        (Service::Index, false) => INDEX_PORT,
        (Service::Index, true) => INDEX_PORT_TLS,
        (Service::View, false) => VIEW_PORT,
        (Service::View, true) => VIEW_PORT_TLS,
        (_, false) => MGMT_PORT,
        (_, true) => MGMT_PORT_TLS,
    }
}

/// Key of a service in the alternate-address port map.
fn external_port_key(service: Service, tls: bool) -> &'static str {
    match (service, tls) {
        (Service::Kv, false) => "kv",
        (Service::Kv, true) => "kvSSL",
        (Service::Query, false) => "n1ql",
        (Service::Query, true) => "n1qlSSL",
        (Service::Index, false) => "indexHttp",
        (Service::Index, true) => "indexHttps",
        (Service::View, false) => "capi",
        (Service::View, true) => "capiSSL",
        (_, false) => "mgmt",
        (_, true) => "mgmtSSL",
    }
}

/// Host and port to dial for `service` on `node`.
pub fn endpoint(node: &NodeInfo, service: Service, tls: bool, external: bool) -> (String, u16) {
    let host = node.address(external).to_string();
    let port = if external {
        node.external_ports
            .get(external_port_key(service, tls))
            .copied()
            .unwrap_or_else(|| service_port(service, tls))
    } else {
        service_port(service, tls)
    };
    (host, port)
}

impl NetworkCluster {
    pub fn new(info: ClusterInfo, username: &str, password: &str, kv_timeout: Duration, query_timeout: Duration) -> CbResult<Self> {
        let mgmt: Vec<String> = info.nodes.iter().map(|n| n.address(info.external).to_string()).collect();
        let query: Vec<String> = info
            .nodes_with(Service::Query)
            .map(|n| n.address(info.external).to_string())
            .collect();
        let rest = RestClient::new(username, password, info.tls, query_timeout)?.with_hosts(mgmt, query);
        Ok(Self {
            shared: Arc::new(Shared {
                info,
                rest,
                creds: Credentials {
                    username: username.to_string(),
                    password: password.to_string(),
                },
                kv_timeout,
            }),
            routers: Mutex::new(HashMap::new()),
        })
    }

    pub fn rest(&self) -> &RestClient {
        &self.shared.rest
    }

    async fn router(&self, bucket: &str) -> CbResult<Arc<BucketRouter>> {
        if let Some(r) = self.routers.lock().get(bucket) {
            return Ok(r.clone());
        }
        let cfg = self.shared.rest.bucket_config(bucket).await.map_err(|e| match e {
            CbError::NotFound(_) => CbError::NotFound(format!("bucket {}", bucket)),
            other => other,
        })?;
        let map = VbucketMap::parse(&cfg)?;
        let info = &self.shared.info;
        let router = Arc::new(BucketRouter::new(
            bucket,
            map,
            |host, port| {
                match info.nodes.iter().find(|n| n.hostname == host) {
                    Some(node) if info.external || info.tls => endpoint(node, Service::Kv, info.tls, info.external),
                    _ => (host.to_string(), if info.tls { KV_PORT_TLS } else { port }),
                }
            },
            self.shared.creds.clone(),
            info.tls,
            self.shared.kv_timeout,
        ));
        debug!("routing bucket {} over {} vBuckets", bucket, router_len(&cfg));
        self.routers.lock().insert(bucket.to_string(), router.clone());
        Ok(router)
    }

    async fn ping_endpoint(&self, node: &NodeInfo, service: Service) -> EndpointPing {
        let info = &self.shared.info;
        let (host, port) = endpoint(node, service, info.tls, info.external);
        let rest = &self.shared.rest;
        let started = Instant::now();
        let result = match service {
            Service::Kv => {
                match KvConnection::connect(&host, port, info.tls, &self.shared.creds, None, self.shared.kv_timeout).await {
                    Ok(mut c) => c.noop().await,
                    Err(e) => Err(e),
                }
            }
            Service::Query => rest.probe(&rest.url(&host, port, "/admin/ping")).await,
            Service::Index => rest.probe(&rest.url(&host, port, "/api/v1/stats")).await,
            Service::View => rest.probe(&rest.url(&host, port, "/")).await,
            _ => rest.probe(&rest.url(&host, port, "/pools")).await,
        };
        EndpointPing {
            service,
            endpoint: super::rest::host_port(&host, port),
            latency: started.elapsed(),
            error: result.err().map(|e| e.to_string()),
        }
    }
}

fn router_len(cfg: &Value) -> usize {
    cfg.pointer("/vBucketServerMap/vBucketMap")
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or(0)
}

#[async_trait]
impl ClusterApi for NetworkCluster {
    async fn cluster_info(&self) -> CbResult<ClusterInfo> {
        Ok(self.shared.info.clone())
    }

    async fn ping(&self) -> CbResult<PingReport> {
        let mut endpoints = Vec::new();
        for node in &self.shared.info.nodes {
            endpoints.push(self.ping_endpoint(node, Service::Management).await);
            for s in [Service::Kv, Service::Query, Service::Index] {
                if node.has_service(s) {
                    endpoints.push(self.ping_endpoint(node, s).await);
                }
            }
            if node.has_service(Service::Kv) {
                endpoints.push(self.ping_endpoint(node, Service::View).await);
            }
        }
        Ok(PingReport { endpoints })
    }

    async fn list_buckets(&self) -> CbResult<Vec<String>> {
        self.shared.rest.list_buckets().await
    }

    async fn create_bucket(&self, settings: &BucketSettings) -> CbResult<()> {
        self.shared
            .rest
            .create_bucket(&settings.name, settings.ram_quota_mb, settings.replicas)
            .await
    }

    async fn drop_bucket(&self, bucket: &str) -> CbResult<()> {
        self.routers.lock().remove(bucket);
        self.shared.rest.drop_bucket(bucket).await
    }

    async fn list_scopes(&self, bucket: &str) -> CbResult<Vec<ScopeInfo>> {
        self.shared.rest.list_scopes(bucket).await
    }

    async fn create_scope(&self, bucket: &str, scope: &str) -> CbResult<()> {
        self.shared.rest.create_scope(bucket, scope).await
    }

    async fn drop_scope(&self, bucket: &str, scope: &str) -> CbResult<()> {
        self.shared.rest.drop_scope(bucket, scope).await
    }

    async fn create_collection(&self, keyspace: &Keyspace) -> CbResult<()> {
        self.shared.rest.create_collection(keyspace).await
    }

    async fn drop_collection(&self, keyspace: &Keyspace) -> CbResult<()> {
        self.shared.rest.drop_collection(keyspace).await
    }

    async fn create_primary_index(&self, keyspace: &Keyspace, replicas: u32) -> CbResult<()> {
        self.shared
            .rest
            .create_primary_index(keyspace, replicas, INDEX_CREATE_TIMEOUT)
            .await
    }

    async fn drop_primary_index(&self, keyspace: &Keyspace) -> CbResult<()> {
        self.shared.rest.drop_primary_index(keyspace).await
    }

    async fn create_index(&self, keyspace: &Keyspace, name: &str, field: &str, replicas: u32) -> CbResult<()> {
        self.shared
            .rest
            .create_index(keyspace, name, field, replicas, INDEX_CREATE_TIMEOUT)
            .await
    }

    async fn drop_index(&self, keyspace: &Keyspace, name: &str) -> CbResult<()> {
        self.shared.rest.drop_index(keyspace, name).await
    }

    async fn list_indexes(&self, keyspace: &Keyspace) -> CbResult<Vec<IndexInfo>> {
        self.shared.rest.list_indexes(keyspace).await
    }

    async fn get(&self, keyspace: &Keyspace, key: &str) -> CbResult<Option<Value>> {
        self.router(&keyspace.bucket).await?.get(keyspace, key).await
    }

    async fn upsert(&self, keyspace: &Keyspace, key: &str, doc: &Value) -> CbResult<()> {
        self.router(&keyspace.bucket).await?.upsert(keyspace, key, doc).await
    }

    async fn remove(&self, keyspace: &Keyspace, key: &str) -> CbResult<bool> {
        self.router(&keyspace.bucket).await?.remove(keyspace, key).await
    }

    async fn subdoc_get(&self, keyspace: &Keyspace, key: &str, path: &str) -> CbResult<Option<Value>> {
        self.router(&keyspace.bucket)
            .await?
            .subdoc_get(keyspace, key, path)
            .await
    }

    async fn subdoc_upsert(&self, keyspace: &Keyspace, key: &str, path: &str, value: &Value) -> CbResult<()> {
        self.router(&keyspace.bucket)
            .await?
            .subdoc_upsert(keyspace, key, path, value)
            .await
    }

    async fn query(&self, statement: &str) -> CbResult<Vec<Value>> {
        self.shared.rest.query(statement).await
    }

    fn fork(&self) -> Arc<dyn ClusterApi> {
        Arc::new(NetworkCluster {
            shared: self.shared.clone(),
            routers: Mutex::new(HashMap::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_endpoint_selection() {
        let mut ports = BTreeMap::new();
        ports.insert("kvSSL".to_string(), 31207);
        let node = NodeInfo {
            hostname: "10.0.0.1".into(),
            external_hostname: Some("cb1.example.com".into()),
            external_ports: ports,
            services: vec![Service::Kv],
            ..Default::default()
        };
        assert_eq!(endpoint(&node, Service::Kv, false, false), ("10.0.0.1".into(), KV_PORT));
        assert_eq!(endpoint(&node, Service::Kv, true, true), ("cb1.example.com".into(), 31207));
        assert_eq!(
            endpoint(&node, Service::Query, true, true),
            ("cb1.example.com".into(), QUERY_PORT_TLS)
        );
        assert_eq!(endpoint(&node, Service::Management, true, false).1, MGMT_PORT_TLS);
    }
}
