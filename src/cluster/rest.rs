//! Management REST and query service client.
//!
//! Admin calls rotate across every node running the management service.
//! Transient 5xx answers are retried `HTTP_RETRIES` times with a fixed
//! `HTTP_RETRY_DELAY`; 4xx answers are decoded into typed errors.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, trace};

use super::{IndexInfo, Keyspace, ScopeInfo};
use crate::constants::{HTTP_RETRIES, HTTP_RETRY_DELAY, HTTP_TIMEOUT, MGMT_PORT, MGMT_PORT_TLS, QUERY_PORT, QUERY_PORT_TLS};
use crate::error::{CbError, CbResult};

#[derive(Debug)]
pub struct RestClient {
    http: reqwest::Client,
    username: String,
    password: String,
    tls: bool,
    mgmt_hosts: Vec<String>,
    query_hosts: Vec<String>,
    next: AtomicUsize,
    query_timeout: Duration,
}

fn scheme(tls: bool) -> &'static str {
    if tls {
        "https"
    } else {
        "http"
    }
}

/// `host:port`, bracketing bare IPv6 addresses.
pub fn host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

pub fn http_client() -> CbResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .danger_accept_invalid_certs(true)
        .build()
        .map_err(|e| CbError::ClusterInit(format!("cannot build HTTP client: {}", e)))
}

fn map_send_error(target: &str, e: reqwest::Error) -> CbError {
    if e.is_timeout() {
        CbError::Timeout(format!("{}: {}", target, e))
    } else if e.is_connect() {
        CbError::NodeUnreachable(format!("{}: {}", target, e))
    } else {
        CbError::Transient(format!("{}: {}", target, e))
    }
}

fn map_status(status: StatusCode, target: &str, body: &str) -> CbError {
    let lower = body.to_ascii_lowercase();
    match status {
        StatusCode::NOT_FOUND => CbError::NotFound(target.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            CbError::ClusterInit(format!("{}: authentication failed ({})", target, status))
        }
        _ if lower.contains("already exists") => CbError::AlreadyExists(target.to_string()),
        _ if lower.contains("not found") || lower.contains("does not exist") => CbError::NotFound(target.to_string()),
        s if s.is_server_error() => CbError::Transient(format!("{} returned {}: {}", target, s, body)),
        s => CbError::Couchbase {
            code: s.as_u16() as u32,
            message: format!("{}: {}", target, body),
        },
    }
}

impl RestClient {
    pub fn new(username: &str, password: &str, tls: bool, query_timeout: Duration) -> CbResult<Self> {
        Ok(Self {
            http: http_client()?,
            username: username.to_string(),
            password: password.to_string(),
            tls,
            mgmt_hosts: Vec::new(),
            query_hosts: Vec::new(),
            next: AtomicUsize::new(0),
            query_timeout,
        })
    }

    /// Hosts used for management and query calls, dialed in rotation.
    pub fn with_hosts(mut self, mgmt: Vec<String>, query: Vec<String>) -> Self {
        self.mgmt_hosts = mgmt;
        self.query_hosts = query;
        self
    }

    pub fn mgmt_port(&self) -> u16 {
        if self.tls {
            MGMT_PORT_TLS
        } else {
            MGMT_PORT
        }
    }

    pub fn query_port(&self) -> u16 {
        if self.tls {
            QUERY_PORT_TLS
        } else {
            QUERY_PORT
        }
    }

    fn pick<'a>(&self, hosts: &'a [String]) -> CbResult<&'a str> {
        if hosts.is_empty() {
            return Err(CbError::ClusterInit("no nodes available for this service".into()));
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % hosts.len();
        Ok(&hosts[i])
    }

    fn mgmt_url(&self, host: &str, path: &str) -> String {
        format!("{}://{}{}", scheme(self.tls), host_port(host, self.mgmt_port()), path)
    }

    /// One management request against `host`, retrying server errors.
    pub async fn request_on(
        &self,
        host: &str,
        method: Method,
        path: &str,
        form: Option<&[(&str, String)]>,
    ) -> CbResult<Value> {
        let url = self.mgmt_url(host, path);
        let mut attempt = 0u32;
        loop {
            let mut req = self
                .http
                .request(method.clone(), &url)
                .basic_auth(&self.username, Some(&self.password));
            if let Some(f) = form {
                req = req.form(f);
            }
            trace!("{} {}", method, url);
            let resp = req.send().await.map_err(|e| map_send_error(&url, e))?;
            let status = resp.status();
            let body = resp.text().await.map_err(|e| map_send_error(&url, e))?;
            if status.is_success() {
                if body.trim().is_empty() {
                    return Ok(Value::Null);
                }
                return Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)));
            }
            if status.is_server_error() && attempt < HTTP_RETRIES {
                attempt += 1;
                debug!("{} {} returned {}, retry {}", method, path, status, attempt);
                tokio::time::sleep(HTTP_RETRY_DELAY).await;
                continue;
            }
            return Err(map_status(status, path, &body));
        }
    }

    pub async fn request(&self, method: Method, path: &str, form: Option<&[(&str, String)]>) -> CbResult<Value> {
        let host = self.pick(&self.mgmt_hosts)?.to_string();
        self.request_on(&host, method, path, form).await
    }

    /// GET `url` and report whether the endpoint answered without a server
    /// error. Used by ping; authentication failures still count as reachable.
    pub async fn probe(&self, url: &str) -> CbResult<()> {
        let resp = self
            .http
            .get(url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| map_send_error(url, e))?;
        if resp.status().is_server_error() {
            return Err(CbError::Transient(format!("{} returned {}", url, resp.status())));
        }
        Ok(())
    }

    pub fn url(&self, host: &str, port: u16, path: &str) -> String {
        format!("{}://{}{}", scheme(self.tls), host_port(host, port), path)
    }

    pub async fn pools_default(&self, host: &str) -> CbResult<Value> {
        self.request_on(host, Method::GET, "/pools/default", None).await
    }

    // ---- buckets, scopes, collections -----------------------------------

    pub async fn list_buckets(&self) -> CbResult<Vec<String>> {
        let v = self.request(Method::GET, "/pools/default/buckets", None).await?;
        Ok(v.as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|b| b.get("name").and_then(Value::as_str).map(String::from))
                    .collect()
            })
            .unwrap_or_default())
    }

    pub async fn bucket_config(&self, bucket: &str) -> CbResult<Value> {
        self.request(Method::GET, &format!("/pools/default/buckets/{}", bucket), None)
            .await
    }

    pub async fn create_bucket(&self, name: &str, ram_quota_mb: u64, replicas: u32) -> CbResult<()> {
        let form = [
            ("name", name.to_string()),
            ("ramQuota", ram_quota_mb.to_string()),
            ("bucketType", "couchbase".to_string()),
            ("replicaNumber", replicas.to_string()),
            ("flushEnabled", "0".to_string()),
        ];
        self.request(Method::POST, "/pools/default/buckets", Some(&form))
            .await
            .map_err(|e| match e {
                CbError::AlreadyExists(_) => CbError::AlreadyExists(format!("bucket {}", name)),
                other => other,
            })?;
        Ok(())
    }

    pub async fn drop_bucket(&self, name: &str) -> CbResult<()> {
        self.request(Method::DELETE, &format!("/pools/default/buckets/{}", name), None)
            .await
            .map(|_| ())
    }

    pub async fn list_scopes(&self, bucket: &str) -> CbResult<Vec<ScopeInfo>> {
        let v = self
            .request(Method::GET, &format!("/pools/default/buckets/{}/scopes", bucket), None)
            .await?;
        Ok(parse_scopes(&v))
    }

    pub async fn create_scope(&self, bucket: &str, scope: &str) -> CbResult<()> {
        let form = [("name", scope.to_string())];
        self.request(
            Method::POST,
            &format!("/pools/default/buckets/{}/scopes", bucket),
            Some(&form),
        )
        .await
        .map(|_| ())
    }

    pub async fn drop_scope(&self, bucket: &str, scope: &str) -> CbResult<()> {
        self.request(
            Method::DELETE,
            &format!("/pools/default/buckets/{}/scopes/{}", bucket, scope),
            None,
        )
        .await
        .map(|_| ())
    }

    pub async fn create_collection(&self, ks: &Keyspace) -> CbResult<()> {
        let form = [("name", ks.collection.clone())];
        self.request(
            Method::POST,
            &format!("/pools/default/buckets/{}/scopes/{}/collections", ks.bucket, ks.scope),
            Some(&form),
        )
        .await
        .map(|_| ())
    }

    pub async fn drop_collection(&self, ks: &Keyspace) -> CbResult<()> {
        self.request(
            Method::DELETE,
            &format!(
                "/pools/default/buckets/{}/scopes/{}/collections/{}",
                ks.bucket, ks.scope, ks.collection
            ),
            None,
        )
        .await
        .map(|_| ())
    }

    // ---- query service ---------------------------------------------------

    pub async fn query(&self, statement: &str) -> CbResult<Vec<Value>> {
        self.query_with_timeout(statement, self.query_timeout).await
    }

    pub async fn query_with_timeout(&self, statement: &str, timeout: Duration) -> CbResult<Vec<Value>> {
        let host = self.pick(&self.query_hosts)?;
        let url = format!(
            "{}://{}/query/service",
            scheme(self.tls),
            host_port(host, self.query_port())
        );
        let body = json!({
            "statement": statement,
            "timeout": format!("{}ms", timeout.as_millis()),
        });
        debug!("query: {}", statement);
        let resp = self
            .http
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .timeout(timeout + HTTP_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_send_error(&url, e))?;
        let status = resp.status();
        let v: Value = resp.json().await.map_err(|e| map_send_error(&url, e))?;
        parse_query_response(status, v)
    }

    pub async fn create_primary_index(&self, ks: &Keyspace, replicas: u32, timeout: Duration) -> CbResult<()> {
        let stmt = format!(
            "CREATE PRIMARY INDEX ON {} WITH {{\"num_replica\": {}}}",
            ks.query_name(),
            replicas
        );
        self.query_with_timeout(&stmt, timeout).await.map(|_| ())
    }

    pub async fn create_index(&self, ks: &Keyspace, name: &str, field: &str, replicas: u32, timeout: Duration) -> CbResult<()> {
        let stmt = format!(
            "CREATE INDEX `{}` ON {}({}) WITH {{\"num_replica\": {}}}",
            name,
            ks.query_name(),
            quote_path(field),
            replicas
        );
        self.query_with_timeout(&stmt, timeout).await.map(|_| ())
    }

    pub async fn drop_primary_index(&self, ks: &Keyspace) -> CbResult<()> {
        self.query(&format!("DROP PRIMARY INDEX ON {}", ks.query_name()))
            .await
            .map(|_| ())
    }

    pub async fn drop_index(&self, ks: &Keyspace, name: &str) -> CbResult<()> {
        self.query(&format!("DROP INDEX `{}` ON {}", name, ks.query_name()))
            .await
            .map(|_| ())
    }

    pub async fn list_indexes(&self, ks: &Keyspace) -> CbResult<Vec<IndexInfo>> {
        let stmt = if ks.is_default_scope() && ks.is_default_collection() {
            format!(
                "SELECT i.* FROM system:indexes AS i WHERE (i.keyspace_id = '{b}' AND i.bucket_id IS MISSING) \
                 OR (i.bucket_id = '{b}' AND i.scope_id = '_default' AND i.keyspace_id = '_default')",
                b = ks.bucket
            )
        } else {
            format!(
                "SELECT i.* FROM system:indexes AS i WHERE i.bucket_id = '{}' AND i.scope_id = '{}' AND i.keyspace_id = '{}'",
                ks.bucket, ks.scope, ks.collection
            )
        };
        let rows = self.query(&stmt).await?;
        Ok(rows.iter().map(|r| parse_index_row(ks, r)).collect())
    }
}

/// `a.b` -> `` `a`.`b` ``
pub fn quote_path(field: &str) -> String {
    field
        .split('.')
        .map(|p| format!("`{}`", p))
        .collect::<Vec<_>>()
        .join(".")
}

pub fn parse_scopes(v: &Value) -> Vec<ScopeInfo> {
    v.get("scopes")
        .and_then(Value::as_array)
        .map(|scopes| {
            scopes
                .iter()
                .map(|s| ScopeInfo {
                    name: s.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
                    collections: s
                        .get("collections")
                        .and_then(Value::as_array)
                        .map(|cs| {
                            cs.iter()
                                .filter_map(|c| c.get("name").and_then(Value::as_str).map(String::from))
                                .collect()
                        })
                        .unwrap_or_default(),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_index_row(ks: &Keyspace, r: &Value) -> IndexInfo {
    IndexInfo {
        name: r.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
        keyspace: ks.clone(),
        state: r.get("state").and_then(Value::as_str).unwrap_or("unknown").to_string(),
        is_primary: r.get("is_primary").and_then(Value::as_bool).unwrap_or(false),
        fields: r
            .get("index_key")
            .and_then(Value::as_array)
            .map(|k| {
                k.iter()
                    .filter_map(Value::as_str)
                    .map(|s| s.replace('`', ""))
                    .collect()
            })
            .unwrap_or_default(),
    }
}

/// Decode a query-service response body.
pub fn parse_query_response(status: StatusCode, v: Value) -> CbResult<Vec<Value>> {
    if let Some(err) = v.get("errors").and_then(Value::as_array).and_then(|e| e.first()) {
        let code = err.get("code").and_then(Value::as_u64).unwrap_or(0) as u32;
        let msg = err.get("msg").and_then(Value::as_str).unwrap_or("unknown query error");
        return Err(CbError::from_query_code(code, msg));
    }
    if !status.is_success() {
        return Err(if status.is_server_error() {
            CbError::Transient(format!("query service returned {}", status))
        } else {
            CbError::QueryService(format!("query service returned {}", status))
        });
    }
    Ok(v.get("results")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_response_decoding() {
        let ok = json!({"status": "success", "results": [{"count": 30}]});
        assert_eq!(parse_query_response(StatusCode::OK, ok).unwrap()[0]["count"], 30);

        let exists = json!({"status": "errors", "errors": [{"code": 4300, "msg": "The index #primary already exists."}]});
        assert!(matches!(
            parse_query_response(StatusCode::INTERNAL_SERVER_ERROR, exists),
            Err(CbError::IndexExists(_))
        ));

        let busy = json!({"status": "errors", "errors": [{"code": 12003, "msg": "Keyspace not found"}]});
        assert!(matches!(
            parse_query_response(StatusCode::INTERNAL_SERVER_ERROR, busy),
            Err(CbError::Transient(_))
        ));
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            map_status(StatusCode::BAD_REQUEST, "/x", "Scope with this name already exists"),
            CbError::AlreadyExists(_)
        ));
        assert!(matches!(map_status(StatusCode::NOT_FOUND, "/x", ""), CbError::NotFound(_)));
        assert!(matches!(
            map_status(StatusCode::UNAUTHORIZED, "/x", ""),
            CbError::ClusterInit(_)
        ));
    }

    #[test]
    fn test_scope_listing_and_paths() {
        let v = json!({"scopes": [{"name": "_default", "collections": [{"name": "_default"}]},
                                  {"name": "hr", "collections": [{"name": "timecards"}]}]});
        let scopes = parse_scopes(&v);
        assert_eq!(scopes[1].name, "hr");
        assert_eq!(scopes[1].collections, vec!["timecards"]);
        assert_eq!(quote_path("address.city"), "`address`.`city`");
        assert_eq!(host_port("::1", 8091), "[::1]:8091");
    }
}
