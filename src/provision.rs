// src/provision.rs
//! Provisioning phase: make the cluster match an inventory schema.
//!
//! Every step is idempotent. Buckets, scopes and collections are created
//! when absent and then polled until the management API lists them; primary
//! and secondary indexes are created afterwards. Index readiness is checked
//! separately with [`Provisioner::wait_for_indexes`] once data is loaded,
//! since a covering query only proves an index is online when it returns
//! every document.

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::cluster::{BucketSettings, Keyspace, Session};
use crate::constants::{DEFAULT_SCOPE, INDEX_CREATE_TIMEOUT, PRIMARY_INDEX_NAME, VISIBILITY_RETRIES};
use crate::error::{CbError, CbResult, ErrorKind};
use crate::inventory::{Bucket, Collection, Schema};
use crate::retry::{retry_with_backoff, RetryPolicy};

/// What one provisioning pass did. Re-running against a provisioned
/// cluster yields an empty report.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProvisionReport {
    pub buckets_created: Vec<String>,
    pub scopes_created: Vec<String>,
    pub collections_created: Vec<String>,
    pub indexes_requested: usize,
}

impl ProvisionReport {
    pub fn is_empty(&self) -> bool {
        self.buckets_created.is_empty() && self.scopes_created.is_empty() && self.collections_created.is_empty()
    }
}

pub struct Provisioner<'a> {
    session: &'a Session,
    record_count: u64,
    replicas: u32,
}

impl<'a> Provisioner<'a> {
    pub fn new(session: &'a Session, record_count: u64, replicas: u32) -> Self {
        Self {
            session,
            record_count,
            replicas,
        }
    }

    /// Create every bucket, scope, collection and index the schema declares.
    pub async fn provision(&self, schema: &Schema) -> CbResult<ProvisionReport> {
        let mut report = ProvisionReport::default();
        for bucket in &schema.buckets {
            self.ensure_bucket(bucket, &mut report).await?;
            for scope in &bucket.scopes {
                self.ensure_scope(&bucket.name, &scope.name, &mut report).await?;
                for coll in &scope.collections {
                    self.ensure_collection(coll, &mut report).await?;
                    self.ensure_indexes(coll, &mut report).await?;
                }
            }
        }
        info!(
            "schema {} provisioned ({} buckets, {} scopes, {} collections created)",
            schema.name,
            report.buckets_created.len(),
            report.scopes_created.len(),
            report.collections_created.len()
        );
        Ok(report)
    }

    async fn ensure_bucket(&self, bucket: &Bucket, report: &mut ProvisionReport) -> CbResult<()> {
        let quota = bucket.quota_mb(self.record_count, self.session.info().memory_quota_mb);
        self.ensure_bucket_named(&bucket.name, quota, report).await
    }

    async fn ensure_bucket_named(&self, name: &str, quota: u64, report: &mut ProvisionReport) -> CbResult<()> {
        if self.session.bucket_exists(name).await? {
            debug!("bucket {} exists", name);
            return Ok(());
        }
        info!("creating bucket {} ({} MiB, {} replicas)", name, quota, self.replicas);
        self.session
            .create_bucket(&BucketSettings {
                name: name.to_string(),
                ram_quota_mb: quota,
                replicas: self.replicas,
            })
            .await?;
        self.wait_until(&format!("bucket {}", name), || self.session.bucket_exists(name))
            .await?;
        report.buckets_created.push(name.to_string());
        Ok(())
    }

    async fn ensure_scope(&self, bucket: &str, scope: &str, report: &mut ProvisionReport) -> CbResult<()> {
        if scope == DEFAULT_SCOPE || self.session.scope_exists(bucket, scope).await? {
            return Ok(());
        }
        info!("creating scope {}.{}", bucket, scope);
        self.session.create_scope(bucket, scope).await?;
        self.wait_until(&format!("scope {}.{}", bucket, scope), || {
            self.session.scope_exists(bucket, scope)
        })
        .await?;
        report.scopes_created.push(format!("{}.{}", bucket, scope));
        Ok(())
    }

    /// Create one keyspace outside any schema, with an explicit bucket quota.
    pub async fn ensure_keyspace(&self, ks: &Keyspace, quota_mb: u64) -> CbResult<ProvisionReport> {
        let mut report = ProvisionReport::default();
        self.ensure_bucket_named(&ks.bucket, quota_mb, &mut report).await?;
        self.ensure_scope(&ks.bucket, &ks.scope, &mut report).await?;
        self.ensure_keyspace_collection(ks, &mut report).await?;
        Ok(report)
    }

    async fn ensure_collection(&self, coll: &Collection, report: &mut ProvisionReport) -> CbResult<()> {
        self.ensure_keyspace_collection(&coll.keyspace(), report).await
    }

    async fn ensure_keyspace_collection(&self, ks: &Keyspace, report: &mut ProvisionReport) -> CbResult<()> {
        if ks.is_default_collection() || self.session.collection_exists(ks).await? {
            return Ok(());
        }
        info!("creating collection {}", ks);
        self.session.create_collection(ks).await?;
        self.wait_until(&format!("collection {}", ks), || self.session.collection_exists(ks))
            .await?;
        report.collections_created.push(ks.to_string());
        Ok(())
    }

    async fn ensure_indexes(&self, coll: &Collection, report: &mut ProvisionReport) -> CbResult<()> {
        let ks = coll.keyspace();
        if coll.primary_index {
            self.session.create_primary_index(&ks, self.replicas).await?;
            report.indexes_requested += 1;
        }
        for ix in &coll.indexes {
            debug!("index {} on {}({})", ix.name, ks, ix.field);
            self.session.create_index(&ks, &ix.name, &ix.field, self.replicas).await?;
            report.indexes_requested += 1;
        }
        Ok(())
    }

    /// Poll `check` until it reports true.
    async fn wait_until<F, Fut>(&self, what: &str, mut check: F) -> CbResult<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CbResult<bool>>,
    {
        let policy = RetryPolicy::new(VISIBILITY_RETRIES, self.session.policy().factor).allow(&[
            ErrorKind::NotFound,
            ErrorKind::Transient,
            ErrorKind::Timeout,
        ]);
        retry_with_backoff(&format!("wait for {}", what), &policy, || {
            let fut = check();
            async move {
                match fut.await? {
                    true => Ok(()),
                    false => Err(CbError::NotFound(what.to_string())),
                }
            }
        })
        .await
    }

    /// Wait until every index of every collection answers a covering query
    /// with at least as many rows as the collection holds.
    pub async fn wait_for_indexes(&self, schema: &Schema) -> CbResult<()> {
        for coll in schema.collections() {
            wait_for_collection_indexes(self.session, coll, INDEX_CREATE_TIMEOUT).await?;
        }
        Ok(())
    }

    /// Drop every bucket the schema references. Missing buckets are skipped.
    pub async fn clean(&self, schema: &Schema) -> CbResult<Vec<String>> {
        let mut dropped = Vec::new();
        for bucket in &schema.buckets {
            if !self.session.bucket_exists(&bucket.name).await? {
                debug!("bucket {} not present", bucket.name);
                continue;
            }
            info!("dropping bucket {}", bucket.name);
            self.session.drop_bucket(&bucket.name).await?;
            dropped.push(bucket.name.clone());
        }
        Ok(dropped)
    }
}

/// Largest retry count whose total wait fits inside `budget`.
pub fn bounded_policy(factor: f64, budget: Duration) -> RetryPolicy {
    let mut policy = RetryPolicy::new(0, factor.max(0.001));
    while policy.retries < 32 && policy.total_budget() + policy.delay_for(policy.retries) <= budget {
        policy.retries += 1;
    }
    policy
}

/// Statement proving an index is serving every document of `ks`.
pub fn covering_query(ks: &Keyspace, field: Option<&str>) -> String {
    match field {
        Some(f) => format!("SELECT {f} FROM {} WHERE TOSTRING({f}) LIKE \"%\"", ks.query_name()),
        None => format!("SELECT meta().id FROM {}", ks.query_name()),
    }
}

pub async fn wait_for_collection_indexes(session: &Session, coll: &Collection, budget: Duration) -> CbResult<()> {
    let ks = coll.keyspace();
    let mut targets: Vec<(String, Option<&str>)> = Vec::new();
    if coll.primary_index {
        targets.push((PRIMARY_INDEX_NAME.to_string(), None));
    }
    for ix in &coll.indexes {
        targets.push((ix.name.clone(), Some(ix.field.as_str())));
    }
    if targets.is_empty() {
        return Ok(());
    }

    let started = Instant::now();
    let names: Vec<String> = targets.iter().map(|(name, _)| name.clone()).collect();
    session.watch_indexes(&ks, &names, budget).await?;
    let budget = budget.saturating_sub(started.elapsed());

    let expected = session.collection_count(&ks).await?;
    let policy = bounded_policy(session.policy().factor, budget).allow(&[
        ErrorKind::Transient,
        ErrorKind::Timeout,
        ErrorKind::QueryEmpty,
        ErrorKind::IndexNotFound,
    ]);
    for (name, field) in targets {
        let statement = covering_query(&ks, field);
        retry_with_backoff(&format!("index {} on {}", name, ks), &policy, || {
            let statement = statement.clone();
            let name = name.clone();
            async move {
                let rows = session.api().query(&statement).await?.len() as u64;
                if rows >= expected {
                    Ok(())
                } else {
                    Err(CbError::Transient(format!("index {} has {} of {} rows", name, rows, expected)))
                }
            }
        })
        .await?;
        debug!("index {} on {} online", name, ks);
    }
    info!("indexes on {} online after {:.2?}", ks, started.elapsed());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_policy_fits_budget() {
        let p = bounded_policy(0.01, Duration::from_secs(480));
        assert!(p.total_budget() <= Duration::from_secs(480));
        assert!(p.total_budget() + p.delay_for(p.retries) > Duration::from_secs(480));
        assert_eq!(bounded_policy(0.01, Duration::ZERO).retries, 0);
    }

    #[test]
    fn test_covering_query_shapes() {
        let ks = Keyspace::new("sample_app", "profiles", "user_data");
        assert_eq!(
            covering_query(&ks, Some("address.city")),
            "SELECT address.city FROM `sample_app`.`profiles`.`user_data` WHERE TOSTRING(address.city) LIKE \"%\""
        );
        assert_eq!(
            covering_query(&ks, None),
            "SELECT meta().id FROM `sample_app`.`profiles`.`user_data`"
        );
    }
}
