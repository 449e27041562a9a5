// src/rules.rs
//! Post-load rules.
//!
//! A link rule copies a field of every primary document into a field of the
//! foreign document with the same record number. Both collections must live
//! in the same bucket and scope and hold the same number of documents.
//! Values are written with one sub-document upsert per foreign document, so
//! a failure part way through leaves the earlier records linked.

use serde_json::Value;
use tracing::{debug, info};

use crate::cluster::Session;
use crate::error::{CbError, CbResult};
use crate::inventory::{document_key, Rule, RuleKind, Schema};

/// Records linked per sub-document round.
const LINK_CHUNK: usize = 256;

/// Apply every rule of `schema` in declaration order.
pub async fn apply_rules(session: &Session, schema: &Schema) -> CbResult<usize> {
    let mut linked = 0;
    for rule in &schema.rules {
        linked += apply_rule(session, rule).await?;
    }
    Ok(linked)
}

pub async fn apply_rule(session: &Session, rule: &Rule) -> CbResult<usize> {
    match rule.kind {
        RuleKind::Link => link(session, rule).await,
    }
}

fn check_shape(rule: &Rule) -> CbResult<()> {
    let (p, f) = (&rule.primary, &rule.foreign);
    if p.bucket != f.bucket {
        return Err(CbError::Rules(format!(
            "rule {}: cross-bucket link {} -> {} is not supported",
            rule.name, p.bucket, f.bucket
        )));
    }
    if p.scope != f.scope {
        return Err(CbError::Rules(format!(
            "rule {}: cross-scope link {} -> {} is not supported",
            rule.name, p.scope, f.scope
        )));
    }
    Ok(())
}

/// Primary field values in record order.
async fn primary_values(session: &Session, rule: &Rule, count: u64) -> CbResult<Vec<Value>> {
    let ks = rule.primary.keyspace();
    if let Some(sql) = rule.sql.as_deref() {
        let column = rule.primary.field.rsplit('.').next().unwrap_or(&rule.primary.field);
        let rows = session.query(sql).await?;
        return rows
            .into_iter()
            .map(|row| {
                row.get(column).cloned().ok_or_else(|| {
                    CbError::Rules(format!("rule {}: row without '{}': {}", rule.name, column, row))
                })
            })
            .collect();
    }
    let mut values = Vec::with_capacity(count as usize);
    for n in 1..=count {
        let key = document_key(&ks, n);
        let v = session
            .subdoc_get(&ks, &key, &rule.primary.field)
            .await?
            .ok_or_else(|| CbError::Rules(format!("rule {}: {} has no {}", rule.name, key, rule.primary.field)))?;
        values.push(v);
    }
    Ok(values)
}

async fn link(session: &Session, rule: &Rule) -> CbResult<usize> {
    check_shape(rule)?;
    let pks = rule.primary.keyspace();
    let fks = rule.foreign.keyspace();

    let primary_count = session.collection_count(&pks).await?;
    let foreign_count = session.collection_count(&fks).await?;
    if primary_count != foreign_count {
        return Err(CbError::Rules(format!(
            "rule {}: {} has {} documents but {} has {}",
            rule.name, pks, primary_count, fks, foreign_count
        )));
    }

    let values = primary_values(session, rule, primary_count).await?;
    if values.len() as u64 != foreign_count {
        return Err(CbError::Rules(format!(
            "rule {}: {} primary values for {} foreign documents",
            rule.name,
            values.len(),
            foreign_count
        )));
    }

    let keys: Vec<String> = (1..=foreign_count).map(|n| document_key(&fks, n)).collect();
    for (kchunk, vchunk) in keys.chunks(LINK_CHUNK).zip(values.chunks(LINK_CHUNK)) {
        session
            .subdoc_multi_upsert(&fks, kchunk, &rule.foreign.field, vchunk)
            .await?;
        debug!("rule {}: linked {} records", rule.name, kchunk.len());
    }
    info!(
        "rule {}: {}.{} -> {}.{} on {} records",
        rule.name, pks, rule.primary.field, fks, rule.foreign.field, keys.len()
    );
    Ok(keys.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::KeyPath;

    fn rule(primary: &str, foreign: &str) -> Rule {
        Rule {
            name: "r".into(),
            kind: RuleKind::Link,
            id_field: "record_id".into(),
            primary: KeyPath::parse(primary).unwrap(),
            foreign: KeyPath::parse(foreign).unwrap(),
            sql: None,
        }
    }

    #[test]
    fn test_cross_bucket_and_scope_rejected() {
        let ok = rule("b:s:images:record_id", "b:s:users:picture");
        assert!(check_shape(&ok).is_ok());
        let err = check_shape(&rule("a:s:images:record_id", "b:s:users:picture")).unwrap_err();
        assert!(matches!(err, CbError::Rules(ref m) if m.contains("cross-bucket")));
        let err = check_shape(&rule("b:s1:images:record_id", "b:s2:users:picture")).unwrap_err();
        assert!(matches!(err, CbError::Rules(ref m) if m.contains("cross-scope")));
    }
}
