// src/inventory.rs
//
// Schema inventory: which buckets, scopes, collections and indexes to build,
// which template each collection is loaded from, and the post-load rules.
//
// The file is parsed once into raw entries; `Inventory::build` resolves one
// schema into the typed tree with variables substituted and templates
// compiled.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::cluster::Keyspace;
use crate::constants::{DEFAULT_BATCH_SIZE, DEFAULT_COLLECTION, ENV_SCHEMA_FILE, MIN_BUCKET_QUOTA_MB};
use crate::error::{CbError, CbResult};
use crate::template::{has_path, DocTemplate};

const BUNDLED_SCHEMA: &str = include_str!("../data/schema.json");

pub const FILE_PARAMETER: &str = "FILE_PARAMETER";
pub const ID_FIELD_PARAMETER: &str = "ID_FIELD_PARAMETER";
pub const BUCKET_PARAMETER: &str = "BUCKET_PARAMETER";

// =============================================================================
// Raw file shape
// =============================================================================

#[derive(Debug, Deserialize)]
struct InventoryFile {
    inventory: Vec<BTreeMap<String, RawSchema>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawSchema {
    #[serde(default)]
    pub buckets: Vec<RawBucket>,
    #[serde(default)]
    pub rules: Vec<RawRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawBucket {
    pub name: String,
    #[serde(default)]
    pub memory_quota: Option<u64>,
    #[serde(default)]
    pub scopes: Vec<RawScope>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawScope {
    pub name: String,
    #[serde(default)]
    pub collections: Vec<RawCollection>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawCollection {
    pub name: String,
    pub schema: Value,
    #[serde(default)]
    pub idkey: String,
    #[serde(default)]
    pub primary_index: bool,
    #[serde(default)]
    pub override_count: bool,
    #[serde(default)]
    pub record_count: Option<u64>,
    #[serde(default)]
    pub batch_size: Option<u64>,
    #[serde(default)]
    pub indexes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawRule {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub id_field: String,
    pub foreign_key: String,
    pub primary_key: String,
    #[serde(default)]
    pub sql: Option<String>,
}

// =============================================================================
// Variables
// =============================================================================

/// Values bound to the parameter tokens at build time. Tokens without a
/// binding are left in place.
#[derive(Debug, Clone, Default)]
pub struct Variables {
    pub file: Option<String>,
    pub id_field: Option<String>,
    pub bucket: Option<String>,
}

impl Variables {
    pub fn substitute(&self, text: &str) -> String {
        let mut out = text.to_string();
        for (token, value) in [
            (FILE_PARAMETER, &self.file),
            (ID_FIELD_PARAMETER, &self.id_field),
            (BUCKET_PARAMETER, &self.bucket),
        ] {
            if let Some(v) = value {
                out = out.replace(token, v);
            }
        }
        out
    }

    fn substitute_value(&self, v: &Value) -> Value {
        match v {
            Value::String(s) => Value::String(self.substitute(s)),
            Value::Array(items) => Value::Array(items.iter().map(|i| self.substitute_value(i)).collect()),
            Value::Object(m) => Value::Object(
                m.iter()
                    .map(|(k, v)| (self.substitute(k), self.substitute_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

// =============================================================================
// Typed tree
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub field: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct Collection {
    pub name: String,
    pub bucket: String,
    pub scope: String,
    pub id_field: String,
    pub primary_index: bool,
    pub override_count: bool,
    pub record_count: Option<u64>,
    pub batch_size: Option<u64>,
    pub indexes: Vec<IndexSpec>,
    pub template: DocTemplate,
    /// JSON byte length of one rendered sample
    pub doc_size: usize,
}

impl Collection {
    pub fn keyspace(&self) -> Keyspace {
        Keyspace::new(&self.bucket, &self.scope, &self.name)
    }

    /// Records to load: the schema override when set and non-zero, else `default`.
    pub fn effective_count(&self, default: u64) -> u64 {
        match (self.override_count, self.record_count) {
            (true, Some(n)) if n > 0 => n,
            _ => default,
        }
    }

    pub fn effective_batch_size(&self, default: u64) -> u64 {
        self.batch_size.filter(|b| *b > 0).unwrap_or(default)
    }
}

#[derive(Debug, Clone)]
pub struct Scope {
    pub name: String,
    pub collections: Vec<Collection>,
}

#[derive(Debug, Clone)]
pub struct Bucket {
    pub name: String,
    pub memory_quota: Option<u64>,
    pub scopes: Vec<Scope>,
}

impl Bucket {
    pub fn collections(&self) -> impl Iterator<Item = &Collection> {
        self.scopes.iter().flat_map(|s| s.collections.iter())
    }

    /// Estimated bytes for loading every collection with `record_count`.
    pub fn estimated_bytes(&self, record_count: u64) -> u64 {
        self.collections()
            .map(|c| c.doc_size as u64 * c.effective_count(record_count))
            .sum()
    }

    /// Memory quota in MiB: the declared quota, or the size estimate,
    /// raised to the cluster minimum and clamped to the cluster quota.
    pub fn quota_mb(&self, record_count: u64, cluster_quota_mb: u64) -> u64 {
        let wanted = self
            .memory_quota
            .unwrap_or_else(|| self.estimated_bytes(record_count).div_ceil(1024 * 1024));
        bucket_quota(&self.name, wanted, cluster_quota_mb)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Link,
}

/// `bucket:scope:collection:field`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPath {
    pub bucket: String,
    pub scope: String,
    pub collection: String,
    pub field: String,
}

impl KeyPath {
    pub fn parse(text: &str) -> CbResult<Self> {
        let parts: Vec<&str> = text.split(':').collect();
        match parts.as_slice() {
            [b, s, c, f] if parts.iter().all(|p| !p.is_empty()) => Ok(Self {
                bucket: b.to_string(),
                scope: s.to_string(),
                collection: c.to_string(),
                field: f.to_string(),
            }),
            _ => Err(CbError::Rules(format!(
                "key '{}' must have the form bucket:scope:collection:field",
                text
            ))),
        }
    }

    pub fn keyspace(&self) -> Keyspace {
        Keyspace::new(&self.bucket, &self.scope, &self.collection)
    }
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub kind: RuleKind,
    pub id_field: String,
    pub primary: KeyPath,
    pub foreign: KeyPath,
    pub sql: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Schema {
    pub name: String,
    pub buckets: Vec<Bucket>,
    pub rules: Vec<Rule>,
}

impl Schema {
    pub fn collections(&self) -> impl Iterator<Item = &Collection> {
        self.buckets.iter().flat_map(|b| b.collections())
    }

    pub fn find(&self, keyspace: &Keyspace) -> Option<&Collection> {
        self.collections().find(|c| c.keyspace() == *keyspace)
    }
}

// =============================================================================
// Naming
// =============================================================================

/// `<collection>:<n>` for named collections, `<bucket>:<n>` for the default one.
pub fn document_key(keyspace: &Keyspace, n: u64) -> String {
    format!("{}:{}", keyspace.base_name(), n)
}

/// Canonical secondary index name for a dotted field path.
pub fn index_name(keyspace: &Keyspace, field: &str) -> String {
    let raw = format!("{}_{}_ix", keyspace.base_name(), field.replace('.', "_"));
    raw.trim_start_matches('_').to_string()
}

pub fn bucket_quota(bucket: &str, wanted_mb: u64, cluster_quota_mb: u64) -> u64 {
    let mut quota = wanted_mb.max(MIN_BUCKET_QUOTA_MB);
    if cluster_quota_mb > 0 && quota > cluster_quota_mb {
        warn!(
            "bucket {} needs {} MiB but the cluster quota is {} MiB; clamping",
            bucket, quota, cluster_quota_mb
        );
        quota = cluster_quota_mb;
    }
    quota
}

// =============================================================================
// Inventory
// =============================================================================

/// Every schema declared in one inventory file, in file order.
#[derive(Debug, Clone)]
pub struct Inventory {
    schemas: Vec<(String, RawSchema)>,
    base_dir: Option<PathBuf>,
}

impl Inventory {
    pub fn parse(text: &str) -> CbResult<Self> {
        let file: InventoryFile = serde_json::from_str(text)
            .map_err(|e| CbError::SchemaConfig(format!("inventory is not valid: {}", e)))?;
        let schemas = file
            .inventory
            .into_iter()
            .flat_map(|entry| entry.into_iter())
            .collect();
        Ok(Self { schemas, base_dir: None })
    }

    pub fn from_file(path: &Path) -> CbResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| CbError::SchemaConfig(format!("cannot read {}: {}", path.display(), e)))?;
        let mut inv = Self::parse(&text)?;
        inv.base_dir = path.parent().map(Path::to_path_buf);
        Ok(inv)
    }

    pub fn bundled() -> CbResult<Self> {
        Self::parse(BUNDLED_SCHEMA)
    }

    /// Explicit path, else `CBPERF_SCHEMA_FILE`, else the bundled inventory.
    pub fn resolve(path: Option<&Path>) -> CbResult<Self> {
        if let Some(p) = path {
            return Self::from_file(p);
        }
        match std::env::var(ENV_SCHEMA_FILE) {
            Ok(p) if !p.is_empty() => Self::from_file(Path::new(&p)),
            _ => Self::bundled(),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.schemas.iter().map(|(n, _)| n.as_str())
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &RawSchema)> {
        self.schemas.iter().map(|(n, s)| (n.as_str(), s))
    }

    pub fn raw(&self, name: &str) -> Option<&RawSchema> {
        self.schemas.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    /// Resolve one schema: substitute variables, load external templates,
    /// compile templates and validate index paths and rules.
    pub fn build(&self, name: &str, vars: &Variables) -> CbResult<Schema> {
        let raw = self
            .raw(name)
            .ok_or_else(|| CbError::SchemaConfig(format!("schema '{}' not found in inventory", name)))?;

        let mut buckets = Vec::with_capacity(raw.buckets.len());
        for rb in &raw.buckets {
            buckets.push(self.build_bucket(rb, vars)?);
        }

        let mut rules = Vec::with_capacity(raw.rules.len());
        for rr in &raw.rules {
            rules.push(build_rule(rr, vars)?);
        }

        debug!("schema {} resolved: {} buckets, {} rules", name, buckets.len(), rules.len());
        Ok(Schema {
            name: name.to_string(),
            buckets,
            rules,
        })
    }

    fn build_bucket(&self, rb: &RawBucket, vars: &Variables) -> CbResult<Bucket> {
        let name = vars.substitute(&rb.name);
        if name.trim().is_empty() {
            return Err(CbError::SchemaConfig("bucket name is empty".into()));
        }
        let mut scopes = Vec::with_capacity(rb.scopes.len());
        for rs in &rb.scopes {
            let scope_name = vars.substitute(&rs.name);
            let mut collections = Vec::with_capacity(rs.collections.len());
            for rc in &rs.collections {
                collections.push(self.build_collection(&name, &scope_name, rc, vars)?);
            }
            scopes.push(Scope {
                name: scope_name,
                collections,
            });
        }
        Ok(Bucket {
            name,
            memory_quota: rb.memory_quota,
            scopes,
        })
    }

    fn build_collection(&self, bucket: &str, scope: &str, rc: &RawCollection, vars: &Variables) -> CbResult<Collection> {
        let name = vars.substitute(&rc.name);
        let name = if name.is_empty() { DEFAULT_COLLECTION.to_string() } else { name };
        let id_field = vars.substitute(&rc.idkey);
        if id_field.trim().is_empty() {
            return Err(CbError::SchemaConfig(format!("collection {} has an empty id field", name)));
        }

        let definition = match &rc.schema {
            Value::String(s) => self.load_external(&vars.substitute(s))?,
            other => vars.substitute_value(other),
        };
        match definition.as_object() {
            Some(m) if !m.is_empty() => {}
            _ => {
                return Err(CbError::SchemaConfig(format!(
                    "document definition for {} must be a non-empty object",
                    name
                )))
            }
        }

        let keyspace = Keyspace::new(bucket, scope, &name);
        let mut indexes = Vec::with_capacity(rc.indexes.len());
        for field in &rc.indexes {
            let field = vars.substitute(field);
            if !has_path(&definition, &field) {
                return Err(CbError::SchemaConfig(format!(
                    "index field '{}' is not a path in the {} template",
                    field, keyspace
                )));
            }
            indexes.push(IndexSpec {
                name: index_name(&keyspace, &field),
                field,
            });
        }

        let template = DocTemplate::compile(&definition)
            .map_err(|e| CbError::SchemaConfig(format!("{}: {}", keyspace, e)))?
            .with_id_field(id_field.clone())
            .with_block_size(rc.batch_size.unwrap_or(DEFAULT_BATCH_SIZE));
        let doc_size = serde_json::to_vec(&template.render(Some(1)))?.len();

        Ok(Collection {
            name,
            bucket: bucket.to_string(),
            scope: scope.to_string(),
            id_field,
            primary_index: rc.primary_index,
            override_count: rc.override_count,
            record_count: rc.record_count,
            batch_size: rc.batch_size,
            indexes,
            template,
            doc_size,
        })
    }

    fn load_external(&self, reference: &str) -> CbResult<Value> {
        let mut path = PathBuf::from(reference);
        if path.is_relative() && !path.exists() {
            if let Some(base) = &self.base_dir {
                path = base.join(reference);
            }
        }
        let text = std::fs::read_to_string(&path)
            .map_err(|e| CbError::SchemaConfig(format!("cannot read template {}: {}", path.display(), e)))?;
        serde_json::from_str(&text)
            .map_err(|e| CbError::SchemaConfig(format!("template {} is not valid JSON: {}", path.display(), e)))
    }
}

fn build_rule(rr: &RawRule, vars: &Variables) -> CbResult<Rule> {
    let kind = match rr.kind.as_str() {
        "link" => RuleKind::Link,
        other => return Err(CbError::Rules(format!("rule {}: unsupported type '{}'", rr.name, other))),
    };
    Ok(Rule {
        name: rr.name.clone(),
        kind,
        id_field: vars.substitute(&rr.id_field),
        primary: KeyPath::parse(&vars.substitute(&rr.primary_key))?,
        foreign: KeyPath::parse(&vars.substitute(&rr.foreign_key))?,
        sql: rr.sql.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_bundled_schemas_build() {
        let inv = Inventory::bundled().unwrap();
        let names: Vec<&str> = inv.names().collect();
        assert_eq!(names, ["default", "profile_demo", "employee_demo", "external_file"]);

        let s = inv.build("default", &Variables::default()).unwrap();
        let c = s.collections().next().unwrap();
        assert_eq!(c.keyspace(), Keyspace::bucket_only("cbperf"));
        assert_eq!(document_key(&c.keyspace(), 12), "cbperf:12");
        assert_eq!(c.indexes[0].name, "cbperf_record_id_ix");
        assert!(c.doc_size > 0);

        let demo = inv.build("profile_demo", &Variables::default()).unwrap();
        assert_eq!(demo.rules.len(), 1);
        let ud = demo.find(&Keyspace::new("sample_app", "profiles", "user_data")).unwrap();
        assert_eq!(document_key(&ud.keyspace(), 3), "user_data:3");
        assert!(ud.indexes.iter().any(|i| i.name == "user_data_address_city_ix"));
    }

    #[test]
    fn test_index_name_strips_leading_underscores() {
        let ks = Keyspace::new("b", "s", "_hidden");
        assert_eq!(index_name(&ks, "a.b"), "hidden_a_b_ix");
    }

    #[test]
    fn test_effective_count() {
        let inv = Inventory::bundled().unwrap();
        let s = inv.build("employee_demo", &Variables::default()).unwrap();
        let tc = s.find(&Keyspace::new("employees", "hr", "timecards")).unwrap();
        assert_eq!(tc.effective_count(30), 5000);
        let ed = s.find(&Keyspace::new("employees", "hr", "employee_data")).unwrap();
        assert_eq!(ed.effective_count(30), 30);
    }

    #[test]
    fn test_quota_bounds() {
        assert_eq!(bucket_quota("b", 10, 4096), MIN_BUCKET_QUOTA_MB);
        assert_eq!(bucket_quota("b", 9000, 4096), 4096);
        assert_eq!(bucket_quota("b", 512, 0), 512);
    }

    #[test]
    fn test_external_template_with_variables() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, r#"{{"doc_id": 0, "name": "{{{{ rand_first }}}}"}}"#).unwrap();
        let vars = Variables {
            file: Some(f.path().display().to_string()),
            id_field: Some("doc_id".into()),
            bucket: Some("ext".into()),
        };
        let inv = Inventory::bundled().unwrap();
        let s = inv.build("external_file", &vars).unwrap();
        let c = s.collections().next().unwrap();
        assert_eq!(c.bucket, "ext");
        assert_eq!(c.id_field, "doc_id");
        assert_eq!(c.template.render(Some(9))["doc_id"], 9);
    }

    #[test]
    fn test_unresolved_file_parameter_fails() {
        let inv = Inventory::bundled().unwrap();
        let vars = Variables {
            bucket: Some("ext".into()),
            id_field: Some("id".into()),
            file: None,
        };
        let err = inv.build("external_file", &vars).unwrap_err();
        assert!(matches!(err, CbError::SchemaConfig(_)));
        assert!(err.to_string().contains(FILE_PARAMETER));
    }

    #[test]
    fn test_schema_config_errors() {
        let bad_index = r#"{"inventory":[{"s":{"buckets":[{"name":"b","scopes":[{"name":"_default",
            "collections":[{"name":"_default","schema":{"a":1},"idkey":"a","indexes":["missing.path"]}]}]}]}}]}"#;
        let inv = Inventory::parse(bad_index).unwrap();
        assert!(inv.build("s", &Variables::default()).is_err());

        let empty_doc = r#"{"inventory":[{"s":{"buckets":[{"name":"b","scopes":[{"name":"_default",
            "collections":[{"name":"_default","schema":{},"idkey":"a"}]}]}]}}]}"#;
        assert!(Inventory::parse(empty_doc).unwrap().build("s", &Variables::default()).is_err());

        let empty_bucket = r#"{"inventory":[{"s":{"buckets":[{"name":"","scopes":[]}]}}]}"#;
        assert!(Inventory::parse(empty_bucket).unwrap().build("s", &Variables::default()).is_err());

        assert!(KeyPath::parse("a:b:c").is_err());
    }
}
