//! Inventory-driven loads against the in-memory cluster: provisioning,
//! key layout, rules, index readiness and clean-up.

mod common;

use serde_json::json;

use cbperf::cluster::memory::MemoryCluster;
use cbperf::cluster::Keyspace;
use cbperf::inventory::{document_key, index_name, Inventory, Variables};
use cbperf::loader::{load_from_inventory, LoadOptions};
use cbperf::provision::Provisioner;

fn options(record_count: u64, batch_size: u64) -> LoadOptions {
    LoadOptions {
        record_count,
        batch_size,
        replicas: 0,
        probe: false,
        operations: 0,
        write_percent: 50,
        random_keys: false,
        ramp: false,
    }
}

#[tokio::test]
async fn test_default_schema_load() {
    let mc = MemoryCluster::new();
    let ctx = common::context(&mc, 4).await;
    let schema = Inventory::bundled().unwrap().build("default", &Variables::default()).unwrap();

    let report = load_from_inventory(&ctx, &schema, &options(30, 7)).await.unwrap();
    assert!(!report.failed());
    assert_eq!(report.provisioned.buckets_created, vec!["cbperf".to_string()]);
    assert_eq!(report.total_ops(), 30);

    let ks = Keyspace::new("cbperf", "_default", "_default");
    assert_eq!(mc.doc_count(&ks), 30);
    assert_eq!(ctx.session.collection_count(&ks).await.unwrap(), 30);
    for n in 1..=30u64 {
        let key = document_key(&ks, n);
        assert_eq!(key, format!("cbperf:{}", n));
        let doc = mc.document(&ks, &key).expect("every record number is written");
        assert_eq!(doc["record_id"], json!(n));
    }

    let indexes = mc.index_names(&ks);
    assert!(indexes.contains(&index_name(&ks, "record_id")), "indexes: {:?}", indexes);
    assert!(indexes.contains(&index_name(&ks, "last_name")), "indexes: {:?}", indexes);
    assert!(mc.bucket_quota("cbperf").unwrap() >= 256);
}

#[tokio::test]
async fn test_zero_records_writes_nothing() {
    let mc = MemoryCluster::new();
    let ctx = common::context(&mc, 2).await;
    let schema = Inventory::bundled().unwrap().build("default", &Variables::default()).unwrap();

    let report = load_from_inventory(&ctx, &schema, &options(0, 10)).await.unwrap();
    assert!(!report.failed());
    assert_eq!(report.total_ops(), 0);
    assert_eq!(mc.doc_count(&Keyspace::new("cbperf", "_default", "_default")), 0);
}

#[tokio::test]
async fn test_provision_is_idempotent() {
    let mc = MemoryCluster::new();
    let session = common::session(&mc).await;
    let schema = Inventory::bundled().unwrap().build("profile_demo", &Variables::default()).unwrap();
    let prov = Provisioner::new(&session, 10, 0);

    let first = prov.provision(&schema).await.unwrap();
    assert_eq!(first.buckets_created, vec!["sample_app".to_string()]);
    assert_eq!(first.collections_created.len(), 2);

    let second = prov.provision(&schema).await.unwrap();
    assert!(second.is_empty(), "second pass created {:?}", second);
}

#[tokio::test]
async fn test_link_rule_copies_primary_field() {
    let mc = MemoryCluster::new();
    let ctx = common::context(&mc, 3).await;
    let schema = Inventory::bundled().unwrap().build("profile_demo", &Variables::default()).unwrap();

    let report = load_from_inventory(&ctx, &schema, &options(12, 5)).await.unwrap();
    assert!(!report.failed());
    assert_eq!(report.linked, 12);

    let users = Keyspace::new("sample_app", "profiles", "user_data");
    let images = Keyspace::new("sample_app", "profiles", "user_images");
    assert_eq!(mc.doc_count(&users), 12);
    assert_eq!(mc.doc_count(&images), 12);
    for n in 1..=12u64 {
        let user = mc.document(&users, &document_key(&users, n)).unwrap();
        let image = mc.document(&images, &document_key(&images, n)).unwrap();
        assert_eq!(user["picture"], image["record_id"]);
    }
}

#[tokio::test]
async fn test_index_wait_survives_slow_builds() {
    let mc = MemoryCluster::new();
    mc.lag_index_builds(2);
    let ctx = common::context(&mc, 2).await;
    let schema = Inventory::bundled().unwrap().build("default", &Variables::default()).unwrap();

    let report = load_from_inventory(&ctx, &schema, &options(10, 5)).await.unwrap();
    assert!(!report.failed());
}

#[tokio::test]
async fn test_clean_drops_schema_buckets() {
    let mc = MemoryCluster::new();
    let session = common::session(&mc).await;
    let schema = Inventory::bundled().unwrap().build("employee_demo", &Variables::default()).unwrap();
    let prov = Provisioner::new(&session, 10, 0);
    prov.provision(&schema).await.unwrap();
    assert!(mc.bucket_names().contains(&"employees".to_string()));

    let dropped = prov.clean(&schema).await.unwrap();
    assert_eq!(dropped, vec!["employees".to_string()]);
    assert!(!mc.bucket_names().contains(&"employees".to_string()));

    let again = prov.clean(&schema).await.unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
async fn test_external_file_schema_binds_variables() {
    let dir = tempfile::tempdir().unwrap();
    let template = dir.path().join("order.json");
    std::fs::write(&template, r#"{"order_id": 0, "customer": "{{ rand_first }} {{ rand_last }}"}"#).unwrap();

    let mc = MemoryCluster::new();
    let ctx = common::context(&mc, 2).await;
    let vars = Variables {
        file: Some(template.to_string_lossy().into_owned()),
        id_field: Some("order_id".into()),
        bucket: Some("orders".into()),
    };
    let schema = Inventory::bundled().unwrap().build("external_file", &vars).unwrap();
    assert_eq!(schema.buckets[0].name, "orders");

    let report = load_from_inventory(&ctx, &schema, &options(5, 2)).await.unwrap();
    assert!(!report.failed());
    let ks = Keyspace::new("orders", "_default", "_default");
    assert_eq!(mc.doc_count(&ks), 5);
    let doc = mc.document(&ks, "orders:3").unwrap();
    assert_eq!(doc["order_id"], json!(3));
    assert!(doc["customer"].as_str().unwrap().contains(' '));
}
