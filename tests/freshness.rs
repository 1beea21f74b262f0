// tests/freshness.rs
//
// The staleness scan: catalog state feeding the work queue, ordering,
// and the per-run bound.

use std::sync::Arc;

use chrono::{Duration, Utc};

use catalog_ingestor::config::QueueCfg;
use catalog_ingestor::merge::CanonicalProduct;
use catalog_ingestor::queue::{TaskStatus, WorkQueue};
use catalog_ingestor::scheduler::scan_once;
use catalog_ingestor::store::{CatalogStore, MemStore, QueueStore};
use catalog_ingestor::vendor::SourceRecord;

fn product(item_id: &str, fresh_until: Option<chrono::DateTime<Utc>>) -> CanonicalProduct {
    let rec = SourceRecord {
        source: "amazon".into(),
        vendor_id: Some(item_id.into()),
        title: format!("Item {item_id}"),
        price: 1000,
        url: "https://amazon.example/x".into(),
        ..Default::default()
    };
    let mut p = CanonicalProduct::from_record(&format!("id:{item_id}"), &rec, Utc::now());
    p.tenant = "jp".into();
    p.item_id = item_id.into();
    p.fresh_until = fresh_until;
    p
}

#[tokio::test]
async fn stale_products_are_enqueued_fresh_ones_are_not() {
    let store = Arc::new(MemStore::new());
    let queue = WorkQueue::new(Arc::clone(&store), QueueCfg::default());
    let now = Utc::now();

    store.upsert_product(product("never-fetched", None)).await.unwrap();
    store
        .upsert_product(product("expired", Some(now - Duration::hours(1))))
        .await
        .unwrap();
    store
        .upsert_product(product("fresh", Some(now + Duration::hours(1))))
        .await
        .unwrap();

    let enqueued = scan_once(store.as_ref(), &queue, 100, now).await;
    assert_eq!(enqueued, 2);

    let queued = store.list(Some(TaskStatus::Queued), None).await.unwrap();
    let ids: Vec<&str> = queued.iter().map(|t| t.key.item_id.as_str()).collect();
    assert!(ids.contains(&"never-fetched"));
    assert!(ids.contains(&"expired"));
    assert!(!ids.contains(&"fresh"));
}

#[tokio::test]
async fn scan_respects_the_per_run_limit() {
    let store = Arc::new(MemStore::new());
    let queue = WorkQueue::new(Arc::clone(&store), QueueCfg::default());
    let now = Utc::now();

    for i in 0..10 {
        store
            .upsert_product(product(&format!("item-{i}"), None))
            .await
            .unwrap();
    }

    let enqueued = scan_once(store.as_ref(), &queue, 3, now).await;
    assert_eq!(enqueued, 3);
    assert_eq!(store.list(None, None).await.unwrap().len(), 3);
}

#[tokio::test]
async fn rescanning_does_not_duplicate_queued_tasks() {
    let store = Arc::new(MemStore::new());
    let queue = WorkQueue::new(Arc::clone(&store), QueueCfg::default());
    let now = Utc::now();

    store.upsert_product(product("x", None)).await.unwrap();
    assert_eq!(scan_once(store.as_ref(), &queue, 10, now).await, 1);
    assert_eq!(scan_once(store.as_ref(), &queue, 10, now).await, 0);
    assert_eq!(store.list(None, None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn products_without_fetch_identity_are_skipped() {
    let store = Arc::new(MemStore::new());
    let queue = WorkQueue::new(Arc::clone(&store), QueueCfg::default());
    let now = Utc::now();

    let mut orphan = product("x", None);
    orphan.tenant = String::new();
    orphan.item_id = String::new();
    store.upsert_product(orphan).await.unwrap();

    assert_eq!(scan_once(store.as_ref(), &queue, 10, now).await, 0);
    assert!(store.list(None, None).await.unwrap().is_empty());
}
