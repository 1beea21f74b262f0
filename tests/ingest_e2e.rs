// tests/ingest_e2e.rs
//
// End-to-end ingestion runs against a scripted vendor: happy path,
// throttling, transient failures, and missing items.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::Mutex;

use catalog_ingestor::config::AppConfig;
use catalog_ingestor::queue::{TaskKey, TaskStatus};
use catalog_ingestor::store::{CatalogStore, ControlStore, QueueStore};
use catalog_ingestor::vendor::{SourceRecord, VendorApi, VendorError};
use catalog_ingestor::{api, AppState, MemStore};

#[derive(Clone, Copy)]
enum Script {
    Serve,
    Throttle,
    Transient,
}

struct FakeVendor {
    records: HashMap<String, SourceRecord>,
    script: Mutex<Script>,
}

impl FakeVendor {
    fn serving(records: Vec<(&str, SourceRecord)>) -> Arc<Self> {
        Arc::new(Self {
            records: records
                .into_iter()
                .map(|(id, r)| (id.to_string(), r))
                .collect(),
            script: Mutex::new(Script::Serve),
        })
    }

    async fn set_script(&self, script: Script) {
        *self.script.lock().await = script;
    }
}

#[async_trait]
impl VendorApi for FakeVendor {
    async fn fetch_items(
        &self,
        _tenant: &str,
        ids: &[String],
    ) -> Result<HashMap<String, SourceRecord>, VendorError> {
        match *self.script.lock().await {
            Script::Throttle => Err(VendorError::Throttled),
            Script::Transient => Err(VendorError::Transient("upstream 503".into())),
            Script::Serve => Ok(ids
                .iter()
                .filter_map(|id| self.records.get(id).map(|r| (id.clone(), r.clone())))
                .collect()),
        }
    }
}

fn rec(source: &str, vendor_id: &str, price: i64) -> SourceRecord {
    SourceRecord {
        source: source.into(),
        vendor_id: Some(vendor_id.into()),
        title: format!("Item {vendor_id}"),
        price,
        currency: "JPY".into(),
        url: format!("https://{source}.example/{vendor_id}"),
        ..Default::default()
    }
}

fn test_cfg() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.worker.chunk_delay_ms = 0;
    cfg.worker.chunk_size = 2;
    cfg.limiter.tps = 1000.0;
    cfg.limiter.burst = 1000.0;
    cfg
}

fn build(vendor: Arc<FakeVendor>) -> AppState<MemStore> {
    let (_router, state) = api::create_app(&test_cfg(), vendor);
    state
}

#[tokio::test]
async fn successful_run_merges_and_completes() {
    let vendor = FakeVendor::serving(vec![
        ("i1", rec("amazon", "i1", 2000)),
        ("i2", rec("amazon", "i2", 3000)),
    ]);
    let state = build(Arc::clone(&vendor));
    let now = Utc::now();

    state.queue.enqueue("jp", "i1", 0, None, now).await.unwrap();
    state.queue.enqueue("jp", "i2", 0, None, now).await.unwrap();

    let summary = state.worker.run_once().await.unwrap();
    assert_eq!(summary.taken, 2);
    assert_eq!(summary.done, 2);
    assert_eq!(summary.failed, 0);

    let done = state.store.list(Some(TaskStatus::Done), None).await.unwrap();
    assert_eq!(done.len(), 2);

    // catalog holds both products with a refresh horizon set
    assert_eq!(state.store.count_products().await.unwrap(), 2);
    let p = state.store.get_product("id:i1").await.unwrap().unwrap();
    assert_eq!(p.price, 2000);
    assert_eq!(p.tenant, "jp");
    assert_eq!(p.item_id, "i1");
    assert!(p.fresh_until.is_some());
    assert!(p.fresh_until.unwrap() > now);
}

#[tokio::test]
async fn throttled_chunk_cools_group_and_sets_global_cooldown() {
    let vendor = FakeVendor::serving(vec![("i1", rec("amazon", "i1", 2000))]);
    vendor.set_script(Script::Throttle).await;
    let state = build(Arc::clone(&vendor));
    let now = Utc::now();

    state.queue.enqueue("jp", "i1", 0, None, now).await.unwrap();
    state.queue.enqueue("jp", "i2", 0, None, now).await.unwrap();

    let summary = state.worker.run_once().await.unwrap();
    assert_eq!(summary.taken, 2);
    assert_eq!(summary.done, 0);

    // every task in the group is back in queued with eligibility pushed
    // forward and the claim's attempt refunded
    for id in ["i1", "i2"] {
        let task = QueueStore::get(state.store.as_ref(), &TaskKey::new("jp", id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.attempts, 0, "throttling must not spend the retry budget");
        assert!(task.updated_at >= now + Duration::minutes(25));
    }

    let until = state.store.global_cooldown_until().await.unwrap();
    assert!(until.is_some_and(|u| u >= now + Duration::minutes(10)));

    // a second run during the cooldown does no work at all
    let second = state.worker.run_once().await.unwrap();
    assert_eq!(second.taken, 0);
}

#[tokio::test]
async fn transient_chunk_failure_requeues_and_spends_an_attempt() {
    let vendor = FakeVendor::serving(vec![("i1", rec("amazon", "i1", 2000))]);
    vendor.set_script(Script::Transient).await;
    let state = build(Arc::clone(&vendor));
    let now = Utc::now();

    state.queue.enqueue("jp", "i1", 0, None, now).await.unwrap();
    let summary = state.worker.run_once().await.unwrap();
    assert_eq!(summary.taken, 1);
    assert_eq!(summary.failed, 1);

    let task = QueueStore::get(state.store.as_ref(), &TaskKey::new("jp", "i1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, TaskStatus::Queued, "still has retry budget");
    assert_eq!(task.attempts, 1);
    assert_eq!(task.last_error.as_deref(), Some("upstream 503"));

    // once the vendor recovers the task completes on the next run
    vendor.set_script(Script::Serve).await;
    let second = state.worker.run_once().await.unwrap();
    assert_eq!(second.done, 1);
}

#[tokio::test]
async fn item_missing_from_vendor_response_fails_permanently() {
    let vendor = FakeVendor::serving(vec![("i1", rec("amazon", "i1", 2000))]);
    let state = build(Arc::clone(&vendor));
    let now = Utc::now();

    state.queue.enqueue("jp", "i1", 0, None, now).await.unwrap();
    state.queue.enqueue("jp", "ghost", 0, None, now).await.unwrap();

    let summary = state.worker.run_once().await.unwrap();
    assert_eq!(summary.done, 1);
    assert_eq!(summary.failed, 1);

    let ghost = QueueStore::get(state.store.as_ref(), &TaskKey::new("jp", "ghost"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ghost.status, TaskStatus::Failed);
    assert_eq!(
        ghost.last_error.as_deref(),
        Some("item not returned by vendor")
    );
}

#[tokio::test]
async fn repeated_fetches_do_not_duplicate_offers_or_history() {
    let vendor = FakeVendor::serving(vec![("i1", rec("amazon", "i1", 2000))]);
    let state = build(Arc::clone(&vendor));

    for _ in 0..3 {
        let now = Utc::now();
        state.queue.enqueue("jp", "i1", 0, None, now).await.unwrap();
        state.worker.run_once().await.unwrap();
        // force the task back for the next round (the enqueue cooldown
        // window would otherwise skip it)
        if let Some(mut t) = QueueStore::get(state.store.as_ref(), &TaskKey::new("jp", "i1"))
            .await
            .unwrap()
        {
            t.status = TaskStatus::Queued;
            t.updated_at = Utc::now();
            state.store.put(t).await.unwrap();
        }
    }

    let p = state.store.get_product("id:i1").await.unwrap().unwrap();
    assert_eq!(p.offers.len(), 1);
    assert_eq!(p.price_history.len(), 1, "same price never re-appends");
}
