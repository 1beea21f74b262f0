// src/scheduler.rs
//
// Background loops: the staleness scan that feeds the work queue from
// catalog state, the ingestion tick, and the housekeeping sweep.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, gauge};
use tokio::task::JoinHandle;

use crate::config::{QueueCfg, SchedulerCfg};
use crate::housekeeping::Housekeeper;
use crate::queue::{EnqueueOutcome, WorkQueue};
use crate::store::{CatalogStore, ControlStore, QueueStore};
use crate::worker::IngestWorker;

/// One staleness scan: enqueue a fetch task for each stale product,
/// bounded by `limit`. Returns the number of tasks actually enqueued.
pub async fn scan_once<S>(
    store: &S,
    queue: &WorkQueue<S>,
    limit: usize,
    now: chrono::DateTime<Utc>,
) -> usize
where
    S: CatalogStore + QueueStore,
{
    let stale = match store.scan_stale(limit, now).await {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "staleness scan failed");
            return 0;
        }
    };

    let mut enqueued = 0usize;
    for product in &stale {
        if product.tenant.is_empty() || product.item_id.is_empty() {
            continue;
        }
        match queue
            .enqueue(&product.tenant, &product.item_id, 0, None, now)
            .await
        {
            Ok(EnqueueOutcome::Inserted | EnqueueOutcome::Requeued) => enqueued += 1,
            Ok(EnqueueOutcome::Skipped) => {}
            Err(e) => tracing::warn!(error = %e, "enqueue during scan failed"),
        }
    }

    counter!("refresh_scans_total").increment(1);
    gauge!("refresh_last_scan_ts").set(now.timestamp() as f64);
    if let Ok(queued) = store.list(Some(crate::queue::TaskStatus::Queued), None).await {
        gauge!("queue_queued").set(queued.len() as f64);
    }
    tracing::info!(
        target: "scheduler",
        stale = stale.len(),
        enqueued,
        "staleness scan tick"
    );
    enqueued
}

/// Periodically scan the catalog for stale products and enqueue a fetch
/// task for each, bounded per run. This is the only place the queue is
/// fed from catalog state rather than external discovery.
pub fn spawn_refresh_scheduler<S>(
    store: Arc<S>,
    queue_cfg: QueueCfg,
    cfg: SchedulerCfg,
) -> JoinHandle<()>
where
    S: CatalogStore + QueueStore + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let queue = WorkQueue::new(Arc::clone(&store), queue_cfg);
        let mut ticker = tokio::time::interval(Duration::from_secs(cfg.scan_interval_secs));
        loop {
            ticker.tick().await;
            scan_once(store.as_ref(), &queue, cfg.scan_limit, Utc::now()).await;
        }
    })
}

/// Periodically run the ingestion worker under an overall timeout. A
/// timed-out run simply stops mid-batch; the housekeeping TTL sweep
/// reclaims whatever it left in Processing.
pub fn spawn_ingest_scheduler<S>(
    worker: Arc<IngestWorker<S>>,
    interval_secs: u64,
    run_timeout_secs: u64,
) -> JoinHandle<()>
where
    S: QueueStore
        + crate::store::LimiterStore
        + ControlStore
        + CatalogStore
        + Send
        + Sync
        + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        loop {
            ticker.tick().await;
            match tokio::time::timeout(Duration::from_secs(run_timeout_secs), worker.run_once())
                .await
            {
                Ok(Ok(_summary)) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "ingestion tick failed"),
                Err(_) => {
                    counter!("ingest_run_timeouts_total").increment(1);
                    tracing::warn!("ingestion run timed out; stuck tasks will be reclaimed");
                }
            }
        }
    })
}

/// Periodic housekeeping sweep.
pub fn spawn_housekeeping<S>(housekeeper: Arc<Housekeeper<S>>, interval_secs: u64) -> JoinHandle<()>
where
    S: QueueStore + ControlStore + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        loop {
            ticker.tick().await;
            if let Err(e) = housekeeper.sweep(Utc::now()).await {
                tracing::warn!(error = %e, "housekeeping sweep failed");
            }
        }
    })
}
