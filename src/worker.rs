// src/worker.rs
//
// Ingestion run orchestration: pick queued tasks, group them by tenant,
// gate each vendor call on a rate-limiter lease, merge results into the
// canonical catalog, and write the next refresh horizon back. A TTL run
// lock keeps overlapping triggers from doubling vendor calls; everything
// else is per-task error containment.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use rand::Rng;
use serde::Serialize;

use crate::config::{LimiterCfg, QueueCfg, WorkerCfg};
use crate::dedupe::compute_dedupe_key;
use crate::freshness::{FreshnessPolicy, HotBoost};
use crate::merge::{merge, CanonicalProduct};
use crate::queue::{QueueTask, WorkQueue};
use crate::ratelimit::{LeaseError, LeaseParams, RateLimiter};
use crate::store::{CatalogStore, ControlStore, LimiterStore, QueueStore, StoreError};
use crate::vendor::{SourceRecord, VendorApi, VendorError};

/// Structured outcome of one ingestion run; the primary observability
/// surface for operators.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct RunSummary {
    pub taken: usize,
    pub done: usize,
    pub failed: usize,
}

pub struct IngestWorker<S> {
    store: Arc<S>,
    queue: WorkQueue<S>,
    limiter: RateLimiter<S>,
    vendor: Arc<dyn VendorApi>,
    policy: FreshnessPolicy,
    boost: Arc<dyn HotBoost>,
    lease_params: LeaseParams,
    cfg: WorkerCfg,
    claim_limit: usize,
    holder: String,
}

impl<S> IngestWorker<S>
where
    S: QueueStore + LimiterStore + ControlStore + CatalogStore,
{
    pub fn new(
        store: Arc<S>,
        queue_cfg: QueueCfg,
        limiter_cfg: LimiterCfg,
        worker_cfg: WorkerCfg,
        vendor: Arc<dyn VendorApi>,
        policy: FreshnessPolicy,
        boost: Arc<dyn HotBoost>,
    ) -> Self {
        Self {
            queue: WorkQueue::new(Arc::clone(&store), queue_cfg),
            limiter: RateLimiter::new(Arc::clone(&store)),
            store,
            vendor,
            policy,
            boost,
            lease_params: LeaseParams::from_cfg(&limiter_cfg),
            cfg: worker_cfg,
            claim_limit: queue_cfg.claim_limit,
            holder: format!("worker-{}", std::process::id()),
        }
    }

    pub fn queue(&self) -> &WorkQueue<S> {
        &self.queue
    }

    /// One full ingestion run. Returns a zero-work summary when a global
    /// cooldown is active or another run holds the lock; both are normal
    /// outcomes, not errors.
    pub async fn run_once(&self) -> anyhow::Result<RunSummary> {
        let now = Utc::now();
        counter!("ingest_runs_total").increment(1);

        if let Some(until) = self.store.global_cooldown_until().await? {
            if now < until {
                tracing::info!(until = %until, "global cooldown active, skipping run");
                return Ok(RunSummary::default());
            }
        }

        let ttl = Duration::seconds(self.cfg.run_lock_ttl_secs as i64);
        if !self.store.try_acquire_run_lock(&self.holder, ttl, now).await? {
            tracing::info!("another ingestion run holds the lock, skipping");
            return Ok(RunSummary::default());
        }

        let result = self.run_locked(now).await;
        self.store.release_run_lock(&self.holder).await?;

        match &result {
            Ok(summary) => {
                tracing::info!(
                    taken = summary.taken,
                    done = summary.done,
                    failed = summary.failed,
                    "ingestion run finished"
                );
                counter!("ingest_tasks_done_total").increment(summary.done as u64);
                counter!("ingest_tasks_failed_total").increment(summary.failed as u64);
            }
            Err(e) => tracing::error!(error = %e, "ingestion run aborted"),
        }
        result
    }

    async fn run_locked(&self, now: DateTime<Utc>) -> anyhow::Result<RunSummary> {
        let mut summary = RunSummary::default();
        let claimed = self
            .queue
            .claim_batch(self.claim_limit, self.cfg.focus_tenant.as_deref(), now)
            .await?;
        summary.taken = claimed.len();
        if claimed.is_empty() {
            return Ok(summary);
        }

        let mut by_tenant: BTreeMap<String, Vec<QueueTask>> = BTreeMap::new();
        for task in claimed {
            by_tenant.entry(task.key.tenant.clone()).or_default().push(task);
        }

        for (tenant, group) in by_tenant {
            self.process_tenant(&tenant, group, &mut summary).await?;
        }
        Ok(summary)
    }

    /// Process one tenant's claimed tasks in vendor-sized chunks, each
    /// gated by a limiter lease. Chunk-level failures apply uniformly to
    /// every task in the chunk; per-item failures never abort the batch.
    async fn process_tenant(
        &self,
        tenant: &str,
        group: Vec<QueueTask>,
        summary: &mut RunSummary,
    ) -> anyhow::Result<()> {
        let chunk_size = self.cfg.chunk_size.max(1);
        let chunks: Vec<&[QueueTask]> = group.chunks(chunk_size).collect();
        let total = chunks.len();

        for (ci, chunk) in chunks.iter().enumerate() {
            match self.limiter.lease(tenant, self.lease_params).await {
                Ok(()) => {}
                Err(LeaseError::DailyQuotaExhausted { retry_at }) => {
                    tracing::warn!(
                        tenant = %tenant,
                        retry_at = %retry_at,
                        "daily quota exhausted, parking remaining tasks"
                    );
                    // The stall is not the tasks' fault: refund the
                    // attempt the claim charged.
                    for task in chunks[ci..].iter().flat_map(|c| c.iter()) {
                        self.queue.cooldown(&task.key, retry_at, -1).await?;
                    }
                    return Ok(());
                }
                Err(LeaseError::Store(e)) => return Err(e.into()),
            }

            let ids: Vec<String> = chunk.iter().map(|t| t.key.item_id.clone()).collect();
            let now = Utc::now();
            match self.vendor.fetch_items(tenant, &ids).await {
                Ok(records) => {
                    for task in chunk.iter() {
                        self.settle_item(task, &records, now, summary).await?;
                    }
                }
                Err(VendorError::Throttled) => {
                    counter!("vendor_throttled_total").increment(1);
                    let until = now + Duration::seconds(self.cfg.task_cooldown_secs as i64);
                    tracing::warn!(
                        tenant = %tenant,
                        until = %until,
                        "vendor throttled, cooling group and setting global cooldown"
                    );
                    for task in chunks[ci..].iter().flat_map(|c| c.iter()) {
                        self.queue.cooldown(&task.key, until, -1).await?;
                    }
                    let global_until =
                        now + Duration::seconds(self.cfg.global_cooldown_secs as i64);
                    self.store.extend_global_cooldown(global_until).await?;
                    return Ok(());
                }
                Err(VendorError::Transient(msg)) => {
                    for task in chunk.iter() {
                        self.queue.retry_or_fail(&task.key, &msg, now).await?;
                        summary.failed += 1;
                    }
                }
                Err(VendorError::Permanent(msg)) => {
                    for task in chunk.iter() {
                        self.queue.fail(&task.key, &msg, now).await?;
                        summary.failed += 1;
                    }
                }
            }

            if ci + 1 < total && self.cfg.chunk_delay_ms > 0 {
                let jitter: f64 = rand::rng().random_range(0.5..1.5);
                let delay_ms = (self.cfg.chunk_delay_ms as f64 * jitter) as u64;
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            }
        }
        Ok(())
    }

    async fn settle_item(
        &self,
        task: &QueueTask,
        records: &std::collections::HashMap<String, SourceRecord>,
        now: DateTime<Utc>,
        summary: &mut RunSummary,
    ) -> Result<(), StoreError> {
        match records.get(&task.key.item_id) {
            None => {
                self.queue
                    .fail(&task.key, "item not returned by vendor", now)
                    .await?;
                summary.failed += 1;
            }
            Some(rec) => match self.merge_record(&task.key, rec, now).await {
                Ok(()) => {
                    self.queue.complete(&task.key, now).await?;
                    summary.done += 1;
                }
                Err(e) => {
                    self.queue
                        .retry_or_fail(&task.key, &e.to_string(), now)
                        .await?;
                    summary.failed += 1;
                }
            },
        }
        Ok(())
    }

    /// Merge one vendor record into the canonical catalog and stamp the
    /// next refresh horizon from the freshness policy.
    async fn merge_record(
        &self,
        key: &crate::queue::TaskKey,
        rec: &SourceRecord,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let dedupe_key = compute_dedupe_key(rec);
        let mut product = match self.store.get_product(&dedupe_key).await? {
            Some(existing) => merge(existing, rec, now),
            None => CanonicalProduct::from_record(&dedupe_key, rec, now),
        };
        // Latest successful fetch wins the requeue identity.
        product.tenant = key.tenant.clone();
        product.item_id = key.item_id.clone();
        let tier = self
            .policy
            .classify(product.views, product.pinned, self.boost.matches(&product));
        product.fresh_until = Some(self.policy.next_eligible(tier, now));
        self.store.upsert_product(product).await?;
        counter!("catalog_merges_total").increment(1);
        Ok(())
    }
}
