// src/store.rs
//
// The small transactional-store surface the scheduling subsystem is
// written against. Every trait method is a single atomic transaction:
// concurrent callers never observe a half-applied claim, lease, or lock.
// `MemStore` realizes that contract with mutex-guarded maps; any store
// with compare-and-swap or serializable transactions can stand in.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::merge::CanonicalProduct;
use crate::queue::{QueueTask, TaskKey, TaskStatus};
use crate::ratelimit::{LeaseStep, LimiterState};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Persistent queue of per-item fetch tasks.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn get(&self, key: &TaskKey) -> Result<Option<QueueTask>, StoreError>;

    async fn put(&self, task: QueueTask) -> Result<(), StoreError>;

    /// Atomic claim: if the task is currently `Queued`, transition it to
    /// `Processing`, increment `attempts`, stamp `updated_at = now`, and
    /// return the claimed row. Returns `None` when the task is absent or
    /// no longer `Queued` (a lost race, not an error).
    async fn claim_if_queued(
        &self,
        key: &TaskKey,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueTask>, StoreError>;

    /// Tasks with `status == Queued` and `updated_at <= now`, ordered by
    /// `(updated_at asc, priority asc, attempts asc)`, capped at `limit`.
    async fn select_eligible(
        &self,
        limit: usize,
        tenant: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueTask>, StoreError>;

    async fn list(
        &self,
        status: Option<TaskStatus>,
        tenant: Option<&str>,
    ) -> Result<Vec<QueueTask>, StoreError>;
}

/// Per-key rate limiter state with atomic read-modify-write.
#[async_trait]
pub trait LimiterStore: Send + Sync {
    /// Run `step` against the limiter state for `key` (initialized from
    /// `init` on first use) inside one transaction. Whatever the closure
    /// leaves in the state is persisted together with its decision.
    async fn with_limiter(
        &self,
        key: &str,
        init: LimiterState,
        step: &mut (dyn for<'a> FnMut(&'a mut LimiterState) -> LeaseStep + Send),
    ) -> Result<LeaseStep, StoreError>;

    async fn read_limiter(&self, key: &str) -> Result<Option<LimiterState>, StoreError>;
}

/// Cross-run coordination: global cooldown and the single-run mutex.
#[async_trait]
pub trait ControlStore: Send + Sync {
    async fn global_cooldown_until(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Extends monotonically: the stored value only moves forward.
    async fn extend_global_cooldown(&self, until: DateTime<Utc>) -> Result<(), StoreError>;

    async fn clear_global_cooldown(&self) -> Result<(), StoreError>;

    /// TTL lease for the single active ingestion run. Succeeds when the
    /// lock is free, expired, or already held by `holder`.
    async fn try_acquire_run_lock(
        &self,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn release_run_lock(&self, holder: &str) -> Result<(), StoreError>;
}

/// Canonical product documents keyed by dedupe key.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn get_product(&self, dedupe_key: &str)
        -> Result<Option<CanonicalProduct>, StoreError>;

    async fn upsert_product(&self, product: CanonicalProduct) -> Result<(), StoreError>;

    /// Stale products ordered by (fresh_until asc with unset first,
    /// updated_at asc), capped at `limit`.
    async fn scan_stale(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<CanonicalProduct>, StoreError>;

    async fn count_products(&self) -> Result<usize, StoreError>;
}

#[derive(Debug, Clone)]
struct RunLock {
    holder: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct ControlState {
    cooldown_until: Option<DateTime<Utc>>,
    run_lock: Option<RunLock>,
}

/// In-memory implementation of all four store traits. Each method takes
/// one lock for its whole critical section, which is exactly the
/// atomicity the traits promise.
#[derive(Default)]
pub struct MemStore {
    tasks: Mutex<HashMap<TaskKey, QueueTask>>,
    limiters: Mutex<HashMap<String, LimiterState>>,
    control: Mutex<ControlState>,
    products: Mutex<HashMap<String, CanonicalProduct>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for MemStore {
    async fn get(&self, key: &TaskKey) -> Result<Option<QueueTask>, StoreError> {
        Ok(self.tasks.lock().await.get(key).cloned())
    }

    async fn put(&self, task: QueueTask) -> Result<(), StoreError> {
        self.tasks.lock().await.insert(task.key.clone(), task);
        Ok(())
    }

    async fn claim_if_queued(
        &self,
        key: &TaskKey,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueTask>, StoreError> {
        let mut tasks = self.tasks.lock().await;
        match tasks.get_mut(key) {
            Some(t) if t.status == TaskStatus::Queued => {
                t.status = TaskStatus::Processing;
                t.attempts += 1;
                t.updated_at = now;
                Ok(Some(t.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn select_eligible(
        &self,
        limit: usize,
        tenant: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueTask>, StoreError> {
        let tasks = self.tasks.lock().await;
        let mut eligible: Vec<QueueTask> = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Queued && t.updated_at <= now)
            .filter(|t| tenant.map_or(true, |f| t.key.tenant == f))
            .cloned()
            .collect();
        eligible.sort_by(|a, b| {
            (a.updated_at, a.priority, a.attempts).cmp(&(b.updated_at, b.priority, b.attempts))
        });
        eligible.truncate(limit);
        Ok(eligible)
    }

    async fn list(
        &self,
        status: Option<TaskStatus>,
        tenant: Option<&str>,
    ) -> Result<Vec<QueueTask>, StoreError> {
        let tasks = self.tasks.lock().await;
        let mut out: Vec<QueueTask> = tasks
            .values()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .filter(|t| tenant.map_or(true, |f| t.key.tenant == f))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        Ok(out)
    }
}

#[async_trait]
impl LimiterStore for MemStore {
    async fn with_limiter(
        &self,
        key: &str,
        init: LimiterState,
        step: &mut (dyn for<'a> FnMut(&'a mut LimiterState) -> LeaseStep + Send),
    ) -> Result<LeaseStep, StoreError> {
        let mut limiters = self.limiters.lock().await;
        let state = limiters.entry(key.to_string()).or_insert(init);
        Ok(step(state))
    }

    async fn read_limiter(&self, key: &str) -> Result<Option<LimiterState>, StoreError> {
        Ok(self.limiters.lock().await.get(key).cloned())
    }
}

#[async_trait]
impl ControlStore for MemStore {
    async fn global_cooldown_until(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.control.lock().await.cooldown_until)
    }

    async fn extend_global_cooldown(&self, until: DateTime<Utc>) -> Result<(), StoreError> {
        let mut control = self.control.lock().await;
        control.cooldown_until = Some(match control.cooldown_until {
            Some(cur) if cur > until => cur,
            _ => until,
        });
        Ok(())
    }

    async fn clear_global_cooldown(&self) -> Result<(), StoreError> {
        self.control.lock().await.cooldown_until = None;
        Ok(())
    }

    async fn try_acquire_run_lock(
        &self,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut control = self.control.lock().await;
        let free = match &control.run_lock {
            None => true,
            Some(lock) => lock.expires_at <= now || lock.holder == holder,
        };
        if free {
            control.run_lock = Some(RunLock {
                holder: holder.to_string(),
                expires_at: now + ttl,
            });
        }
        Ok(free)
    }

    async fn release_run_lock(&self, holder: &str) -> Result<(), StoreError> {
        let mut control = self.control.lock().await;
        if control
            .run_lock
            .as_ref()
            .is_some_and(|lock| lock.holder == holder)
        {
            control.run_lock = None;
        }
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for MemStore {
    async fn get_product(
        &self,
        dedupe_key: &str,
    ) -> Result<Option<CanonicalProduct>, StoreError> {
        Ok(self.products.lock().await.get(dedupe_key).cloned())
    }

    async fn upsert_product(&self, product: CanonicalProduct) -> Result<(), StoreError> {
        self.products
            .lock()
            .await
            .insert(product.dedupe_key.clone(), product);
        Ok(())
    }

    async fn scan_stale(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<CanonicalProduct>, StoreError> {
        let products = self.products.lock().await;
        let mut stale: Vec<CanonicalProduct> = products
            .values()
            .filter(|p| crate::freshness::FreshnessPolicy::is_stale(p.fresh_until, now))
            .cloned()
            .collect();
        // Option sorts None first, which is the "never fetched" bucket.
        stale.sort_by_key(|p| (p.fresh_until, p.updated_at));
        stale.truncate(limit);
        Ok(stale)
    }

    async fn count_products(&self) -> Result<usize, StoreError> {
        Ok(self.products.lock().await.len())
    }
}
