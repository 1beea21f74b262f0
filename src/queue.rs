// src/queue.rs
//
// Persistent FIFO-ish work queue of per-item fetch tasks. Claiming is a
// select-then-CAS: losers of a claim race simply get fewer tasks, which
// is expected and harmless.

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};

use crate::config::QueueCfg;
use crate::store::{QueueStore, StoreError};

#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskKey {
    pub tenant: String,
    pub item_id: String,
}

impl TaskKey {
    pub fn new(tenant: impl Into<String>, item_id: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            item_id: item_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Processing,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "queued" => Some(Self::Queued),
            "processing" => Some(Self::Processing),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueTask {
    pub key: TaskKey,
    pub status: TaskStatus,
    pub attempts: u32,
    pub priority: i32,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Doubles as the not-eligible-before timestamp: a task whose
    /// updated_at lies in the future is cooling down.
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Inserted,
    Requeued,
    /// Already queued/processing, inside the enqueue-cooldown window, or
    /// out of attempts.
    Skipped,
}

pub struct WorkQueue<S> {
    store: std::sync::Arc<S>,
    cfg: QueueCfg,
}

impl<S: QueueStore> WorkQueue<S> {
    pub fn new(store: std::sync::Arc<S>, cfg: QueueCfg) -> Self {
        Self { store, cfg }
    }

    pub fn max_attempts(&self) -> u32 {
        self.cfg.max_attempts
    }

    /// Idempotent insert-or-upsert into `Queued`. `eligible_at` pushes
    /// initial eligibility into the future (defaults to `now`).
    pub async fn enqueue(
        &self,
        tenant: &str,
        item_id: &str,
        priority: i32,
        eligible_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, StoreError> {
        let key = TaskKey::new(tenant, item_id);
        let eligible_at = eligible_at.unwrap_or(now);

        if let Some(existing) = self.store.get(&key).await? {
            if matches!(existing.status, TaskStatus::Queued | TaskStatus::Processing) {
                return Ok(EnqueueOutcome::Skipped);
            }
            let window = Duration::seconds(self.cfg.enqueue_cooldown_secs as i64);
            if now - existing.updated_at < window {
                return Ok(EnqueueOutcome::Skipped);
            }
            if existing.attempts >= self.cfg.max_attempts {
                return Ok(EnqueueOutcome::Skipped);
            }
            let mut task = existing;
            task.status = TaskStatus::Queued;
            task.priority = priority;
            task.updated_at = eligible_at;
            self.store.put(task).await?;
            counter!("queue_enqueued_total").increment(1);
            return Ok(EnqueueOutcome::Requeued);
        }

        self.store
            .put(QueueTask {
                key,
                status: TaskStatus::Queued,
                attempts: 0,
                priority,
                last_error: None,
                created_at: now,
                updated_at: eligible_at,
            })
            .await?;
        counter!("queue_enqueued_total").increment(1);
        Ok(EnqueueOutcome::Inserted)
    }

    /// Claim up to `limit` eligible tasks. Each selected task is
    /// transitioned with an atomic CAS; rows that lose the race are
    /// silently skipped.
    pub async fn claim_batch(
        &self,
        limit: usize,
        tenant: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueTask>, StoreError> {
        let candidates = self.store.select_eligible(limit, tenant, now).await?;
        let mut claimed = Vec::with_capacity(candidates.len());
        for task in candidates {
            match self.store.claim_if_queued(&task.key, now).await? {
                Some(t) => claimed.push(t),
                None => {
                    tracing::debug!(
                        tenant = %task.key.tenant,
                        item = %task.key.item_id,
                        "lost claim race, skipping"
                    );
                }
            }
        }
        counter!("queue_claimed_total").increment(claimed.len() as u64);
        Ok(claimed)
    }

    /// Success clears the error and the spent retry budget, so the next
    /// refresh cycle starts from a clean slate.
    pub async fn complete(&self, key: &TaskKey, now: DateTime<Utc>) -> Result<(), StoreError> {
        if let Some(mut task) = self.store.get(key).await? {
            task.status = TaskStatus::Done;
            task.attempts = 0;
            task.last_error = None;
            task.updated_at = now;
            self.store.put(task).await?;
            counter!("queue_done_total").increment(1);
        }
        Ok(())
    }

    /// Immediate retry while the attempt budget lasts, terminal `Failed`
    /// once it is spent.
    pub async fn retry_or_fail(
        &self,
        key: &TaskKey,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Some(mut task) = self.store.get(key).await? {
            if task.attempts < self.cfg.max_attempts {
                task.status = TaskStatus::Queued;
            } else {
                task.status = TaskStatus::Failed;
                counter!("queue_failed_total").increment(1);
            }
            task.last_error = Some(error.to_string());
            task.updated_at = now;
            self.store.put(task).await?;
        }
        Ok(())
    }

    /// Terminal failure with no retry, for errors retrying cannot fix
    /// (invalid item identifiers and the like).
    pub async fn fail(
        &self,
        key: &TaskKey,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Some(mut task) = self.store.get(key).await? {
            task.status = TaskStatus::Failed;
            task.last_error = Some(error.to_string());
            task.updated_at = now;
            self.store.put(task).await?;
            counter!("queue_failed_total").increment(1);
        }
        Ok(())
    }

    /// Return a task to `Queued` with eligibility pushed to `until`.
    /// `attempts_delta` refunds attempts when the failure was shared
    /// throttling rather than the task's own fault.
    pub async fn cooldown(
        &self,
        key: &TaskKey,
        until: DateTime<Utc>,
        attempts_delta: i32,
    ) -> Result<(), StoreError> {
        if let Some(mut task) = self.store.get(key).await? {
            task.status = TaskStatus::Queued;
            task.attempts = task.attempts.saturating_add_signed(attempts_delta);
            task.updated_at = until;
            self.store.put(task).await?;
            counter!("queue_cooldowns_total").increment(1);
        }
        Ok(())
    }

    /// Admin bulk operation: every `Failed` task (optionally scoped to a
    /// tenant) returns to `Queued` with a fresh attempt budget.
    pub async fn requeue_failed(
        &self,
        tenant: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let failed = self.store.list(Some(TaskStatus::Failed), tenant).await?;
        let count = failed.len();
        for mut task in failed {
            task.status = TaskStatus::Queued;
            task.attempts = 0;
            task.last_error = None;
            task.updated_at = now;
            self.store.put(task).await?;
        }
        if count > 0 {
            tracing::info!(count, "requeued failed tasks");
        }
        Ok(count)
    }
}
