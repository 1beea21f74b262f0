// src/housekeeping.rs
//
// Reclaims work a crashed or timed-out worker left behind. Tasks stuck in
// Processing past the TTL return to Queued with the aborted attempt
// refunded; Queued tasks that already spent their budget move to Failed.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use serde::Serialize;

use crate::config::{HousekeepingCfg, QueueCfg};
use crate::queue::TaskStatus;
use crate::store::{ControlStore, QueueStore, StoreError};

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct SweepReport {
    /// Stuck Processing tasks returned to Queued.
    pub reclaimed: usize,
    /// Queued tasks moved to Failed for exceeding max attempts.
    pub failed: usize,
}

pub struct Housekeeper<S> {
    store: Arc<S>,
    cfg: HousekeepingCfg,
    max_attempts: u32,
}

impl<S> Housekeeper<S>
where
    S: QueueStore + ControlStore,
{
    pub fn new(store: Arc<S>, cfg: HousekeepingCfg, queue_cfg: QueueCfg) -> Self {
        Self {
            store,
            cfg,
            max_attempts: queue_cfg.max_attempts,
        }
    }

    /// One sweep at `now`. Safe to run concurrently with ingestion: a
    /// task younger than the TTL is never touched, and the attempt
    /// refund compensates exactly one aborted claim.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let ttl = Duration::seconds(self.cfg.processing_ttl_secs as i64);
        let mut report = SweepReport::default();

        for mut task in self.store.list(Some(TaskStatus::Processing), None).await? {
            if now - task.updated_at <= ttl {
                continue;
            }
            tracing::warn!(
                tenant = %task.key.tenant,
                item = %task.key.item_id,
                attempts = task.attempts,
                "reclaiming task stuck in processing"
            );
            task.status = TaskStatus::Queued;
            task.attempts = task.attempts.saturating_sub(1);
            task.updated_at = now;
            self.store.put(task).await?;
            report.reclaimed += 1;
        }

        for mut task in self.store.list(Some(TaskStatus::Queued), None).await? {
            if task.attempts < self.max_attempts {
                continue;
            }
            task.status = TaskStatus::Failed;
            task.last_error
                .get_or_insert_with(|| "max attempts exceeded".to_string());
            task.updated_at = now;
            self.store.put(task).await?;
            report.failed += 1;
        }

        if report.reclaimed > 0 || report.failed > 0 {
            counter!("housekeeping_reclaimed_total").increment(report.reclaimed as u64);
            counter!("housekeeping_failed_total").increment(report.failed as u64);
            tracing::info!(
                reclaimed = report.reclaimed,
                failed = report.failed,
                "housekeeping sweep finished"
            );
        }
        Ok(report)
    }

    /// Manual operator escape hatch for a lingering global cooldown.
    pub async fn clear_global_cooldown(&self) -> Result<(), StoreError> {
        self.store.clear_global_cooldown().await?;
        tracing::info!("global cooldown cleared");
        Ok(())
    }
}
