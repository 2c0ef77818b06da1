use std::sync::Arc;

use chrono::Duration as ChronoDuration;

use crate::model::TaskStatus;
use crate::scheduler::Scheduler;
use crate::util::jittered;

/// Background claimer of orphaned `initialized` rows. One instance runs
/// per manager.
pub(crate) struct Scanner {
    scheduler: Arc<Scheduler>,
}

impl Scanner {
    pub(crate) fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }

    pub(crate) async fn run(self) {
        let cancellation = self.scheduler.cancellation().clone();
        loop {
            if cancellation.is_cancelled() {
                tracing::info!("scanner stopping");
                return;
            }

            let instant = self.pass().await;

            let base = if instant {
                self.scheduler.options().instant_scan_interval
            } else {
                self.scheduler.options().scan_interval
            };
            tokio::select! {
                _ = cancellation.cancelled() => {
                    tracing::info!("scanner stopping");
                    return;
                }
                _ = tokio::time::sleep(jittered(base)) => {}
            }
        }
    }

    /// Returns `true` if the next sleep should use the short instant-scan
    /// interval (a row was claimed and there is still spare capacity).
    async fn pass(&self) -> bool {
        if !self.scheduler.can_schedule() {
            return false;
        }

        match self.claim_one().await {
            Ok(Some(row)) => {
                tracing::debug!(task_id = row.id, task_key = %row.task_key, "scanner claimed row");
                self.scheduler.clone().schedule_row(row).await;
                self.scheduler.can_schedule()
            }
            Ok(None) => false,
            Err(e) => {
                tracing::error!(error = %e, "scanner pass failed");
                false
            }
        }
    }

    async fn claim_one(&self) -> crate::error::TaskManagerResult<Option<crate::model::TaskRow>> {
        let registry = self.scheduler.registry();
        let sensitive = registry.keys_by_sensitivity(true);
        let insensitive = registry.keys_by_sensitivity(false);
        let initialized_timeout =
            ChronoDuration::from_std(self.scheduler.options().initialized_timeout)
                .unwrap_or(ChronoDuration::zero());

        let candidate = self
            .scheduler
            .dal()
            .claim_candidate(&sensitive, &insensitive, initialized_timeout)
            .await?;

        let Some(mut row) = candidate else {
            return Ok(None);
        };

        let updated = self
            .scheduler
            .dal()
            .update_status_if(row.id, TaskStatus::Initialized, TaskStatus::Running)
            .await?;

        if updated == 0 {
            // Another instance already claimed this row between our SELECT
            // and our UPDATE; not an error, just a lost race.
            return Ok(None);
        }

        row.task_status = TaskStatus::Running;
        Ok(Some(row))
    }
}

