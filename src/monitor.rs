use std::sync::Arc;

use crate::dal;
use crate::definition::TaskDefinition;
use crate::model::{TaskRow, TaskStatus};
use crate::scheduler::Scheduler;
use crate::util::jittered;

/// Periodically re-arms a single builtin looping task. One instance runs
/// per registered builtin definition.
pub(crate) struct Monitor {
    scheduler: Arc<Scheduler>,
    def: Arc<TaskDefinition>,
}

impl Monitor {
    pub(crate) fn new(scheduler: Arc<Scheduler>, def: Arc<TaskDefinition>) -> Self {
        Self { scheduler, def }
    }

    pub(crate) async fn run(self) {
        let cancellation = self.scheduler.cancellation().clone();
        let interval = self.def.loop_interval.expect("builtin definition carries loop_interval");

        loop {
            if cancellation.is_cancelled() {
                tracing::info!(task_key = %self.def.key, "monitor stopping");
                return;
            }

            if let Err(e) = self.tick().await {
                tracing::error!(task_key = %self.def.key, error = %e, "monitor tick failed");
            }

            tokio::select! {
                _ = cancellation.cancelled() => {
                    tracing::info!(task_key = %self.def.key, "monitor stopping");
                    return;
                }
                _ = tokio::time::sleep(jittered(interval)) => {}
            }
        }
    }

    async fn tick(&self) -> crate::error::TaskManagerResult<()> {
        let task_id = self.def.task_id.expect("builtin definition carries task_id");
        let table = self.scheduler.dal().table().to_string();
        let key = self.def.key.clone();
        let argument = self.def.argument.clone();
        let loop_interval = chrono::Duration::from_std(self.def.loop_interval.unwrap())
            .unwrap_or_else(|_| chrono::Duration::zero());
        let running_timeout = chrono::Duration::from_std(self.scheduler.options().running_timeout)
            .unwrap_or_else(|_| chrono::Duration::zero());

        self.scheduler
            .dal()
            .transaction(move |tx| {
                let existing = dal::get_with_tx(tx, &table, task_id)?;
                match existing {
                    None => {
                        let fresh = TaskRow::assembled(Some(task_id), key, None, argument);
                        dal::insert_with_tx(tx, &table, &fresh)?;
                    }
                    Some(row) => {
                        let age = chrono::Utc::now() - row.updated_at;
                        let should_rearm = match row.task_status {
                            TaskStatus::Succeeded | TaskStatus::Failed => age >= loop_interval,
                            TaskStatus::Running => age >= running_timeout,
                            TaskStatus::Initialized => false,
                        };
                        if should_rearm {
                            dal::update_status_with_tx(tx, &table, task_id, TaskStatus::Initialized)?;
                        }
                    }
                }
                Ok(())
            })
            .await
    }
}
