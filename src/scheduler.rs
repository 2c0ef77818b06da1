use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::config::ManagerOptions;
use crate::context::TaskContext;
use crate::dal::{self, SharedDal};
use crate::definition::TaskDefinition;
use crate::error::TaskManagerResult;
use crate::model::{TaskKey, TaskRow, TaskStatus};
use crate::pool::Pool;
use crate::registry::Registry;
use crate::util::run_guarded;

/// Rows assembled inside a managed transaction, awaiting scheduling once
/// the transaction commits.
#[derive(Default)]
pub(crate) struct PendingSet {
    rows: Vec<TaskRow>,
}

/// Handed to the user's closure inside [`Scheduler::transaction`]. Carries
/// both the live `rusqlite::Transaction` and the pending-publication set,
/// threaded explicitly since there's no ambient per-connection key-value bag
/// to stash it in.
pub struct TransactionHandle<'conn> {
    pub(crate) tx: &'conn rusqlite::Transaction<'conn>,
    pub(crate) pending: PendingSet,
}

pub struct Scheduler {
    dal: SharedDal,
    registry: Arc<Registry>,
    pool: Pool,
    options: ManagerOptions,
    running: DashMap<i64, ()>,
    stop_once: OnceCell<()>,
}

impl Scheduler {
    pub(crate) fn new(dal: SharedDal, registry: Arc<Registry>, options: ManagerOptions) -> Arc<Self> {
        let pool = Pool::new(options.pool_size);
        Arc::new(Self {
            dal,
            registry,
            pool,
            options,
            running: DashMap::new(),
            stop_once: OnceCell::new(),
        })
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.options.cancellation
    }

    pub(crate) fn can_schedule(&self) -> bool {
        self.pool.has_capacity()
    }

    fn assemble_row(
        &self,
        id: Option<i64>,
        task_key: &TaskKey,
        def: &TaskDefinition,
        ctx: &TaskContext,
        argument_bytes: Option<Vec<u8>>,
    ) -> TaskManagerResult<TaskRow> {
        crate::assembler::assemble(
            id,
            task_key.clone(),
            def,
            ctx,
            argument_bytes,
            self.options.context_marshaler.as_ref(),
        )
    }

    /// `run(ctx, key, arg)`: convenience wrapper around a one-shot managed
    /// transaction.
    pub(crate) async fn run<A: serde::Serialize>(
        self: &Arc<Self>,
        ctx: TaskContext,
        key: &str,
        arg: A,
    ) -> TaskManagerResult<()> {
        let argument_bytes = Some(serde_json::to_vec(&arg)?);
        let key = key.to_string();
        let this = self.clone();
        self.transaction(move |handle| this.run_with_tx(handle, ctx, &key, argument_bytes))
            .await
    }

    /// Runs `f` inside a `BEGIN IMMEDIATE` transaction carrying a fresh
    /// pending set; on commit, schedules everything the closure queued.
    pub(crate) async fn transaction<Fun>(self: &Arc<Self>, f: Fun) -> TaskManagerResult<()>
    where
        Fun: FnOnce(&mut TransactionHandle<'_>) -> TaskManagerResult<()>,
    {
        let rows = self
            .dal
            .transaction(|tx| {
                let mut handle = TransactionHandle {
                    tx,
                    pending: PendingSet::default(),
                };
                f(&mut handle)?;
                Ok(handle.pending.rows)
            })
            .await?;

        for row in rows {
            self.clone().schedule_row(row).await;
        }
        Ok(())
    }

    /// Enqueue within a transaction the caller already holds. Must be
    /// called from inside the closure passed to [`Scheduler::transaction`].
    pub(crate) fn run_with_tx(
        self: &Arc<Self>,
        handle: &mut TransactionHandle<'_>,
        ctx: TaskContext,
        key: &str,
        argument_bytes: Option<Vec<u8>>,
    ) -> TaskManagerResult<()> {
        let def = self.registry.get(key)?;
        let mut row = self.assemble_row(None, &key.to_string(), &def, &ctx, argument_bytes)?;

        if self.options.dry_run {
            row.task_status = TaskStatus::Running;
            handle.pending.rows.push(row);
            tracing::warn!(task_key = key, "dry_run: task assembled but not persisted");
            return Ok(());
        }

        if self.cancellation().is_cancelled() {
            row.task_status = TaskStatus::Initialized;
            dal::insert_with_tx(handle.tx, self.dal.table(), &row)?;
            return Ok(());
        }

        if self.can_schedule() {
            row.task_status = TaskStatus::Running;
            let id = dal::insert_with_tx(handle.tx, self.dal.table(), &row)?;
            row.id = id;
            handle.pending.rows.push(row);
        } else {
            row.task_status = TaskStatus::Initialized;
            dal::insert_with_tx(handle.tx, self.dal.table(), &row)?;
        }
        Ok(())
    }

    /// Top-level entry for an unmanaged insert (scanner claim, monitor
    /// re-arm): the row is already `Running` in storage; schedule it.
    pub(crate) async fn schedule_row(self: Arc<Self>, row: TaskRow) {
        if row.task_status != TaskStatus::Running {
            return;
        }
        let id = row.id;
        self.running.insert(id, ());

        let this = self.clone();
        match self.pool.try_acquire() {
            Some(permit) => {
                tokio::spawn(async move {
                    let _permit = permit;
                    this.execute(row).await;
                });
            }
            None => {
                tracing::warn!(task_id = id, "worker pool overloaded, spawning detached task");
                tokio::spawn(async move {
                    this.execute(row).await;
                });
            }
        }
    }

    async fn execute(self: Arc<Self>, row: TaskRow) {
        let id = row.id;
        let result = self.run_attempts(&row).await;

        let clean_succeeded = self
            .registry
            .get(&row.task_key)
            .map(|d| d.clean_succeeded)
            .unwrap_or(false);

        match result {
            Ok(()) if clean_succeeded => {
                if let Err(e) = self.dal.delete(id).await {
                    tracing::error!(task_id = id, error = %e, "failed to delete succeeded row");
                }
            }
            Ok(()) => {
                match self
                    .dal
                    .update_status_if(id, TaskStatus::Running, TaskStatus::Succeeded)
                    .await
                {
                    Ok(0) => tracing::warn!(task_id = id, "terminal transition to succeeded found no matching row"),
                    Ok(_) => tracing::info!(task_id = id, "task succeeded"),
                    Err(e) => tracing::error!(task_id = id, error = %e, "failed to persist success"),
                }
            }
            Err(e) => {
                tracing::error!(task_id = id, error = %e, "task failed after exhausting retries");
                match self
                    .dal
                    .update_status_if(id, TaskStatus::Running, TaskStatus::Failed)
                    .await
                {
                    Ok(0) => tracing::warn!(task_id = id, "terminal transition to failed found no matching row"),
                    Ok(_) => {}
                    Err(e) => tracing::error!(task_id = id, error = %e, "failed to persist failure"),
                }
            }
        }

        self.running.remove(&id);
    }

    async fn run_attempts(&self, row: &TaskRow) -> anyhow::Result<()> {
        let def = self
            .registry
            .get(&row.task_key)
            .map_err(|e| anyhow::anyhow!(e))?;

        let ctx = crate::assembler::disassemble_context(&def, row, self.options.context_marshaler.as_ref())
            .map_err(|e| anyhow::anyhow!(e))?;

        let mut last_err = anyhow::anyhow!("unreachable: retry_times implies at least one attempt");
        for attempt in 0..=def.retry_times {
            if attempt > 0 {
                tokio::time::sleep(def.retry_interval(attempt)).await;
            }
            let handler = def.handler.clone();
            let ctx = ctx.clone();
            let argument = row.argument.clone();
            match run_guarded(async move { handler.call(ctx, argument).await }).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(task_id = row.id, attempt, error = %e, "task attempt failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Idempotent stop. Cancels the scanner and monitor loops first, then
    /// polls the running set every 5s, reverting anything still running
    /// back to `Initialized` if the wait times out.
    pub(crate) async fn stop(self: &Arc<Self>, wait: bool) -> TaskManagerResult<()> {
        if self.stop_once.initialized() {
            return Ok(());
        }
        let _ = self.stop_once.get_or_init(|| async {}).await;

        self.options.cancellation.cancel();

        let deadline = if self.options.wait_timeout.is_zero() {
            None
        } else {
            Some(tokio::time::Instant::now() + self.options.wait_timeout)
        };

        loop {
            if self.running.is_empty() {
                break;
            }
            if !wait {
                break;
            }
            if let Some(deadline) = deadline {
                if tokio::time::Instant::now() >= deadline {
                    break;
                }
            }
            tracing::info!(remaining = self.running.len(), "waiting for running tasks to drain");
            tokio::time::sleep(Duration::from_secs(5)).await;
        }

        if !self.running.is_empty() {
            let ids: Vec<i64> = self.running.iter().map(|e| *e.key()).collect();
            let n = self
                .dal
                .update_status_by_ids_if(&ids, TaskStatus::Running, TaskStatus::Initialized)
                .await?;
            tracing::warn!(reverted = n, "reverted in-flight rows back to initialized on stop");
        }

        Ok(())
    }

    pub(crate) fn dal(&self) -> &SharedDal {
        &self.dal
    }

    pub(crate) fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub(crate) fn options(&self) -> &ManagerOptions {
        &self.options
    }
}

