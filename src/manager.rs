use std::path::Path;
use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::builtin::{check_abnormal, clean_up};
use crate::config::ManagerOptions;
use crate::context::TaskContext;
use crate::dal::Dal;
use crate::definition::TaskDefinition;
use crate::error::TaskManagerResult;
use crate::model::{TaskRow, TaskStatus};
use crate::monitor::Monitor;
use crate::registry::Registry;
use crate::scanner::Scanner;
use crate::scheduler::{Scheduler, TransactionHandle};

/// Public façade wiring the registry, scheduler, scanner and monitors
/// together.
pub struct Manager {
    registry: Arc<Registry>,
    scheduler: Arc<Scheduler>,
    options: ManagerOptions,
    started: OnceCell<()>,
}

impl Manager {
    pub fn new(db_path: impl AsRef<Path>, table: &str, options: ManagerOptions) -> TaskManagerResult<Self> {
        let dal = Arc::new(Dal::open(db_path.as_ref(), table)?);
        let registry = Arc::new(Registry::new());
        let scheduler = Scheduler::new(dal, registry.clone(), options.clone());
        Ok(Self {
            registry,
            scheduler,
            options,
            started: OnceCell::new(),
        })
    }

    /// Registers a user task definition. Safe to call before or after
    /// [`Manager::start`].
    pub fn register(&self, key: impl Into<String>, def: TaskDefinition) -> TaskManagerResult<()> {
        self.registry.register(key, def)
    }

    /// Registers the two builtin looping tasks, launches the scanner, and
    /// launches one monitor per builtin definition. Idempotent.
    pub async fn start(&self) -> TaskManagerResult<()> {
        if self.started.initialized() {
            return Ok(());
        }
        self.started
            .get_or_init(|| async {
                if let Err(e) = self.register_builtins() {
                    tracing::error!(error = %e, "failed to register builtin tasks");
                }

                let scanner = Scanner::new(self.scheduler.clone());
                tokio::spawn(scanner.run());

                for def in self.registry.builtin_definitions() {
                    let monitor = Monitor::new(self.scheduler.clone(), def);
                    tokio::spawn(monitor.run());
                }
            })
            .await;
        Ok(())
    }

    fn register_builtins(&self) -> TaskManagerResult<()> {
        let clean_up_def = clean_up::definition(
            self.scheduler.dal().clone(),
            self.registry.clone(),
            self.options.storage_timeout,
        )?;
        self.registry.register("__clean_up__", clean_up_def)?;

        let check_abnormal_def = check_abnormal::definition(
            self.scheduler.dal().clone(),
            self.registry.clone(),
            self.options.abnormal_callback.clone(),
            self.options.storage_timeout,
            self.options.running_timeout,
            self.options.initialized_timeout,
            self.options.scan_interval,
        )?;
        self.registry.register("__check_abnormal__", check_abnormal_def)?;
        Ok(())
    }

    /// `run(ctx, key, arg)`: one-shot managed enqueue.
    pub async fn run<A: serde::Serialize>(&self, ctx: TaskContext, key: &str, arg: A) -> TaskManagerResult<()> {
        self.scheduler.run(ctx, key, arg).await
    }

    /// `run_with_tx`: enqueue inside a transaction the caller already holds
    /// via [`Manager::transaction`].
    pub fn run_with_tx<A: serde::Serialize>(
        &self,
        handle: &mut TransactionHandle<'_>,
        ctx: TaskContext,
        key: &str,
        arg: A,
    ) -> TaskManagerResult<()> {
        let argument_bytes = Some(serde_json::to_vec(&arg)?);
        self.scheduler.run_with_tx(handle, ctx, key, argument_bytes)
    }

    /// Runs `f` inside a managed transaction.
    pub async fn transaction<Fun>(&self, f: Fun) -> TaskManagerResult<()>
    where
        Fun: FnOnce(&mut TransactionHandle<'_>) -> TaskManagerResult<()>,
    {
        self.scheduler.transaction(f).await
    }

    /// Stops the manager, waiting up to `wait_timeout` for in-flight tasks
    /// to drain if `wait` is true. Idempotent.
    pub async fn stop(&self, wait: bool) -> TaskManagerResult<()> {
        self.scheduler.stop(wait).await
    }

    /// Forces a batch of rows back to `Initialized` regardless of age:
    /// conditional update `{id in ids, status = from_status} ->
    /// initialized`.
    pub async fn force_rerun_tasks(&self, ids: &[i64], from_status: TaskStatus) -> TaskManagerResult<u64> {
        self.scheduler.dal().force_rerun(ids, from_status).await
    }

    /// Rows that are not `Succeeded`, excluding builtin rows.
    pub async fn query_unsuccessful_tasks(&self, limit: i64, offset: i64) -> TaskManagerResult<Vec<TaskRow>> {
        let excluded = self
            .registry
            .builtin_definitions()
            .into_iter()
            .map(|d| d.key.clone())
            .collect::<Vec<_>>();
        self.scheduler
            .dal()
            .query_unsuccessful(&excluded, limit, offset)
            .await
    }
}
