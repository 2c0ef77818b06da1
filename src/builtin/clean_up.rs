use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::context::TaskContext;
use crate::dal::SharedDal;
use crate::definition::TaskDefinition;
use crate::error::TaskManagerResult;
use crate::model::CLEAN_UP_TASK_ID;
use crate::registry::Registry;

/// Argument of the clean-up builtin task.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub(crate) struct CleanUpArgument {
    pub(crate) storage_timeout: Duration,
}

pub(crate) fn definition(
    dal: SharedDal,
    registry: Arc<Registry>,
    storage_timeout: Duration,
) -> TaskManagerResult<TaskDefinition> {
    let loop_interval = storage_timeout / 2;
    let argument = CleanUpArgument { storage_timeout };

    TaskDefinition::builtin(
        CLEAN_UP_TASK_ID,
        loop_interval,
        argument,
        move |_ctx: TaskContext, arg: CleanUpArgument| {
            let dal = dal.clone();
            let registry = registry.clone();
            async move { run(dal, registry, arg).await }
        },
    )
}

async fn run(dal: SharedDal, registry: Arc<Registry>, arg: CleanUpArgument) -> anyhow::Result<()> {
    let excluded = registry
        .builtin_definitions()
        .into_iter()
        .map(|d| d.key.clone())
        .collect::<Vec<_>>();
    let storage_timeout = chrono::Duration::from_std(arg.storage_timeout)?;
    let deleted = dal.delete_succeeded_before(storage_timeout, &excluded).await?;
    if deleted > 0 {
        tracing::info!(deleted, "clean-up removed succeeded rows past storage timeout");
    }
    Ok(())
}
