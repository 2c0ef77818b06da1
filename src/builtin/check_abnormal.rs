use std::cmp::min;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::AbnormalCallback;
use crate::context::TaskContext;
use crate::dal::SharedDal;
use crate::definition::TaskDefinition;
use crate::error::TaskManagerResult;
use crate::model::CHECK_ABNORMAL_TASK_ID;
use crate::registry::Registry;

/// Argument of the abnormality-detection builtin task.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub(crate) struct CheckAbnormalArgument {
    pub(crate) storage_timeout: Duration,
    pub(crate) running_timeout: Duration,
    pub(crate) initialized_timeout: Duration,
}

pub(crate) fn definition(
    dal: SharedDal,
    registry: Arc<Registry>,
    callback: AbnormalCallback,
    storage_timeout: Duration,
    running_timeout: Duration,
    initialized_timeout: Duration,
    scan_interval: Duration,
) -> TaskManagerResult<TaskDefinition> {
    let loop_interval = min(
        min(initialized_timeout / 2, running_timeout / 2),
        scan_interval * 15,
    );
    let argument = CheckAbnormalArgument {
        storage_timeout,
        running_timeout,
        initialized_timeout,
    };

    TaskDefinition::builtin(
        CHECK_ABNORMAL_TASK_ID,
        loop_interval,
        argument,
        move |_ctx: TaskContext, arg: CheckAbnormalArgument| {
            let dal = dal.clone();
            let registry = registry.clone();
            let callback = callback.clone();
            async move { run(dal, registry, callback, arg).await }
        },
    )
}

async fn run(
    dal: SharedDal,
    registry: Arc<Registry>,
    callback: AbnormalCallback,
    arg: CheckAbnormalArgument,
) -> anyhow::Result<()> {
    let excluded = registry
        .builtin_definitions()
        .into_iter()
        .map(|d| d.key.clone())
        .collect::<Vec<_>>();

    let abnormal = dal
        .find_abnormal(
            chrono::Duration::from_std(arg.storage_timeout)?,
            chrono::Duration::from_std(arg.running_timeout)?,
            chrono::Duration::from_std(arg.initialized_timeout)?,
            &excluded,
        )
        .await?;

    for row in &abnormal {
        callback(row);
    }
    Ok(())
}
