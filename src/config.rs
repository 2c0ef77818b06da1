use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::context::{ContextMarshaler, NullContextMarshaler};
use crate::error::{TaskManagerError, TaskManagerResult};
use crate::model::TaskRow;

/// Callback invoked by the abnormality monitor for each stuck row found.
/// Default implementation just logs.
pub type AbnormalCallback = Arc<dyn Fn(&TaskRow) + Send + Sync>;

/// Validated construction options for [`crate::manager::Manager`], built
/// through a Rust option-chain builder.
#[derive(Clone)]
pub struct ManagerOptions {
    pub(crate) storage_timeout: Duration,
    pub(crate) initialized_timeout: Duration,
    pub(crate) running_timeout: Duration,
    pub(crate) scan_interval: Duration,
    pub(crate) instant_scan_interval: Duration,
    pub(crate) wait_timeout: Duration,
    pub(crate) pool_size: usize,
    pub(crate) context_marshaler: Arc<dyn ContextMarshaler>,
    pub(crate) abnormal_callback: AbnormalCallback,
    pub(crate) dry_run: bool,
    pub(crate) cancellation: CancellationToken,
}

impl Default for ManagerOptionsBuilder {
    fn default() -> Self {
        Self {
            storage_timeout: Duration::from_secs(7 * 24 * 3600),
            initialized_timeout: Duration::from_secs(5 * 60),
            running_timeout: Duration::from_secs(30 * 60),
            scan_interval: Duration::from_secs(5),
            instant_scan_interval: Duration::from_millis(100),
            wait_timeout: Duration::ZERO,
            pool_size: 256,
            context_marshaler: None,
            abnormal_callback: None,
            dry_run: false,
            cancellation: None,
        }
    }
}

pub struct ManagerOptionsBuilder {
    storage_timeout: Duration,
    initialized_timeout: Duration,
    running_timeout: Duration,
    scan_interval: Duration,
    instant_scan_interval: Duration,
    wait_timeout: Duration,
    pool_size: usize,
    context_marshaler: Option<Arc<dyn ContextMarshaler>>,
    abnormal_callback: Option<AbnormalCallback>,
    dry_run: bool,
    cancellation: Option<CancellationToken>,
}

impl ManagerOptionsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn storage_timeout(mut self, d: Duration) -> Self {
        self.storage_timeout = d;
        self
    }

    pub fn initialized_timeout(mut self, d: Duration) -> Self {
        self.initialized_timeout = d;
        self
    }

    pub fn running_timeout(mut self, d: Duration) -> Self {
        self.running_timeout = d;
        self
    }

    pub fn scan_interval(mut self, d: Duration) -> Self {
        self.scan_interval = d;
        self
    }

    pub fn instant_scan_interval(mut self, d: Duration) -> Self {
        self.instant_scan_interval = d;
        self
    }

    pub fn wait_timeout(mut self, d: Duration) -> Self {
        self.wait_timeout = d;
        self
    }

    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    pub fn context_marshaler(mut self, marshaler: Arc<dyn ContextMarshaler>) -> Self {
        self.context_marshaler = Some(marshaler);
        self
    }

    pub fn abnormal_callback(mut self, cb: AbnormalCallback) -> Self {
        self.abnormal_callback = Some(cb);
        self
    }

    pub fn dry_run(mut self, flag: bool) -> Self {
        self.dry_run = flag;
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn build(self) -> TaskManagerResult<ManagerOptions> {
        if self.storage_timeout.is_zero() {
            return Err(TaskManagerError::Config("storage_timeout must be > 0".into()));
        }
        if self.initialized_timeout > self.storage_timeout {
            return Err(TaskManagerError::Config(
                "initialized_timeout must be <= storage_timeout".into(),
            ));
        }
        if self.running_timeout > self.storage_timeout {
            return Err(TaskManagerError::Config(
                "running_timeout must be <= storage_timeout".into(),
            ));
        }
        if self.scan_interval > self.initialized_timeout
            || self.scan_interval > self.running_timeout
            || self.scan_interval > self.storage_timeout
        {
            return Err(TaskManagerError::Config(
                "scan_interval must be <= initialized_timeout, running_timeout and storage_timeout".into(),
            ));
        }
        if self.instant_scan_interval > self.scan_interval {
            return Err(TaskManagerError::Config(
                "instant_scan_interval must be <= scan_interval".into(),
            ));
        }
        if self.pool_size == 0 {
            return Err(TaskManagerError::Config("pool_size must be > 0".into()));
        }

        Ok(ManagerOptions {
            storage_timeout: self.storage_timeout,
            initialized_timeout: self.initialized_timeout,
            running_timeout: self.running_timeout,
            scan_interval: self.scan_interval,
            instant_scan_interval: self.instant_scan_interval,
            wait_timeout: self.wait_timeout,
            pool_size: self.pool_size,
            context_marshaler: self
                .context_marshaler
                .unwrap_or_else(|| Arc::new(NullContextMarshaler)),
            abnormal_callback: self.abnormal_callback.unwrap_or_else(|| {
                Arc::new(|row: &TaskRow| {
                    tracing::warn!(task_id = row.id, task_key = %row.task_key, "abnormal task detected");
                })
            }),
            dry_run: self.dry_run,
            cancellation: self.cancellation.unwrap_or_default(),
        })
    }
}

impl ManagerOptions {
    pub fn builder() -> ManagerOptionsBuilder {
        ManagerOptionsBuilder::new()
    }
}
