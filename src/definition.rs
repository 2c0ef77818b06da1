use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::context::{ContextMarshaler, TaskContext};
use crate::error::TaskManagerResult;
use crate::model::TaskKey;

/// Type-erased handler stored in the registry. The argument type lives in
/// the generic `TypedHandler<A, F>` wrapper: registering a handler over a
/// concrete `A` gives each definition its own typed codec.
#[async_trait::async_trait]
pub(crate) trait ErasedHandler: Send + Sync {
    /// Decode `bytes` into the handler's concrete argument type without
    /// invoking the handler, used at enqueue time to fail fast on a type
    /// mismatch.
    fn validate_argument(&self, bytes: Option<&[u8]>) -> TaskManagerResult<()>;

    async fn call(&self, ctx: TaskContext, argument: Option<Vec<u8>>) -> anyhow::Result<()>;
}

pub(crate) struct TypedHandler<A, F> {
    f: F,
    _marker: PhantomData<fn() -> A>,
}

fn decode_argument<A>(bytes: Option<&[u8]>) -> TaskManagerResult<A>
where
    A: DeserializeOwned + Default,
{
    match bytes {
        None | Some([]) => Ok(A::default()),
        Some(b) => Ok(serde_json::from_slice(b)?),
    }
}

#[async_trait::async_trait]
impl<A, F, Fut> ErasedHandler for TypedHandler<A, F>
where
    A: DeserializeOwned + Serialize + Default + Send + Sync + 'static,
    F: Fn(TaskContext, A) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    fn validate_argument(&self, bytes: Option<&[u8]>) -> TaskManagerResult<()> {
        decode_argument::<A>(bytes).map(|_| ())
    }

    async fn call(&self, ctx: TaskContext, argument: Option<Vec<u8>>) -> anyhow::Result<()> {
        let arg: A = decode_argument(argument.as_deref())?;
        (self.f)(ctx, arg).await
    }
}

/// Registered metadata binding a task key to its handler and retry policy.
pub struct TaskDefinition {
    pub(crate) key: TaskKey,
    pub(crate) handler: Arc<dyn ErasedHandler>,
    pub(crate) context_marshaler: Option<Arc<dyn ContextMarshaler>>,
    pub(crate) retry_times: u32,
    pub(crate) retry_interval: Arc<dyn Fn(u32) -> Duration + Send + Sync>,
    pub(crate) clean_succeeded: bool,
    pub(crate) init_timeout_sensitive: bool,

    // builtin-only fields
    pub(crate) builtin: bool,
    pub(crate) task_id: Option<i64>,
    pub(crate) loop_interval: Option<Duration>,
    pub(crate) argument: Option<Vec<u8>>,
}

pub(crate) fn default_retry_interval() -> Arc<dyn Fn(u32) -> Duration + Send + Sync> {
    Arc::new(|_times: u32| Duration::from_secs(1))
}

/// Builder for [`TaskDefinition`] using `with_*` option chains: every field
/// but the handler is optional and falls back to a sane default.
pub struct TaskDefinitionBuilder<A> {
    context_marshaler: Option<Arc<dyn ContextMarshaler>>,
    retry_times: u32,
    retry_interval: Arc<dyn Fn(u32) -> Duration + Send + Sync>,
    clean_succeeded: bool,
    init_timeout_sensitive: bool,
    _marker: PhantomData<fn() -> A>,
}

impl<A> Default for TaskDefinitionBuilder<A>
where
    A: DeserializeOwned + Serialize + Default + Send + Sync + 'static,
{
    fn default() -> Self {
        Self {
            context_marshaler: None,
            retry_times: 0,
            retry_interval: default_retry_interval(),
            clean_succeeded: false,
            init_timeout_sensitive: false,
            _marker: PhantomData,
        }
    }
}

impl<A> TaskDefinitionBuilder<A>
where
    A: DeserializeOwned + Serialize + Default + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn context_marshaler(mut self, marshaler: Arc<dyn ContextMarshaler>) -> Self {
        self.context_marshaler = Some(marshaler);
        self
    }

    pub fn retry_times(mut self, times: u32) -> Self {
        self.retry_times = times;
        self
    }

    pub fn retry_interval<F>(mut self, f: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        self.retry_interval = Arc::new(f);
        self
    }

    pub fn clean_succeeded(mut self, flag: bool) -> Self {
        self.clean_succeeded = flag;
        self
    }

    pub fn init_timeout_sensitive(mut self, flag: bool) -> Self {
        self.init_timeout_sensitive = flag;
        self
    }

    /// Finalize the definition with a handler. `key` is filled in by
    /// `Registry::register` once the definition is registered.
    pub fn build<F, Fut>(self, handler: F) -> TaskDefinition
    where
        F: Fn(TaskContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        TaskDefinition {
            key: String::new(),
            handler: Arc::new(TypedHandler {
                f: handler,
                _marker: PhantomData,
            }),
            context_marshaler: self.context_marshaler,
            retry_times: self.retry_times,
            retry_interval: self.retry_interval,
            clean_succeeded: self.clean_succeeded,
            init_timeout_sensitive: self.init_timeout_sensitive,
            builtin: false,
            task_id: None,
            loop_interval: None,
            argument: None,
        }
    }
}

impl TaskDefinition {
    pub(crate) fn retry_interval(&self, times: u32) -> Duration {
        (self.retry_interval)(times)
    }

    pub(crate) fn validate(&self) -> TaskManagerResult<()> {
        if self.builtin {
            if self.task_id.is_none() {
                return Err(crate::error::TaskManagerError::Definition(
                    "builtin definition missing task_id".into(),
                ));
            }
            if self.loop_interval.map(|d| d.is_zero()).unwrap_or(true) {
                return Err(crate::error::TaskManagerError::Definition(
                    "builtin definition missing a positive loop_interval".into(),
                ));
            }
            if self.argument.is_none() {
                return Err(crate::error::TaskManagerError::Definition(
                    "builtin definition missing argument".into(),
                ));
            }
        }
        Ok(())
    }

    pub(crate) fn builtin<A, F, Fut>(
        task_id: i64,
        loop_interval: Duration,
        argument: A,
        handler: F,
    ) -> TaskManagerResult<TaskDefinition>
    where
        A: DeserializeOwned + Serialize + Default + Send + Sync + 'static,
        F: Fn(TaskContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let argument_bytes = serde_json::to_vec(&argument)?;
        let mut def = TaskDefinitionBuilder::<A>::new().build(handler);
        def.builtin = true;
        def.task_id = Some(task_id);
        def.loop_interval = Some(loop_interval);
        def.argument = Some(argument_bytes);
        Ok(def)
    }
}
