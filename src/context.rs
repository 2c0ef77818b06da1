use crate::error::TaskManagerResult;

/// Caller-supplied context carried alongside a task's argument. Kept as an
/// opaque JSON value: callers that need to propagate tracing metadata or a
/// request id across a crash/restart boundary can stash it here; callers
/// that don't care can pass `serde_json::Value::Null` and ignore it.
pub type TaskContext = serde_json::Value;

/// Marshals a [`TaskContext`] to and from the opaque `context` column.
///
/// The storage and wire format of the context is deliberately out of scope
/// of this crate's core contract: implementers provide whichever marshaler
/// fits their tracing/propagation strategy.
pub trait ContextMarshaler: Send + Sync {
    fn marshal(&self, ctx: &TaskContext) -> TaskManagerResult<Option<Vec<u8>>>;
    fn unmarshal(&self, bytes: Option<&[u8]>) -> TaskManagerResult<TaskContext>;
}

/// The default marshaler: stores nothing and always reconstructs `Null`.
#[derive(Debug, Default)]
pub struct NullContextMarshaler;

impl ContextMarshaler for NullContextMarshaler {
    fn marshal(&self, _ctx: &TaskContext) -> TaskManagerResult<Option<Vec<u8>>> {
        Ok(None)
    }

    fn unmarshal(&self, _bytes: Option<&[u8]>) -> TaskManagerResult<TaskContext> {
        Ok(serde_json::Value::Null)
    }
}

/// A marshaler that round-trips the context through canonical JSON, for
/// callers who do want the context preserved across a restart.
#[derive(Debug, Default)]
pub struct JsonContextMarshaler;

impl ContextMarshaler for JsonContextMarshaler {
    fn marshal(&self, ctx: &TaskContext) -> TaskManagerResult<Option<Vec<u8>>> {
        if ctx.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::to_vec(ctx)?))
    }

    fn unmarshal(&self, bytes: Option<&[u8]>) -> TaskManagerResult<TaskContext> {
        match bytes {
            None | Some(b"") => Ok(serde_json::Value::Null),
            Some(b) => Ok(serde_json::from_slice(b)?),
        }
    }
}
