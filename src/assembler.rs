use crate::context::TaskContext;
use crate::definition::TaskDefinition;
use crate::error::TaskManagerResult;
use crate::model::{TaskKey, TaskRow};

/// Encodes a caller's context and argument into a fresh, unpersisted row.
pub(crate) fn assemble(
    id: Option<i64>,
    task_key: TaskKey,
    def: &TaskDefinition,
    ctx: &TaskContext,
    argument_bytes: Option<Vec<u8>>,
    marshaler: &dyn crate::context::ContextMarshaler,
) -> TaskManagerResult<TaskRow> {
    // Fail fast on a type mismatch at enqueue time rather than only at
    // execution time: decode the same bytes that will be persisted into
    // the handler's concrete argument type and discard the result.
    def.handler.validate_argument(argument_bytes.as_deref())?;

    let ctx_marshaler = def.context_marshaler.as_deref().unwrap_or(marshaler);
    let context_bytes = ctx_marshaler.marshal(ctx)?;
    Ok(TaskRow::assembled(id, task_key, context_bytes, argument_bytes))
}

/// Decodes a persisted row back into `(context, raw argument bytes)`. The
/// argument bytes are handed to the registered `ErasedHandler`, which knows
/// the concrete type to decode into; this function only owns the context
/// side of the round trip.
pub(crate) fn disassemble_context(
    def: &TaskDefinition,
    row: &TaskRow,
    marshaler: &dyn crate::context::ContextMarshaler,
) -> TaskManagerResult<TaskContext> {
    let ctx_marshaler = def.context_marshaler.as_deref().unwrap_or(marshaler);
    ctx_marshaler.unmarshal(row.context.as_deref())
}
