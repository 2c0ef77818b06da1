//! A durable, at-least-once asynchronous task manager backed by SQLite.
//!
//! Tasks are persisted rows driven through `initialized -> running ->
//! {succeeded, failed}` by a bounded worker pool, a background scanner that
//! claims orphaned rows, and a monitor that re-arms two builtin periodic
//! tasks (storage clean-up and stuck-task detection). See `DESIGN.md` for
//! the grounding behind each module.

mod assembler;
mod builtin;
mod config;
mod context;
mod dal;
mod definition;
mod error;
mod manager;
mod model;
mod monitor;
mod pool;
mod registry;
mod scanner;
mod scheduler;
mod util;

pub mod default_manager;

pub use config::{AbnormalCallback, ManagerOptions, ManagerOptionsBuilder};
pub use context::{ContextMarshaler, JsonContextMarshaler, NullContextMarshaler, TaskContext};
pub use definition::{TaskDefinition, TaskDefinitionBuilder};
pub use error::{TaskManagerError, TaskManagerResult};
pub use manager::Manager;
pub use model::{TaskKey, TaskRow, TaskStatus, CHECK_ABNORMAL_TASK_ID, CLEAN_UP_TASK_ID};
pub use scheduler::TransactionHandle;
