use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// Name of a registered handler class. Capped at 64 chars by the registry.
pub type TaskKey = String;

/// Reserved primary keys for the two builtin looping tasks, see
/// `builtin::clean_up` and `builtin::check_abnormal`.
pub const CLEAN_UP_TASK_ID: i64 = 9999;
pub const CHECK_ABNORMAL_TASK_ID: i64 = 10000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Initialized,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Initialized => "initialized",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for TaskStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for TaskStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "initialized" => Ok(TaskStatus::Initialized),
            "running" => Ok(TaskStatus::Running),
            "succeeded" => Ok(TaskStatus::Succeeded),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(FromSqlError::Other(
                format!("unknown task_status: {other}").into(),
            )),
        }
    }
}

/// A persisted row of the task table.
#[derive(Debug, Clone)]
pub struct TaskRow {
    pub id: i64,
    pub task_key: TaskKey,
    pub task_status: TaskStatus,
    pub context: Option<Vec<u8>>,
    pub argument: Option<Vec<u8>>,
    pub extra: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRow {
    /// A freshly assembled row, not yet assigned a status or timestamps by
    /// the storage layer. The caller (enqueue path) sets `task_status`
    /// before persisting.
    pub(crate) fn assembled(
        id: Option<i64>,
        task_key: TaskKey,
        context: Option<Vec<u8>>,
        argument: Option<Vec<u8>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.unwrap_or_default(),
            task_key,
            task_status: TaskStatus::Initialized,
            context,
            argument,
            extra: b"{}".to_vec(),
            created_at: now,
            updated_at: now,
        }
    }
}
