use std::io;

/// The error taxonomy of the task manager: configuration problems, bad
/// definitions, enqueue-time failures, and the SQL/IO errors that bubble up
/// from the storage layer.
#[derive(thiserror::Error, Debug)]
pub enum TaskManagerError {
    #[error("config error: {0}")]
    Config(String),

    #[error("definition error: {0}")]
    Definition(String),

    #[error("task_key not registered: {0}")]
    KeyNotFound(String),

    #[error("argument encode/decode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("sql error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("no rows affected by conditional update")]
    NotUpdated,

    #[error("task not found")]
    TaskNotFound,

    #[error("handler error: {0}")]
    Handler(#[from] anyhow::Error),

    #[error("unexpected state: {0}")]
    Unexpected(String),
}

pub type TaskManagerResult<T> = Result<T, TaskManagerError>;
