//! 编排层错误类型
//!
//! 单步失败不会走到这里（由编排器记为 failed 后继续）；这里只有状态存储与任务级错误。

use thiserror::Error;

/// 运行状态存储错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("trace_id not found: {0}")]
    NotFound(String),

    #[error("invalid trace_id: {0}")]
    InvalidKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Background task failed: {0}")]
    Join(String),
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreError::Join(e.to_string())
    }
}

/// 任务级错误
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("State store error: {0}")]
    Store(#[from] StoreError),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}
