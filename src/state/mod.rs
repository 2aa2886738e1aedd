//! 运行状态：数据模型、缓存存储与持久层

pub mod backend;
pub mod file;
pub mod run_state;
pub mod sqlite;
pub mod store;

pub use backend::StateBackend;
pub use file::FileBackend;
pub use run_state::{
    EventStatus, RunEvent, RunOutcome, RunState, RunSummary, StepMarker, Validation,
    VerdictStatus,
};
pub use sqlite::SqliteBackend;
pub use store::RunStateStore;
