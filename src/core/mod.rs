//! 核心编排层：错误类型、中断登记、主控循环、状态轮询

pub mod error;
pub mod interrupt;
pub mod observer;
pub mod orchestrator;

pub use error::{OrchestratorError, StoreError};
pub use interrupt::{InterruptRegistry, RegistrySnapshot, TaskInfo, TaskStatus, TaskView};
pub use observer::{observe_until_finished, ObserveOptions, Observation};
pub use orchestrator::{Orchestrator, RunResult};
