//! Quill - 文书任务编排引擎
//!
//! 模块划分：
//! - **actions**: 外部文书能力的分发接口（LLM 实现 / 脚本化实现）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 主控循环、中断登记、状态轮询、错误类型
//! - **llm**: 文本生成抽象与实现（OpenAI 兼容 / Mock / 重试包装）
//! - **memory**: 对话消息与近期历史摘录
//! - **plan**: 清单数据模型、模型输出解析、动作策略表
//! - **roles**: Planner、Executor、Validator、Reviewer
//! - **state**: RunState 与缓存 + 持久化存储

pub mod actions;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod plan;
pub mod roles;
pub mod state;

pub use crate::core::{Orchestrator, RunResult};
pub use crate::state::{RunState, RunStateStore};
