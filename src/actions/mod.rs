//! 动作层：外部文书能力的分发接口与实现

pub mod dispatcher;
pub mod llm_dispatcher;
pub mod mock;

pub use dispatcher::{ActionDispatcher, ActionOutput, DispatchError};
pub use llm_dispatcher::LlmActionDispatcher;
pub use mock::{DispatchCall, ScriptedDispatcher};
