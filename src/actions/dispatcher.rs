//! 动作分发接口
//!
//! Executor 只通过 ActionDispatcher 调用外部文书能力：带 hint 时按名字调用，无 hint 时整段对话交给上游 agent 自选。
//! 实现方自行负责重试与退避。

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::llm::LlmError;
use crate::memory::Message;

/// 外部能力的产出：纯文本或结构化数据
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutput {
    Text(String),
    Structured(Value),
}

impl ActionOutput {
    /// 结构化结果序列化为规范文本（缩进 JSON）
    pub fn into_text(self) -> String {
        match self {
            ActionOutput::Text(s) => s,
            ActionOutput::Structured(Value::String(s)) => s,
            ActionOutput::Structured(v) => {
                serde_json::to_string_pretty(&v).unwrap_or_else(|_| v.to_string())
            }
        }
    }

    /// 文本看起来是 JSON 时尝试转为结构化结果
    pub fn from_model_text(text: String) -> Self {
        let trimmed = text.trim();
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
                return ActionOutput::Structured(v);
            }
        }
        ActionOutput::Text(text)
    }
}

/// 分发失败（对 Executor 而言都是可重试的单步失败）
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Invalid action input: {0}")]
    InvalidInput(String),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Action failed: {0}")]
    Failed(String),
}

/// 外部能力调用接口
#[async_trait]
pub trait ActionDispatcher: Send + Sync {
    /// 调用一个具名能力；input 形如 {"action": ..., "inputs": {...}}
    async fn dispatch_action(&self, action: &str, input: &Value) -> Result<ActionOutput, DispatchError>;

    /// 无 hint 时转发完整对话，由上游 agent 选择能力
    async fn dispatch_messages(&self, messages: &[Message]) -> Result<ActionOutput, DispatchError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_structured_output_serializes_pretty() {
        let out = ActionOutput::Structured(json!({"name": "张三"}));
        assert_eq!(out.into_text(), "{\n  \"name\": \"张三\"\n}");
    }

    #[test]
    fn test_from_model_text_detects_json() {
        assert!(matches!(
            ActionOutput::from_model_text(" {\"a\": 1} ".into()),
            ActionOutput::Structured(_)
        ));
        assert!(matches!(
            ActionOutput::from_model_text("{不是 JSON".into()),
            ActionOutput::Text(_)
        ));
        assert!(matches!(
            ActionOutput::from_model_text("普通文本".into()),
            ActionOutput::Text(_)
        ));
    }
}
