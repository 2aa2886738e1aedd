//! 基于 LLM 的文书能力实现
//!
//! 每个能力对应一条指令前缀；回复是 JSON 时作为结构化结果返回。
//! 持有的 LlmClient 通常是 RetryingLlmClient，重试与回显兜底由它负责。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::actions::{ActionDispatcher, ActionOutput, DispatchError};
use crate::llm::LlmClient;
use crate::memory::{Message, Role};

const DOC_WRITER_PROMPT: &str = "你是一名专业的文书与简历助手。\
根据用户请求完成解析、重写、扩写、精简、评估、生成个人陈述/推荐信或文档命名。\
务必只返回最终结果，不要包含解释、过程描述或多余标注。";

const DISPATCH_FRONT_PROMPT: &str = "你是 doc-writer 子代理的调度前端，只输出工具产物。";

fn default_capabilities() -> BTreeMap<String, String> {
    [
        ("contract_text", "请在保留关键信息的前提下精简以下文本："),
        ("rewrite_text", "请对以下文本进行润色，使其更清晰自然："),
        ("expand_text", "请对以下文本进行扩写，补充必要细节："),
        ("parse_resume_text", "请从以下简历文本中提取结构化信息并返回JSON："),
        ("evaluate_resume", "请对以下简历给出评价与改进建议："),
        ("generate_statement", "根据以下信息生成个人陈述（尽量结构化）："),
        ("generate_recommendation", "根据以下信息生成推荐信："),
        ("name_document", "请为以下Markdown文档生成一个简洁贴切的标题："),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// 用一个文本生成后端实现全部文书能力
pub struct LlmActionDispatcher {
    llm: Arc<dyn LlmClient>,
    capabilities: BTreeMap<String, String>,
}

impl LlmActionDispatcher {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            capabilities: default_capabilities(),
        }
    }

    /// 注册或覆盖一个能力的指令前缀
    pub fn with_capability(mut self, name: impl Into<String>, prompt: impl Into<String>) -> Self {
        self.capabilities.insert(name.into(), prompt.into());
        self
    }

    pub fn capabilities(&self) -> impl Iterator<Item = &str> {
        self.capabilities.keys().map(String::as_str)
    }
}

fn input_str<'a>(input: &'a Value, key: &str) -> Option<&'a str> {
    input
        .get("inputs")
        .and_then(|i| i.get(key))
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

#[async_trait]
impl ActionDispatcher for LlmActionDispatcher {
    async fn dispatch_action(&self, action: &str, input: &Value) -> Result<ActionOutput, DispatchError> {
        let prompt = self
            .capabilities
            .get(action)
            .ok_or_else(|| DispatchError::UnknownAction(action.to_string()))?;
        let text = input_str(input, "text")
            .or_else(|| input_str(input, "letter"))
            .ok_or_else(|| DispatchError::InvalidInput("请输入非空文本。".to_string()))?;

        let mut system = format!("{DISPATCH_FRONT_PROMPT}{prompt}");
        if let Some(fix) = input_str(input, "fix_guidance") {
            system.push_str(&format!(" 必须按以下修正点调整结果：{fix}"));
        }

        tracing::debug!(action, chars = text.chars().count(), "Dispatching document action");
        let reply = self
            .llm
            .complete(&[Message::system(system), Message::user(text)])
            .await?;
        Ok(ActionOutput::from_model_text(reply))
    }

    async fn dispatch_messages(&self, messages: &[Message]) -> Result<ActionOutput, DispatchError> {
        let mut full = Vec::with_capacity(messages.len() + 1);
        if !messages.iter().any(|m| m.role == Role::System) {
            full.push(Message::system(DOC_WRITER_PROMPT));
        }
        full.extend_from_slice(messages);
        let reply = self.llm.complete(&full).await?;
        Ok(ActionOutput::from_model_text(reply))
    }
}
