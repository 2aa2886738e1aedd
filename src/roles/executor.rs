//! Executor：执行单个子任务
//!
//! 元步骤直接返回分析信息；有 hint 时按名字调用能力，无 hint 时转发整段对话。
//! 上一次校验的修正点会随请求一起发出。

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::actions::{ActionDispatcher, DispatchError};
use crate::memory::{truncate_chars, Message};
use crate::plan::{ActionPolicy, Step};
use crate::roles::TaskContext;

pub type StepOutputs = BTreeMap<String, Value>;

pub struct Executor {
    dispatcher: Arc<dyn ActionDispatcher>,
    policy: Arc<ActionPolicy>,
}

impl Executor {
    pub fn new(dispatcher: Arc<dyn ActionDispatcher>, policy: Arc<ActionPolicy>) -> Self {
        Self { dispatcher, policy }
    }

    /// 成功时至少包含 "text" 或 "analysis"；分发失败原样返回，由编排器决定是否重试
    pub async fn execute(&self, ctx: &TaskContext, step: &Step) -> Result<StepOutputs, DispatchError> {
        if self.policy.is_meta_step(&step.title) {
            let mut out = StepOutputs::new();
            out.insert(
                "analysis".to_string(),
                json!({
                    "step": step.title,
                    "preview": truncate_chars(&ctx.user_input, 200),
                }),
            );
            return Ok(out);
        }

        let fix = ctx.last_failed_feedback.trim();
        match step.tool_hint.as_deref() {
            Some(hint) => {
                let mut inputs = json!({
                    "text": ctx.user_input,
                    "letter": ctx.user_input,
                });
                if !fix.is_empty() {
                    inputs["fix_guidance"] = Value::String(fix.to_string());
                }
                let payload = json!({ "action": hint, "inputs": inputs });

                tracing::debug!(trace_id = %ctx.trace_id, action = hint, "Dispatching action");
                let text = self.dispatcher.dispatch_action(hint, &payload).await?.into_text();

                let mut out = StepOutputs::new();
                out.insert("text".to_string(), Value::String(text));
                out.insert("used_tool".to_string(), Value::String(hint.to_string()));
                Ok(out)
            }
            None => {
                let mut messages = ctx.messages.clone();
                if !fix.is_empty() {
                    messages.push(Message::system(format!(
                        "请严格依据以下必须修正点修改输出：{}。只输出最终结果，不要解释。",
                        fix
                    )));
                }
                tracing::debug!(trace_id = %ctx.trace_id, "Dispatching conversation without hint");
                let text = self.dispatcher.dispatch_messages(&messages).await?.into_text();

                let mut out = StepOutputs::new();
                out.insert("text".to_string(), Value::String(text));
                Ok(out)
            }
        }
    }
}
