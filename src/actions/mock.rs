//! 脚本化分发器（测试用）：按顺序返回预置结果并记录每次调用

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::actions::{ActionDispatcher, ActionOutput, DispatchError};
use crate::memory::Message;

/// 一次分发调用的记录
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchCall {
    Action { name: String, input: Value },
    Messages(Vec<Message>),
}

#[derive(Debug)]
enum Scripted {
    Ok(ActionOutput),
    Err(String),
}

/// 队列耗尽后返回 Failed
#[derive(Debug, Default)]
pub struct ScriptedDispatcher {
    replies: Mutex<VecDeque<Scripted>>,
    calls: Mutex<Vec<DispatchCall>>,
}

impl ScriptedDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_text(&self, text: impl Into<String>) {
        self.push(Scripted::Ok(ActionOutput::Text(text.into())));
    }

    pub fn push_structured(&self, value: Value) {
        self.push(Scripted::Ok(ActionOutput::Structured(value)));
    }

    pub fn push_failure(&self, reason: impl Into<String>) {
        self.push(Scripted::Err(reason.into()));
    }

    fn push(&self, item: Scripted) {
        if let Ok(mut q) = self.replies.lock() {
            q.push_back(item);
        }
    }

    pub fn calls(&self) -> Vec<DispatchCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn next(&self, call: DispatchCall) -> Result<ActionOutput, DispatchError> {
        if let Ok(mut c) = self.calls.lock() {
            c.push(call);
        }
        match self.replies.lock().ok().and_then(|mut q| q.pop_front()) {
            Some(Scripted::Ok(out)) => Ok(out),
            Some(Scripted::Err(reason)) => Err(DispatchError::Failed(reason)),
            None => Err(DispatchError::Failed("script exhausted".to_string())),
        }
    }
}

#[async_trait]
impl ActionDispatcher for ScriptedDispatcher {
    async fn dispatch_action(&self, action: &str, input: &Value) -> Result<ActionOutput, DispatchError> {
        self.next(DispatchCall::Action {
            name: action.to_string(),
            input: input.clone(),
        })
    }

    async fn dispatch_messages(&self, messages: &[Message]) -> Result<ActionOutput, DispatchError> {
        self.next(DispatchCall::Messages(messages.to_vec()))
    }
}
