//! 三角色 + 复评：Planner、Executor、Validator、Reviewer
//!
//! 各角色只读共享的 TaskContext；状态写入由编排器负责。

pub mod executor;
pub mod planner;
pub mod reviewer;
pub mod validator;

pub use executor::Executor;
pub use planner::Planner;
pub use reviewer::Reviewer;
pub use validator::{OutputRules, Validator, Verdict};

use serde_json::{json, Value};

use crate::memory::Message;
use crate::plan::{ActionPolicy, Step, StepDraft};

/// 一次任务内各角色共享的上下文
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub trace_id: String,
    pub session_id: String,
    /// 任务分类（guess_action 的结果）
    pub action: String,
    pub user_input: String,
    /// 历史对话 + 本次用户输入
    pub messages: Vec<Message>,
    /// 上一次校验失败的反馈，下一次执行时作为修正点
    pub last_failed_feedback: String,
}

impl TaskContext {
    pub fn new(
        trace_id: impl Into<String>,
        session_id: impl Into<String>,
        action: impl Into<String>,
        user_input: impl Into<String>,
        history: Vec<Message>,
    ) -> Self {
        let user_input = user_input.into();
        let mut messages = history;
        messages.push(Message::user(user_input.clone()));
        Self {
            trace_id: trace_id.into(),
            session_id: session_id.into(),
            action: action.into(),
            user_input,
            messages,
            last_failed_feedback: String::new(),
        }
    }
}

/// 模型草稿 → Step：缺省 hint 时按标题路由
pub(crate) fn steps_from_drafts(drafts: Vec<StepDraft>, policy: &ActionPolicy) -> Vec<Step> {
    drafts
        .into_iter()
        .map(|d| {
            let title = if d.title.trim().is_empty() {
                "执行主要动作".to_string()
            } else {
                d.title
            };
            let hint = d
                .tool_hint
                .filter(|h| !h.trim().is_empty())
                .or_else(|| policy.route_by_title(&title));
            let mut step = Step::new(title).with_criteria(d.accept_criteria.into_vec());
            step.need_validation = d.need_validation;
            step.tool_hint = hint;
            step
        })
        .collect()
}

/// 给模型看的清单提纲
pub(crate) fn steps_outline(steps: &[Step]) -> Value {
    Value::Array(
        steps
            .iter()
            .enumerate()
            .map(|(i, s)| {
                json!({
                    "idx": i + 1,
                    "title": s.title,
                    "need_validation": s.need_validation,
                    "tool_hint": s.tool_hint,
                })
            })
            .collect(),
    )
}
