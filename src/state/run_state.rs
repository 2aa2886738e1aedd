//! 运行状态：一次任务的 ToDo 标记、清单快照、事件日志与校验结论
//!
//! 所有修改都经由这里的方法完成：事件只追加，version 每次修改加一。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::memory::truncate_chars;
use crate::plan::{Step, StepStatus};

/// 事件状态标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Info,
    Started,
    Ok,
    Warn,
    Error,
    Failed,
    Replan,
    Interrupted,
}

/// 事件日志中的一条记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub ts: DateTime<Utc>,
    pub name: String,
    pub status: EventStatus,
    #[serde(default)]
    pub details: Value,
}

/// ToDo 标记：plan / step-N / step-N-validate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMarker {
    pub step: String,
    #[serde(default)]
    pub desc: String,
    pub status: StepStatus,
}

/// 校验结论的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerdictStatus {
    /// 单步验收通过
    Passed,
    /// 单步验收未通过
    Rejected,
    /// 整个任务结束且 done
    Completed,
    /// 整个任务结束但未 done
    Failed,
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Validation {
    pub ok: bool,
    pub status: VerdictStatus,
    #[serde(default)]
    pub issues: Vec<String>,
    pub ts: DateTime<Utc>,
}

impl Validation {
    pub fn new(ok: bool, status: VerdictStatus, issues: Vec<String>) -> Self {
        Self {
            ok,
            status,
            issues,
            ts: Utc::now(),
        }
    }

    pub fn interrupted() -> Self {
        Self::new(false, VerdictStatus::Interrupted, vec!["任务已被中断".to_string()])
    }
}

/// 任务最终结果（写入后轮询方即可认为任务结束）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub done: bool,
    pub final_text: String,
    pub plan_rationale: String,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub trace_id: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    /// 每次修改加一，持久层据此拒绝旧版本覆盖新版本
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub input_preview: String,
    #[serde(default)]
    pub action_guess: Option<String>,
    #[serde(default)]
    pub todo: Vec<StepMarker>,
    #[serde(default)]
    pub checklist: Vec<Step>,
    #[serde(default)]
    pub events: Vec<RunEvent>,
    #[serde(default)]
    pub validation: Option<Validation>,
    #[serde(default)]
    pub outcome: Option<RunOutcome>,
}

/// 列表用摘要
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub trace_id: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub action_guess: Option<String>,
    pub validation: Option<Validation>,
    pub done: Option<bool>,
}

impl RunState {
    pub fn new(session_id: &str, user_input: &str, action_guess: Option<String>) -> Self {
        Self {
            trace_id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            created_at: Utc::now(),
            version: 0,
            input_preview: truncate_chars(user_input, 100),
            action_guess,
            todo: Vec::new(),
            checklist: Vec::new(),
            events: Vec::new(),
            validation: None,
            outcome: None,
        }
    }

    pub fn push_event(&mut self, name: &str, status: EventStatus, details: Value) {
        self.events.push(RunEvent {
            ts: Utc::now(),
            name: name.to_string(),
            status,
            details,
        });
    }

    /// 更新某个 ToDo 标记；不存在则追加。描述按当前清单重新取，重规划后随之更新
    pub fn set_step_status(&mut self, step: &str, status: StepStatus) {
        let desc = self.marker_desc(step);
        match self.todo.iter_mut().find(|m| m.step == step) {
            Some(marker) => {
                marker.status = status;
                marker.desc = desc;
            }
            None => self.todo.push(StepMarker {
                step: step.to_string(),
                desc,
                status,
            }),
        }
    }

    fn marker_desc(&self, step: &str) -> String {
        if step == "plan" {
            return "规划任务清单".to_string();
        }
        let Some(rest) = step.strip_prefix("step-") else {
            return String::new();
        };
        let (idx, validate) = match rest.strip_suffix("-validate") {
            Some(idx) => (idx, true),
            None => (rest, false),
        };
        let title = idx
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| self.checklist.get(i))
            .map(|s| s.title.as_str())
            .unwrap_or_default();
        if validate {
            format!("校验：{}", title)
        } else {
            title.to_string()
        }
    }

    pub fn step_status(&self, step: &str) -> Option<StepStatus> {
        self.todo.iter().find(|m| m.step == step).map(|m| m.status)
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            trace_id: self.trace_id.clone(),
            session_id: self.session_id.clone(),
            created_at: self.created_at,
            action_guess: self.action_guess.clone(),
            validation: self.validation.clone(),
            done: self.outcome.as_ref().map(|o| o.done),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_step_status_updates_or_appends() {
        let mut state = RunState::new("s1", "重写求职信", None);
        state.set_step_status("plan", StepStatus::InProgress);
        state.set_step_status("plan", StepStatus::Completed);
        state.set_step_status("step-1", StepStatus::Pending);

        assert_eq!(state.todo.len(), 2);
        assert_eq!(state.step_status("plan"), Some(StepStatus::Completed));
        assert_eq!(state.step_status("step-1"), Some(StepStatus::Pending));
        assert_eq!(state.step_status("step-2"), None);
    }

    #[test]
    fn test_marker_desc_follows_checklist() {
        let mut state = RunState::new("s1", "重写求职信", None);
        state.checklist = vec![Step::new("分析需求"), Step::new("重写求职信")];
        state.set_step_status("plan", StepStatus::Completed);
        state.set_step_status("step-2", StepStatus::InProgress);
        state.set_step_status("step-2-validate", StepStatus::InProgress);

        let desc = |key: &str| {
            state
                .todo
                .iter()
                .find(|m| m.step == key)
                .map(|m| m.desc.clone())
                .unwrap()
        };
        assert_eq!(desc("plan"), "规划任务清单");
        assert_eq!(desc("step-2"), "重写求职信");
        assert_eq!(desc("step-2-validate"), "校验：重写求职信");

        // 重规划后同一个标记换成新清单的标题
        state.checklist = vec![Step::new("重写开头")];
        state.set_step_status("step-1", StepStatus::InProgress);
        assert_eq!(
            state.todo.iter().find(|m| m.step == "step-1").unwrap().desc,
            "重写开头"
        );
    }

    #[test]
    fn test_events_append_in_order() {
        let mut state = RunState::new("s1", "x", None);
        state.push_event("planner", EventStatus::Started, json!({}));
        state.push_event("planner", EventStatus::Ok, json!({"steps": 3}));
        let names: Vec<_> = state.events.iter().map(|e| e.status).collect();
        assert_eq!(names, vec![EventStatus::Started, EventStatus::Ok]);
    }

    #[test]
    fn test_input_preview_truncated() {
        let state = RunState::new("s1", &"长".repeat(300), None);
        assert_eq!(state.input_preview.chars().count(), 100);
    }

    #[test]
    fn test_interrupted_verdict_serialization() {
        let v = Validation::interrupted();
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["ok"], json!(false));
        assert_eq!(json["status"], json!("interrupted"));
    }
}
