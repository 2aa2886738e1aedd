//! 清单数据模型：Step / Plan / ReviewResult
//!
//! Step 的状态只允许 pending → in_progress → {completed | failed}，重试时由 in_progress 退回 pending。

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// 子任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::InProgress => "in_progress",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 清单中的一个子任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub title: String,
    pub accept_criteria: Vec<String>,
    pub need_validation: bool,
    pub status: StepStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    /// 要调用的外部能力；None 时交给上游 agent 自选
    pub tool_hint: Option<String>,
    /// 执行产出，至少包含 "text"
    pub outputs: BTreeMap<String, serde_json::Value>,
}

impl Step {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            accept_criteria: Vec::new(),
            need_validation: true,
            status: StepStatus::Pending,
            attempts: 0,
            max_attempts: 2,
            tool_hint: None,
            outputs: BTreeMap::new(),
        }
    }

    pub fn with_criteria<I, S>(mut self, criteria: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.accept_criteria = criteria.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.tool_hint = Some(hint.into());
        self
    }

    pub fn without_validation(mut self) -> Self {
        self.need_validation = false;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// pending → in_progress 并计一次尝试；额度用尽或状态不对时拒绝
    pub fn begin_attempt(&mut self) -> bool {
        if self.status != StepStatus::Pending || !self.has_attempts_left() {
            return false;
        }
        self.status = StepStatus::InProgress;
        self.attempts += 1;
        true
    }

    /// in_progress → pending，等待下一次尝试
    pub fn requeue(&mut self) -> bool {
        if self.status != StepStatus::InProgress {
            return false;
        }
        self.status = StepStatus::Pending;
        true
    }

    /// 设置终态；已是终态则忽略
    pub fn finish(&mut self, status: StepStatus) -> bool {
        if !status.is_terminal() || self.status.is_terminal() {
            return false;
        }
        self.status = status;
        true
    }

    /// 「已完成或免校验」：整体 done 判定的单步条件
    pub fn is_satisfied(&self) -> bool {
        self.status == StepStatus::Completed || !self.need_validation
    }

    /// 主文本产出：优先 "final"，其次 "text"
    pub fn primary_text(&self) -> Option<&str> {
        ["final", "text"]
            .iter()
            .find_map(|k| self.outputs.get(*k).and_then(|v| v.as_str()))
    }
}

/// Planner / Reviewer 产出的清单，由编排器消费一次后丢弃
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub feasible: bool,
    pub rationale: String,
    pub steps: Vec<Step>,
}

impl Plan {
    pub fn rejected(rationale: impl Into<String>) -> Self {
        Self {
            feasible: false,
            rationale: rationale.into(),
            steps: Vec::new(),
        }
    }
}

/// 整体复评结果；revised_steps 为空表示不重规划
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewResult {
    pub overall_ok: bool,
    pub rationale: String,
    pub revised_steps: Vec<Step>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_lifecycle_respects_ceiling() {
        let mut step = Step::new("重写求职信").with_max_attempts(2);
        assert!(step.begin_attempt());
        assert!(step.requeue());
        assert!(step.begin_attempt());
        assert!(step.requeue());
        // 第三次不允许
        assert!(!step.begin_attempt());
        assert_eq!(step.attempts, 2);
        assert!(step.attempts <= step.max_attempts);
    }

    #[test]
    fn test_in_progress_only_from_pending() {
        let mut step = Step::new("x");
        assert!(step.begin_attempt());
        assert!(!step.begin_attempt());
        assert!(step.finish(StepStatus::Completed));
        assert!(!step.begin_attempt());
    }

    #[test]
    fn test_single_terminal_status() {
        let mut step = Step::new("x");
        step.begin_attempt();
        assert!(step.finish(StepStatus::Failed));
        assert!(!step.finish(StepStatus::Completed));
        assert_eq!(step.status, StepStatus::Failed);
        assert!(!step.finish(StepStatus::Pending));
    }

    #[test]
    fn test_primary_text_prefers_final() {
        let mut step = Step::new("x");
        step.outputs.insert("text".into(), "草稿".into());
        assert_eq!(step.primary_text(), Some("草稿"));
        step.outputs.insert("final".into(), "定稿".into());
        assert_eq!(step.primary_text(), Some("定稿"));
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&StepStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
    }
}
