//! Planner：任务分解 + 可行性评估
//!
//! 不可行时把 rationale 作为反馈重新请求，最多 max_loops 轮；
//! 仍不可行且用户输入非空时退回固定三步清单，否则返回不可行。

use std::sync::Arc;

use crate::config::OrchestratorSection;
use crate::llm::LlmClient;
use crate::memory::{history_brief, Message};
use crate::plan::{parse_plan_response, ActionPolicy, Plan};
use crate::roles::{steps_from_drafts, TaskContext};

const PLANNER_SYSTEM_PROMPT: &str = "你是一名 Planner。请先分解用户任务为 2~8 个可执行子任务（steps），\
再做一次可行性评估（feasible=true/false，若 false 在 rationale 中说明阻碍与需要的信息）。\
每个子任务包含：title、accept_criteria[]、need_validation、tool_hint（可选）。严格只输出 JSON。";

const MIN_STEPS: usize = 2;
const MAX_STEPS: usize = 8;

pub struct Planner {
    llm: Arc<dyn LlmClient>,
    policy: Arc<ActionPolicy>,
    max_loops: u32,
    history_turns: usize,
    history_max_chars: usize,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>, policy: Arc<ActionPolicy>, max_loops: u32) -> Self {
        Self {
            llm,
            policy,
            max_loops: max_loops.max(1),
            history_turns: 6,
            history_max_chars: 800,
        }
    }

    pub fn from_config(
        llm: Arc<dyn LlmClient>,
        policy: Arc<ActionPolicy>,
        section: &OrchestratorSection,
    ) -> Self {
        Self {
            history_turns: section.history_turns,
            history_max_chars: section.history_max_chars,
            ..Self::new(llm, policy, section.plan_max_loops)
        }
    }

    pub async fn plan(&self, ctx: &TaskContext) -> Plan {
        let mut feedback = ctx.last_failed_feedback.trim().to_string();
        for round in 1..=self.max_loops {
            let plan = self.ask_for_plan(ctx, &feedback).await;
            let sized = (MIN_STEPS..=MAX_STEPS).contains(&plan.steps.len());
            if plan.feasible && sized {
                tracing::info!(trace_id = %ctx.trace_id, round, steps = plan.steps.len(), "Plan accepted");
                return plan;
            }
            tracing::debug!(
                trace_id = %ctx.trace_id,
                round,
                feasible = plan.feasible,
                steps = plan.steps.len(),
                "Plan rejected"
            );
            feedback = match plan.rationale.trim() {
                "" => "信息不足".to_string(),
                r => r.to_string(),
            };
        }

        if ctx.user_input.trim().is_empty() {
            let reason = if feedback.is_empty() {
                "多次尝试仍无法规划".to_string()
            } else {
                feedback
            };
            return Plan::rejected(reason);
        }

        tracing::warn!(trace_id = %ctx.trace_id, "Planning exhausted, using fallback checklist");
        Plan {
            feasible: true,
            rationale: format!("fallback: {}", feedback),
            steps: self.policy.fallback_steps(&ctx.action),
        }
    }

    async fn ask_for_plan(&self, ctx: &TaskContext, feedback: &str) -> Plan {
        let history = history_brief(&ctx.messages, self.history_turns, self.history_max_chars);
        let feedback = if feedback.is_empty() { "无" } else { feedback };
        let user = format!(
            "【任务类型】{action}\n【用户输入】{input}\n【近期历史】\n{history}\n【上次反馈/阻碍】{feedback}\n\n\
输出 JSON：\n{{\n  \"feasible\": true/false,\n  \"rationale\": \"可行/不可行的理由或信息缺口\",\n  \"steps\": [\n    {{\n      \"title\": \"动词开头\",\n      \"accept_criteria\": [\"可测标准1\",\"标准2\"],\n      \"need_validation\": true,\n      \"tool_hint\": \"rewrite_text / expand_text / parse_resume_text / ...\"\n    }}\n  ]\n}}",
            action = ctx.action,
            input = ctx.user_input,
        );
        let messages = vec![Message::system(PLANNER_SYSTEM_PROMPT), Message::user(user)];

        let reply = match self.llm.complete(&messages).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(trace_id = %ctx.trace_id, error = %e, "Planner LLM call failed");
                return Plan::rejected(e.to_string());
            }
        };
        let draft = match parse_plan_response(&reply) {
            Ok(d) => d,
            Err(e) => {
                tracing::debug!(trace_id = %ctx.trace_id, error = %e, "Unparseable plan reply");
                return Plan::rejected(String::new());
            }
        };

        let steps = steps_from_drafts(draft.steps, &self.policy);
        Plan {
            feasible: draft.feasible,
            rationale: draft.rationale,
            steps: self.policy.normalize_steps(steps, &ctx.action),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;

    fn ctx(input: &str) -> TaskContext {
        TaskContext::new("t1", "s1", "rewrite_letter", input, Vec::new())
    }

    fn planner(llm: Arc<ScriptedLlmClient>, loops: u32) -> Planner {
        Planner::new(llm, Arc::new(ActionPolicy::default()), loops)
    }

    #[tokio::test]
    async fn test_feasible_plan_gets_final_step() {
        let llm = Arc::new(ScriptedLlmClient::with_replies([r#"计划：{"feasible": true, "rationale": "ok",
            "steps": [{"title": "分析需求", "accept_criteria": "明确"}, {"title": "润色措辞"}]}"#]));
        let plan = planner(llm.clone(), 3).plan(&ctx("重写求职信")).await;

        assert!(plan.feasible);
        assert_eq!(plan.steps.len(), 3);
        assert!(!plan.steps[0].need_validation);
        assert_eq!(plan.steps[2].tool_hint.as_deref(), Some("rewrite_text"));
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn test_rationale_fed_back_between_rounds() {
        let llm = Arc::new(ScriptedLlmClient::with_replies([
            r#"{"feasible": false, "rationale": "缺少原文"}"#,
            r#"{"feasible": true, "steps": [{"title": "重写", "tool_hint": "rewrite_text"}, {"title": "命名"}]}"#,
        ]));
        let plan = planner(llm.clone(), 3).plan(&ctx("重写求职信")).await;
        assert!(plan.feasible);

        let second = &llm.received()[1];
        assert!(second[1].content.contains("【上次反馈/阻碍】缺少原文"));
    }

    #[tokio::test]
    async fn test_fallback_after_exhausted_loops() {
        let llm = Arc::new(ScriptedLlmClient::with_replies([
            r#"{"feasible": false, "rationale": "a"}"#,
            r#"{"feasible": false, "rationale": "b"}"#,
            r#"{"feasible": false}"#,
        ]));
        let plan = planner(llm.clone(), 3).plan(&ctx("重写求职信")).await;

        assert!(plan.feasible);
        assert_eq!(plan.rationale, "fallback: 信息不足");
        let titles: Vec<_> = plan.steps.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(
            titles,
            vec!["解析任务（rewrite_letter）", "执行主要动作（rewrite_letter）", "收尾与格式检查"]
        );
        assert_eq!(llm.calls(), 3);
    }

    #[tokio::test]
    async fn test_empty_input_reports_failure() {
        let llm = Arc::new(ScriptedLlmClient::with_replies([r#"{"feasible": false, "rationale": "没有内容"}"#]));
        let plan = planner(llm, 1).plan(&ctx("   ")).await;
        assert!(!plan.feasible);
        assert_eq!(plan.rationale, "没有内容");
        assert!(plan.steps.is_empty());
    }

    #[tokio::test]
    async fn test_too_many_steps_is_rejected() {
        let steps: Vec<String> = (0..9)
            .map(|i| format!(r#"{{"title": "重写第{}段"}}"#, i))
            .collect();
        let reply = format!(r#"{{"feasible": true, "steps": [{}]}}"#, steps.join(","));
        let llm = Arc::new(ScriptedLlmClient::with_replies([reply]));
        let plan = planner(llm, 1).plan(&ctx("重写")).await;
        assert!(plan.rationale.starts_with("fallback"));
        assert_eq!(plan.steps.len(), 3);
    }
}
