//! Reviewer：整份清单执行完后的整体复评
//!
//! 不通过时可给出修订清单；修订清单同样经过分析步骤免校验与最终产出保证。

use std::sync::Arc;

use serde_json::{json, Value};

use crate::llm::LlmClient;
use crate::memory::{truncate_chars, Message};
use crate::plan::{parse_review_response, ActionPolicy, ReviewResult, Step};
use crate::roles::{steps_from_drafts, steps_outline, TaskContext};

const REVIEWER_SYSTEM_PROMPT: &str = "你是 Planner-Reviewer。你将收到：任务清单（含工具提示）、各步通过与产出，以及用户原始需求。\
请判断整体是否合理、是否达成用户目标。若不合理，请给出修订版子任务清单（2~8步）。严格只输出 JSON。";

pub struct Reviewer {
    llm: Arc<dyn LlmClient>,
    policy: Arc<ActionPolicy>,
}

impl Reviewer {
    pub fn new(llm: Arc<dyn LlmClient>, policy: Arc<ActionPolicy>) -> Self {
        Self { llm, policy }
    }

    pub async fn review(&self, ctx: &TaskContext, steps: &[Step]) -> ReviewResult {
        let user = format!(
            "【用户输入】{input}\n【任务清单】{outline}\n【执行结果摘要】{report}\n\n\
只输出：\n{{\n  \"overall_ok\": true/false,\n  \"rationale\": \"整体合理性判断依据；若为 false，指出关键缺口\",\n  \"revised_steps\": [\n    {{\n      \"title\": \"动词开头\",\n      \"accept_criteria\": [\"可测标准1\",\"标准2\"],\n      \"need_validation\": true,\n      \"tool_hint\": \"可选\"\n    }}\n  ]\n}}",
            input = ctx.user_input,
            outline = steps_outline(steps),
            report = steps_report(steps),
        );
        let messages = vec![Message::system(REVIEWER_SYSTEM_PROMPT), Message::user(user)];

        let reply = match self.llm.complete(&messages).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(trace_id = %ctx.trace_id, error = %e, "Reviewer LLM call failed");
                return ReviewResult {
                    overall_ok: false,
                    rationale: e.to_string(),
                    revised_steps: Vec::new(),
                };
            }
        };
        let draft = match parse_review_response(&reply) {
            Ok(d) => d,
            Err(e) => {
                tracing::debug!(trace_id = %ctx.trace_id, error = %e, "Unparseable review reply");
                return ReviewResult {
                    overall_ok: false,
                    rationale: String::new(),
                    revised_steps: Vec::new(),
                };
            }
        };

        let revised = steps_from_drafts(draft.revised_steps.unwrap_or_default(), &self.policy);
        // 空清单表示不重规划，不补最终步骤
        let revised_steps = if revised.is_empty() {
            revised
        } else {
            self.policy.normalize_steps(revised, &ctx.action)
        };
        ReviewResult {
            overall_ok: draft.overall_ok,
            rationale: draft.rationale,
            revised_steps,
        }
    }
}

/// 各步状态与产出预览
fn steps_report(steps: &[Step]) -> Value {
    Value::Array(
        steps
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let sample = s
                    .outputs
                    .get("text")
                    .and_then(Value::as_str)
                    .map(|t| truncate_chars(t, 200))
                    .unwrap_or_default();
                json!({
                    "idx": i + 1,
                    "title": s.title,
                    "status": s.status,
                    "need_validation": s.need_validation,
                    "tool_hint": s.tool_hint,
                    "outputs_keys": s.outputs.keys().collect::<Vec<_>>(),
                    "sample": sample,
                })
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;
    use crate::plan::StepStatus;

    fn reviewer(llm: Arc<ScriptedLlmClient>) -> Reviewer {
        Reviewer::new(llm, Arc::new(ActionPolicy::default()))
    }

    fn ctx() -> TaskContext {
        TaskContext::new("t", "s", "expand", "扩写这一段", Vec::new())
    }

    #[tokio::test]
    async fn test_approval_without_revision() {
        let llm = Arc::new(ScriptedLlmClient::with_replies([r#"{"overall_ok": true, "rationale": "达成"}"#]));
        let r = reviewer(llm).review(&ctx(), &[]).await;
        assert!(r.overall_ok);
        assert_eq!(r.rationale, "达成");
        assert!(r.revised_steps.is_empty());
    }

    #[tokio::test]
    async fn test_revision_gets_final_step() {
        let llm = Arc::new(ScriptedLlmClient::with_replies([
            r#"{"overall_ok": false, "rationale": "太短", "revised_steps": [{"title": "设计段落结构"}]}"#,
        ]));
        let r = reviewer(llm).review(&ctx(), &[]).await;
        assert!(!r.overall_ok);
        assert_eq!(r.revised_steps.len(), 2);
        assert!(!r.revised_steps[0].need_validation);
        assert_eq!(r.revised_steps[1].tool_hint.as_deref(), Some("expand_text"));
    }

    #[tokio::test]
    async fn test_report_contains_step_preview() {
        let llm = Arc::new(ScriptedLlmClient::with_replies([r#"{"overall_ok": true}"#]));
        let mut step = Step::new("扩写").with_hint("expand_text");
        step.status = StepStatus::Completed;
        step.outputs.insert("text".into(), json!("长".repeat(300)));

        reviewer(llm.clone()).review(&ctx(), &[step]).await;
        let prompt = &llm.received()[0][1].content;
        assert!(prompt.contains("\"status\":\"completed\""));
        assert!(prompt.contains(&"长".repeat(200)));
        assert!(!prompt.contains(&"长".repeat(201)));
    }
}
