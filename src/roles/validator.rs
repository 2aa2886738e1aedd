//! Validator：逐步验收
//!
//! 语义判断（LLM）给出 passed/score/must_fix；交付类步骤再叠加规则硬校验，
//! 规则失败直接判不通过。通过条件：passed && score >= 阈值 && 规则全部满足。

use std::sync::Arc;

use crate::config::ValidatorSection;
use crate::llm::LlmClient;
use crate::memory::Message;
use crate::plan::{parse_verdict_response, ActionPolicy, Step, VerdictDraft};
use crate::roles::{steps_outline, TaskContext};

const VALIDATOR_SYSTEM_PROMPT: &str = "你是严格的 Validator。仅输出 JSON。";

/// 单步验收结论
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub passed: bool,
    pub feedback: String,
}

impl Verdict {
    fn pass(feedback: impl Into<String>) -> Self {
        Self {
            passed: true,
            feedback: feedback.into(),
        }
    }

    fn fail(feedback: impl Into<String>) -> Self {
        Self {
            passed: false,
            feedback: feedback.into(),
        }
    }
}

/// 交付物的确定性规则
#[derive(Debug, Clone)]
pub struct OutputRules {
    pub max_output_chars: usize,
    pub explain_markers: Vec<String>,
}

impl From<&ValidatorSection> for OutputRules {
    fn from(section: &ValidatorSection) -> Self {
        Self {
            max_output_chars: section.max_output_chars,
            explain_markers: section.explain_markers.clone(),
        }
    }
}

impl Default for OutputRules {
    fn default() -> Self {
        Self::from(&ValidatorSection::default())
    }
}

impl OutputRules {
    /// 返回全部违规项；为空表示通过
    pub fn check(&self, output: &str, require_json: bool) -> Vec<String> {
        let mut issues = Vec::new();
        if output.trim().is_empty() {
            issues.push("输出为空".to_string());
        }
        if self.explain_markers.iter().any(|m| output.contains(m.as_str())) {
            issues.push("包含解释性或过程性文字".to_string());
        }
        if require_json && serde_json::from_str::<serde_json::Value>(output).is_err() {
            issues.push("要求 JSON 输出但结果不是合法 JSON".to_string());
        }
        if output.chars().count() > self.max_output_chars {
            issues.push(format!("输出过长（>{} 字符）", self.max_output_chars));
        }
        issues
    }
}

pub struct Validator {
    llm: Arc<dyn LlmClient>,
    policy: Arc<ActionPolicy>,
    rules: OutputRules,
    pass_threshold: f64,
}

impl Validator {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        policy: Arc<ActionPolicy>,
        rules: OutputRules,
        pass_threshold: f64,
    ) -> Self {
        Self {
            llm,
            policy,
            rules,
            pass_threshold,
        }
    }

    pub async fn validate(&self, ctx: &TaskContext, step: &Step, all_steps: &[Step]) -> Verdict {
        if !step.need_validation {
            return Verdict::pass("无需校验");
        }

        let candidate = match candidate_text(step) {
            Some(text) => text,
            None if !step.outputs.is_empty() => {
                serde_json::to_string(&step.outputs).unwrap_or_default()
            }
            None => String::new(),
        };
        if candidate.is_empty() {
            return Verdict::fail("未产生可评审输出");
        }

        let judged = self.judge(ctx, step, all_steps, &candidate).await;
        let must_fix = judged.must_fix.clone().into_vec();
        let must_fix_suffix = if must_fix.is_empty() {
            String::new()
        } else {
            format!(" | 必改: {}", must_fix.join("; "))
        };

        if self.policy.is_deliverable_step(step) {
            let require_json = self.policy.requires_json(&ctx.action)
                || step
                    .tool_hint
                    .as_deref()
                    .is_some_and(|h| self.policy.requires_json(h));
            let issues = self.rules.check(&candidate, require_json);
            if !issues.is_empty() {
                tracing::debug!(trace_id = %ctx.trace_id, step = %step.title, ?issues, "Rule check failed");
                return Verdict::fail(format!("规则失败: {}{}", issues.join("; "), must_fix_suffix));
            }
        }

        let passed = judged.passed && judged.score >= self.pass_threshold;
        let mut feedback = judged.feedback;
        if !passed {
            feedback.push_str(&must_fix_suffix);
        }
        if feedback.is_empty() {
            feedback = if passed { "OK" } else { "分数不足" }.to_string();
        }
        Verdict { passed, feedback }
    }

    /// 语义判断；调用或解析失败按不通过、0 分处理
    async fn judge(&self, ctx: &TaskContext, step: &Step, all_steps: &[Step], candidate: &str) -> VerdictDraft {
        let criteria = serde_json::to_string(&step.accept_criteria).unwrap_or_default();
        let user = format!(
            "【当前子任务】{title}\n【任务清单】{outline}\n【验收标准】{criteria}\n【候选输出】<<<BEGIN>>>\n{candidate}\n<<<END>>>\n\n\
只输出：\n{{\n  \"passed\": true/false,\n  \"score\": 0.0~1.0,\n  \"must_fix\": [\"若不通过，列出必须修改点（简短可执行）\"],\n  \"feedback\": \"一句话结论\"\n}}",
            title = step.title,
            outline = steps_outline(all_steps),
        );
        let messages = vec![Message::system(VALIDATOR_SYSTEM_PROMPT), Message::user(user)];

        let unjudged = || VerdictDraft {
            passed: false,
            score: 0.0,
            must_fix: Default::default(),
            feedback: String::new(),
        };
        match self.llm.complete(&messages).await {
            Ok(reply) => parse_verdict_response(&reply).unwrap_or_else(|e| {
                tracing::debug!(trace_id = %ctx.trace_id, error = %e, "Unparseable verdict");
                unjudged()
            }),
            Err(e) => {
                tracing::warn!(trace_id = %ctx.trace_id, error = %e, "Validator LLM call failed");
                unjudged()
            }
        }
    }
}

/// 评审用候选文本：先 "text" 再 "final"，空串视为缺失
fn candidate_text(step: &Step) -> Option<String> {
    ["text", "final"].iter().find_map(|k| {
        step.outputs
            .get(*k)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;
    use serde_json::json;

    fn validator(llm: Arc<ScriptedLlmClient>) -> Validator {
        Validator::new(llm, Arc::new(ActionPolicy::default()), OutputRules::default(), 0.75)
    }

    fn ctx(action: &str) -> TaskContext {
        TaskContext::new("t", "s", action, "输入", Vec::new())
    }

    fn with_text(step: Step, text: &str) -> Step {
        let mut step = step;
        step.outputs.insert("text".into(), json!(text));
        step
    }

    #[tokio::test]
    async fn test_exempt_step_passes_without_llm() {
        let llm = Arc::new(ScriptedLlmClient::new());
        let step = Step::new("分析").without_validation();
        let v = validator(llm.clone()).validate(&ctx("expand"), &step, &[]).await;
        assert_eq!(v, Verdict::pass("无需校验"));
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_output_fails() {
        let llm = Arc::new(ScriptedLlmClient::new());
        let v = validator(llm).validate(&ctx("expand"), &Step::new("扩写"), &[]).await;
        assert_eq!(v, Verdict::fail("未产生可评审输出"));
    }

    #[tokio::test]
    async fn test_rule_failure_overrides_llm_pass() {
        let llm = Arc::new(ScriptedLlmClient::with_replies([
            r#"{"passed": true, "score": 0.95, "must_fix": ["删除开头"], "feedback": "好"}"#,
        ]));
        let step = with_text(
            Step::new("重写求职信").with_hint("rewrite_text"),
            "以下是改写后的求职信：……",
        );
        let v = validator(llm).validate(&ctx("rewrite_letter"), &step, &[]).await;
        assert!(!v.passed);
        assert!(v.feedback.starts_with("规则失败: 包含解释性或过程性文字"));
        assert!(v.feedback.ends_with(" | 必改: 删除开头"));
    }

    #[tokio::test]
    async fn test_score_below_threshold_fails() {
        let llm = Arc::new(ScriptedLlmClient::with_replies([
            r#"{"passed": true, "score": 0.5, "must_fix": "更具体", "feedback": "一般"}"#,
        ]));
        let step = with_text(Step::new("润色").with_hint("rewrite_text"), "正文");
        let v = validator(llm).validate(&ctx("rewrite_letter"), &step, &[]).await;
        assert!(!v.passed);
        assert_eq!(v.feedback, "一般 | 必改: 更具体");
    }

    #[tokio::test]
    async fn test_passes_with_score_at_threshold() {
        let llm = Arc::new(ScriptedLlmClient::with_replies([r#"{"passed": true, "score": 0.75}"#]));
        let step = with_text(Step::new("重写").with_hint("rewrite_text"), "正文");
        let v = validator(llm).validate(&ctx("rewrite_letter"), &step, &[]).await;
        assert_eq!(v, Verdict::pass("OK"));
    }

    #[tokio::test]
    async fn test_json_rule_for_parse_action() {
        let llm = Arc::new(ScriptedLlmClient::with_replies([r#"{"passed": true, "score": 1.0}"#]));
        let step = with_text(Step::new("解析简历").with_hint("parse_resume_text"), "姓名：张三");
        let v = validator(llm).validate(&ctx("parse_resume_text"), &step, &[]).await;
        assert!(!v.passed);
        assert!(v.feedback.contains("JSON"));
    }

    #[tokio::test]
    async fn test_unparseable_verdict_fails_with_default_feedback() {
        let llm = Arc::new(ScriptedLlmClient::with_replies(["看起来不错"]));
        let step = with_text(Step::new("润色正文"), "正文");
        let v = validator(llm).validate(&ctx("rewrite_letter"), &step, &[]).await;
        assert_eq!(v, Verdict::fail("分数不足"));
    }

    #[test]
    fn test_rules_length_limit() {
        let rules = OutputRules {
            max_output_chars: 3,
            explain_markers: Vec::new(),
        };
        assert!(rules.check("四个字符", false).iter().any(|i| i.contains("过长")));
        assert!(rules.check("三个字", false).is_empty());
    }
}
