//! 模型输出解析
//!
//! 从夹带说明文字的回复中定位第一个括号平衡的 `{...}` / `[...]` 片段，再按固定结构反序列化。
//! 找不到 JSON 或结构不符都返回 ParseError，调用方自行决定如何处置，不在这里补默认值。

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 模型输出无法解析
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("no JSON object found in model output")]
    NoJson,

    #[error("invalid JSON structure: {source}; raw: {raw}")]
    Invalid {
        raw: String,
        #[source]
        source: serde_json::Error,
    },
}

/// 定位第一个括号平衡的 JSON 片段；引号内的括号不计入。
/// 找不到平衡片段时退回到「第一个开括号到最后一个闭括号」的贪婪匹配。
pub fn extract_json_span(text: &str) -> Option<&str> {
    let mut stack: Vec<char> = Vec::new();
    let mut start: Option<usize> = None;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' if !stack.is_empty() => in_string = true,
            '{' | '[' => {
                if stack.is_empty() {
                    start = Some(i);
                }
                stack.push(ch);
            }
            '}' | ']' => {
                let Some(open) = stack.pop() else { continue };
                if (open == '{' && ch != '}') || (open == '[' && ch != ']') {
                    continue;
                }
                if stack.is_empty() {
                    if let Some(s) = start {
                        return Some(&text[s..i + ch.len_utf8()]);
                    }
                }
            }
            _ => {}
        }
    }

    static GREEDY: OnceLock<Option<Regex>> = OnceLock::new();
    GREEDY
        .get_or_init(|| Regex::new(r"(?s)(\{.*\}|\[.*\])").ok())
        .as_ref()
        .and_then(|re| re.find(text))
        .map(|m| m.as_str())
}

fn parse_embedded<T: for<'de> Deserialize<'de>>(text: &str) -> Result<T, ParseError> {
    let span = extract_json_span(text).ok_or(ParseError::NoJson)?;
    serde_json::from_str(span).map_err(|source| ParseError::Invalid {
        raw: span.chars().take(300).collect(),
        source,
    })
}

/// 兼容「单个字符串」或「字符串数组」
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl Default for OneOrMany {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

impl OneOrMany {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) if s.trim().is_empty() => Vec::new(),
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

fn default_true() -> bool {
    true
}

/// 模型给出的单个子任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDraft {
    pub title: String,
    #[serde(default)]
    pub accept_criteria: OneOrMany,
    #[serde(default = "default_true")]
    pub need_validation: bool,
    #[serde(default)]
    pub tool_hint: Option<String>,
}

/// Planner 回复
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanDraft {
    pub feasible: bool,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub steps: Vec<StepDraft>,
}

/// Reviewer 回复
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewDraft {
    pub overall_ok: bool,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub revised_steps: Option<Vec<StepDraft>>,
}

/// Validator 的语义判断；score 缺省按 0 处理
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerdictDraft {
    pub passed: bool,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub must_fix: OneOrMany,
    #[serde(default)]
    pub feedback: String,
}

pub fn parse_plan_response(text: &str) -> Result<PlanDraft, ParseError> {
    parse_embedded(text)
}

pub fn parse_review_response(text: &str) -> Result<ReviewDraft, ParseError> {
    parse_embedded(text)
}

pub fn parse_verdict_response(text: &str) -> Result<VerdictDraft, ParseError> {
    let mut verdict: VerdictDraft = parse_embedded(text)?;
    verdict.score = if verdict.score.is_finite() {
        verdict.score.clamp(0.0, 1.0)
    } else {
        0.0
    };
    Ok(verdict)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_from_prose() {
        let text = "好的，计划如下：\n{\"a\": {\"b\": [1, 2]}} 以上。{\"c\": 1}";
        assert_eq!(extract_json_span(text), Some("{\"a\": {\"b\": [1, 2]}}"));
    }

    #[test]
    fn test_extract_ignores_braces_in_strings() {
        let text = r#"结果 {"title": "格式 {不平衡", "ok": true} 尾巴"#;
        assert_eq!(
            extract_json_span(text),
            Some(r#"{"title": "格式 {不平衡", "ok": true}"#)
        );
    }

    #[test]
    fn test_extract_skips_stray_closers() {
        let text = "} ] 然后 [1, 2]";
        assert_eq!(extract_json_span(text), Some("[1, 2]"));
    }

    #[test]
    fn test_extract_none_without_json() {
        assert_eq!(extract_json_span("纯文本回复"), None);
    }

    #[test]
    fn test_plan_round_trip_through_prose() {
        let draft = PlanDraft {
            feasible: true,
            rationale: "信息充分".into(),
            steps: vec![
                StepDraft {
                    title: "分析原文".into(),
                    accept_criteria: OneOrMany::Many(vec!["找出要点".into()]),
                    need_validation: false,
                    tool_hint: None,
                },
                StepDraft {
                    title: "重写求职信".into(),
                    accept_criteria: OneOrMany::One("语言自然".into()),
                    need_validation: true,
                    tool_hint: Some("rewrite_text".into()),
                },
            ],
        };
        let response = format!(
            "以下为规划结果：\n```json\n{}\n```\n请确认。",
            serde_json::to_string_pretty(&draft).unwrap()
        );

        let parsed = parse_plan_response(&response).unwrap();
        assert_eq!(parsed.steps.len(), draft.steps.len());
        let titles: Vec<_> = parsed.steps.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["分析原文", "重写求职信"]);
    }

    #[test]
    fn test_plan_missing_feasible_is_error() {
        let err = parse_plan_response(r#"{"steps": []}"#).unwrap_err();
        assert!(matches!(err, ParseError::Invalid { .. }));
    }

    #[test]
    fn test_plan_without_json_is_error() {
        assert!(matches!(
            parse_plan_response("无法规划"),
            Err(ParseError::NoJson)
        ));
    }

    #[test]
    fn test_verdict_score_is_clamped() {
        let v = parse_verdict_response(r#"{"passed": true, "score": 3.5, "must_fix": "去掉开头"}"#)
            .unwrap();
        assert_eq!(v.score, 1.0);
        assert_eq!(v.must_fix.into_vec(), vec!["去掉开头".to_string()]);
    }

    #[test]
    fn test_review_null_revised_steps() {
        let r = parse_review_response(r#"{"overall_ok": true, "rationale": "ok", "revised_steps": null}"#)
            .unwrap();
        assert!(r.overall_ok);
        assert!(r.revised_steps.is_none());
    }
}
