//! 动作策略：任务分类、标题路由、分析/元任务词表与「最终交付物」保证
//!
//! 所有匹配均不区分大小写。词表默认值见 `PolicySection::default`，部署可通过 [policy] 覆盖。

use std::collections::{BTreeMap, HashSet};

use crate::config::PolicySection;
use crate::plan::Step;

#[derive(Debug, Clone)]
struct Route {
    keywords: Vec<String>,
    tool: String,
}

#[derive(Debug, Clone)]
struct Classifier {
    any_of: Vec<Vec<String>>,
    action: String,
}

/// 由配置构建的只读策略
#[derive(Debug, Clone)]
pub struct ActionPolicy {
    default_action: String,
    default_final_tool: String,
    final_tool_by_action: BTreeMap<String, String>,
    final_tools: HashSet<String>,
    routes: Vec<Route>,
    classifiers: Vec<Classifier>,
    analysis_keywords: Vec<String>,
    meta_step_markers: Vec<String>,
    deliverable_keywords: Vec<String>,
    json_actions: HashSet<String>,
}

fn lower_all(items: &[String]) -> Vec<String> {
    items.iter().map(|s| s.to_lowercase()).collect()
}

fn contains_any(haystack: &str, needles: &[String]) -> bool {
    let h = haystack.to_lowercase();
    needles.iter().any(|n| h.contains(n.as_str()))
}

impl ActionPolicy {
    pub fn from_config(section: &PolicySection) -> Self {
        let final_tools = section
            .final_tool_by_action
            .values()
            .cloned()
            .chain(std::iter::once(section.default_final_tool.clone()))
            .collect();
        Self {
            default_action: section.default_action.clone(),
            default_final_tool: section.default_final_tool.clone(),
            final_tool_by_action: section.final_tool_by_action.clone(),
            final_tools,
            routes: section
                .routes
                .iter()
                .map(|r| Route {
                    keywords: lower_all(&r.keywords),
                    tool: r.tool.clone(),
                })
                .collect(),
            classifiers: section
                .classify_rules
                .iter()
                .map(|c| Classifier {
                    any_of: c.any_of.iter().map(|g| lower_all(g)).collect(),
                    action: c.action.clone(),
                })
                .collect(),
            analysis_keywords: lower_all(&section.analysis_keywords),
            meta_step_markers: lower_all(&section.meta_step_markers),
            deliverable_keywords: lower_all(&section.deliverable_keywords),
            json_actions: section.json_actions.iter().cloned().collect(),
        }
    }

    /// 根据用户输入猜测任务类型；无规则命中时为默认类型
    pub fn guess_action(&self, user_input: &str) -> String {
        let text = user_input.to_lowercase();
        self.classifiers
            .iter()
            .find(|c| {
                c.any_of
                    .iter()
                    .any(|group| !group.is_empty() && group.iter().all(|k| text.contains(k.as_str())))
            })
            .map(|c| c.action.clone())
            .unwrap_or_else(|| self.default_action.clone())
    }

    /// 按标题关键词路由到能力
    pub fn route_by_title(&self, title: &str) -> Option<String> {
        let t = title.to_lowercase();
        self.routes
            .iter()
            .find(|r| r.keywords.iter().any(|k| t.contains(k.as_str())))
            .map(|r| r.tool.clone())
    }

    pub fn is_analysis_step(&self, title: &str) -> bool {
        contains_any(title, &self.analysis_keywords)
    }

    pub fn is_meta_step(&self, title: &str) -> bool {
        contains_any(title, &self.meta_step_markers)
    }

    pub fn is_final_tool(&self, tool: &str) -> bool {
        self.final_tools.contains(tool)
    }

    /// 产出交付物的步骤：标题命中交付词，或 hint 属于最终能力集
    pub fn is_deliverable_step(&self, step: &Step) -> bool {
        contains_any(&step.title, &self.deliverable_keywords)
            || step
                .tool_hint
                .as_deref()
                .is_some_and(|h| self.is_final_tool(h))
    }

    pub fn final_tool_for(&self, action: &str) -> &str {
        self.final_tool_by_action
            .get(action)
            .map(String::as_str)
            .unwrap_or(&self.default_final_tool)
    }

    pub fn requires_json(&self, action: &str) -> bool {
        self.json_actions.contains(action)
    }

    /// 兜底的最终产出步骤
    pub fn final_step(&self, action: &str) -> Step {
        Step::new(format!("生成最终结果（{action}）"))
            .with_criteria(["满足用户目标", "不得包含解释性文字", "格式正确可直接交付"])
            .with_hint(self.final_tool_for(action))
    }

    /// 统一后处理：分析类步骤免校验；缺少最终产出步骤时追加一个
    pub fn normalize_steps(&self, mut steps: Vec<Step>, action: &str) -> Vec<Step> {
        for step in steps.iter_mut() {
            if self.is_analysis_step(&step.title) {
                step.need_validation = false;
            }
        }
        let has_final = steps
            .iter()
            .any(|s| s.tool_hint.as_deref().is_some_and(|h| self.is_final_tool(h)));
        if !has_final {
            steps.push(self.final_step(action));
        }
        steps
    }

    /// 多次规划失败后的最小三步清单：解析意图 → 执行主要动作 → 格式检查
    pub fn fallback_steps(&self, action: &str) -> Vec<Step> {
        vec![
            Step::new(format!("解析任务（{action}）"))
                .with_criteria(["明确目标与输出形式"])
                .without_validation(),
            Step::new(format!("执行主要动作（{action}）"))
                .with_criteria(["产物满足目标", "不得包含解释性文字"])
                .with_hint(self.final_tool_for(action)),
            Step::new("收尾与格式检查")
                .with_criteria(["格式正确", "可直接交付"])
                .without_validation(),
        ]
    }
}

impl Default for ActionPolicy {
    fn default() -> Self {
        Self::from_config(&PolicySection::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guess_action() {
        let p = ActionPolicy::default();
        assert_eq!(p.guess_action("帮我写一封推荐信"), "generate_recommendation");
        assert_eq!(p.guess_action("Polish my Statement"), "generate_statement");
        assert_eq!(p.guess_action("解析这份简历"), "parse_resume_text");
        assert_eq!(p.guess_action("please parse my resume"), "parse_resume_text");
        assert_eq!(p.guess_action("把这段话压缩一下"), "contract");
        assert_eq!(p.guess_action("扩写下面的段落"), "expand");
        assert_eq!(p.guess_action("给文档起个标题"), "name_document");
        assert_eq!(p.guess_action("rewrite this cover letter: hello"), "rewrite_letter");
    }

    #[test]
    fn test_route_by_title() {
        let p = ActionPolicy::default();
        assert_eq!(p.route_by_title("重写求职信").as_deref(), Some("rewrite_text"));
        assert_eq!(p.route_by_title("Expand the intro").as_deref(), Some("expand_text"));
        assert_eq!(p.route_by_title("撰写初稿"), None);
    }

    #[test]
    fn test_analysis_and_meta_vocabulary() {
        let p = ActionPolicy::default();
        assert!(p.is_analysis_step("分析用户需求"));
        assert!(p.is_analysis_step("Design the structure"));
        assert!(!p.is_analysis_step("重写求职信"));
        assert!(p.is_meta_step("解析任务（rewrite_letter）"));
        assert!(p.is_meta_step("收尾与格式检查"));
        assert!(!p.is_meta_step("重写求职信"));
    }

    #[test]
    fn test_normalize_appends_final_step() {
        let p = ActionPolicy::default();
        let steps = vec![Step::new("分析原文结构"), Step::new("撰写草稿")];
        let out = p.normalize_steps(steps, "expand");

        assert_eq!(out.len(), 3);
        assert!(!out[0].need_validation);
        assert!(out[1].need_validation);
        assert_eq!(out[2].tool_hint.as_deref(), Some("expand_text"));
    }

    #[test]
    fn test_normalize_keeps_existing_final_step() {
        let p = ActionPolicy::default();
        let steps = vec![Step::new("润色").with_hint("rewrite_text")];
        let out = p.normalize_steps(steps, "rewrite_letter");
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_deliverable_detection() {
        let p = ActionPolicy::default();
        assert!(p.is_deliverable_step(&Step::new("生成推荐信")));
        assert!(p.is_deliverable_step(&Step::new("收尾").with_hint("name_document")));
        assert!(!p.is_deliverable_step(&Step::new("收尾").with_hint("evaluate_resume")));
    }

    #[test]
    fn test_fallback_steps_shape() {
        let p = ActionPolicy::default();
        let steps = p.fallback_steps("rewrite_letter");
        assert_eq!(steps.len(), 3);
        assert!(!steps[0].need_validation);
        assert_eq!(steps[1].tool_hint.as_deref(), Some("rewrite_text"));
        assert!(!steps[2].need_validation);
    }
}
