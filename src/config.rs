//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `QUILL__*` 覆盖（双下划线表示嵌套，如 `QUILL__ORCHESTRATOR__PLAN_MAX_LOOPS=5`）。

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub retry: RetrySection,
    pub orchestrator: OrchestratorSection,
    pub validator: ValidatorSection,
    pub policy: PolicySection,
    pub store: StoreSection,
    pub observer: ObserverSection,
}

/// [app] 段：应用名、数据目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 运行状态落盘目录
    pub data_dir: PathBuf,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            data_dir: PathBuf::from("./run_store"),
        }
    }
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// openai（任意 OpenAI 兼容端点）/ mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub temperature: f32,
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "deepseek-ai/DeepSeek-V3".to_string(),
            base_url: None,
            temperature: 0.3,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    /// 单次请求超时（秒）
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self { request: 60 }
    }
}

/// [retry] 段：外部调用的指数退避 + 抖动
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub attempts: u32,
    pub base_ms: u64,
    pub jitter_ms: u64,
    /// 全部失败后回显用户输入
    pub echo_fallback: bool,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_ms: 600,
            jitter_ms: 300,
            echo_fallback: true,
        }
    }
}

/// [orchestrator] 段：规划轮数、单步尝试上限、验收阈值、整体重规划上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub plan_max_loops: u32,
    pub step_max_attempts: u32,
    pub pass_threshold: f64,
    pub overall_replan_max: u32,
    /// Planner 读取的近期对话条数
    pub history_turns: usize,
    pub history_max_chars: usize,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            plan_max_loops: 3,
            step_max_attempts: 2,
            pass_threshold: 0.75,
            overall_replan_max: 1,
            history_turns: 6,
            history_max_chars: 800,
        }
    }
}

/// [validator] 段：规则硬校验参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValidatorSection {
    pub max_output_chars: usize,
    /// 出现即判定为「解释性/过程性文字」
    pub explain_markers: Vec<String>,
}

impl Default for ValidatorSection {
    fn default() -> Self {
        Self {
            max_output_chars: 20_000,
            explain_markers: [
                "以下是",
                "Explanation",
                "解析：",
                "步骤：",
                "过程：",
                "我将",
                "我会",
                "工具调用",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

/// 标题关键词 → 能力名
#[derive(Debug, Clone, Deserialize)]
pub struct RouteRule {
    pub keywords: Vec<String>,
    pub tool: String,
}

/// 用户输入 → 任务类型；`any_of` 中任一组关键词全部命中即匹配
#[derive(Debug, Clone, Deserialize)]
pub struct ClassifyRule {
    pub any_of: Vec<Vec<String>>,
    pub action: String,
}

/// [policy] 段：交付物能力表、路由表与各类词表（部署可覆盖）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicySection {
    pub default_action: String,
    pub default_final_tool: String,
    /// 任务类型 → 产出最终交付物的能力
    pub final_tool_by_action: BTreeMap<String, String>,
    pub routes: Vec<RouteRule>,
    pub classify_rules: Vec<ClassifyRule>,
    /// 分析/元任务标题词：命中则不做校验
    pub analysis_keywords: Vec<String>,
    /// Executor 直接返回分析信息、不调用外部能力的标题词
    pub meta_step_markers: Vec<String>,
    /// 产出交付物的标题词：命中则追加规则硬校验
    pub deliverable_keywords: Vec<String>,
    /// 输出必须是合法 JSON 的任务类型/能力
    pub json_actions: Vec<String>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn route(keywords: &[&str], tool: &str) -> RouteRule {
    RouteRule {
        keywords: strings(keywords),
        tool: tool.to_string(),
    }
}

fn classify(groups: &[&[&str]], action: &str) -> ClassifyRule {
    ClassifyRule {
        any_of: groups.iter().map(|g| strings(g)).collect(),
        action: action.to_string(),
    }
}

impl Default for PolicySection {
    fn default() -> Self {
        let final_tool_by_action = [
            ("expand", "expand_text"),
            ("contract", "contract_text"),
            ("rewrite_letter", "rewrite_text"),
            ("generate_statement", "generate_statement"),
            ("generate_recommendation", "generate_recommendation"),
            ("name_document", "name_document"),
            ("parse_resume_text", "parse_resume_text"),
        ]
        .into_iter()
        .map(|(a, t)| (a.to_string(), t.to_string()))
        .collect();

        Self {
            default_action: "rewrite_letter".to_string(),
            default_final_tool: "rewrite_text".to_string(),
            final_tool_by_action,
            routes: vec![
                route(&["解析简历", "parse", "简历"], "parse_resume_text"),
                route(&["重写", "rewrite", "改写"], "rewrite_text"),
                route(&["扩写", "expand", "丰富"], "expand_text"),
                route(&["精简", "压缩", "contract"], "contract_text"),
                route(&["评估", "打分", "evaluate"], "evaluate_resume"),
                route(&["个人陈述", "statement", "SOP"], "generate_statement"),
                route(&["推荐信", "recommendation"], "generate_recommendation"),
                route(&["命名", "标题", "name"], "name_document"),
            ],
            classify_rules: vec![
                classify(&[&["推荐"]], "generate_recommendation"),
                classify(&[&["陈述"], &["ps"], &["statement"]], "generate_statement"),
                classify(&[&["解析", "简历"], &["parse", "resume"]], "parse_resume_text"),
                classify(&[&["精简"], &["压缩"], &["contract"]], "contract"),
                classify(&[&["扩写"], &["expand"]], "expand"),
                classify(&[&["命名"], &["标题"]], "name_document"),
            ],
            analysis_keywords: strings(&[
                "分析", "确定", "设计", "制定", "规划", "标准", "流程", "框架", "方案", "criterion",
                "criteria", "plan", "design", "spec", "质量监控", "验证标准",
            ]),
            meta_step_markers: strings(&["解析任务", "分析需求", "检查格式", "格式检查"]),
            deliverable_keywords: strings(&[
                "执行", "生成", "重写", "扩写", "精简", "推荐", "陈述", "命名", "解析", "评估",
            ]),
            json_actions: strings(&["parse_resume_text"]),
        }
    }
}

/// 持久化后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackendKind {
    Sqlite,
    File,
    Memory,
}

/// [store] 段：运行状态的慢速持久层
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub backend: StoreBackendKind,
    /// sqlite 为数据库文件，file 为目录；未设置时放在 app.data_dir 下
    pub path: Option<PathBuf>,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: StoreBackendKind::Sqlite,
            path: None,
        }
    }
}

/// [observer] 段：状态轮询间隔与最长等待
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObserverSection {
    pub poll_interval_ms: u64,
    pub max_wait_secs: u64,
}

impl Default for ObserverSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            max_wait_secs: 300,
        }
    }
}

/// 从 config 目录加载配置，环境变量 QUILL__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 QUILL__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("QUILL")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
