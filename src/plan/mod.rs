//! 清单层：Step/Plan 数据模型、模型输出解析、动作策略表

pub mod parse;
pub mod policy;
pub mod types;

pub use parse::{
    extract_json_span, parse_plan_response, parse_review_response, parse_verdict_response,
    OneOrMany, ParseError, PlanDraft, ReviewDraft, StepDraft, VerdictDraft,
};
pub use policy::ActionPolicy;
pub use types::{Plan, ReviewResult, Step, StepStatus};
