//! LLM 层：文本生成抽象与实现（OpenAI 兼容 / Mock / 重试包装）

pub mod mock;
pub mod openai;
pub mod retry;
pub mod traits;

use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;

pub use mock::{MockLlmClient, ScriptedLlmClient};
pub use openai::{OpenAiClient, TokenUsage};
pub use retry::{RetryConfig, RetryingLlmClient};
pub use traits::{LlmClient, LlmError};

/// 根据配置与环境变量选择 LLM 后端（OpenAI 兼容 / Mock）
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let api_key = std::env::var("OPENAI_API_KEY").ok();

    if provider == "mock" || api_key.is_none() {
        tracing::warn!(provider = %provider, "No API key set or mock provider requested, using Mock LLM");
        return Arc::new(MockLlmClient);
    }

    tracing::info!(model = %cfg.llm.model, "Using OpenAI-compatible LLM");
    Arc::new(
        OpenAiClient::new(cfg.llm.base_url.as_deref(), &cfg.llm.model, api_key.as_deref())
            .with_request_timeout(Duration::from_secs(cfg.llm.timeouts.request))
            .with_temperature(cfg.llm.temperature),
    )
}
