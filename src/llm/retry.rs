//! 带退避重试的 LLM 包装
//!
//! 第 i 次失败后等待 `base * 2^i + U(0, jitter)`；用尽次数后按配置回显最后一条 user 消息，或返回 Exhausted。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::config::RetrySection;
use crate::llm::{LlmClient, LlmError};
use crate::memory::{last_user_content, Message};

/// 重试参数
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub attempts: u32,
    pub base: Duration,
    pub jitter: Duration,
    /// 全部失败后回显最后一条 user 消息而不是报错
    pub echo_fallback: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            base: Duration::from_millis(600),
            jitter: Duration::from_millis(300),
            echo_fallback: true,
        }
    }
}

impl From<&RetrySection> for RetryConfig {
    fn from(section: &RetrySection) -> Self {
        Self {
            attempts: section.attempts.max(1),
            base: Duration::from_millis(section.base_ms),
            jitter: Duration::from_millis(section.jitter_ms),
            echo_fallback: section.echo_fallback,
        }
    }
}

impl RetryConfig {
    /// 第 `attempt` 次（从 0 开始）失败后的等待时长
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.base.saturating_mul(2u32.saturating_pow(attempt));
        let jitter_ms = self.jitter.as_millis() as u64;
        let extra = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        exp + Duration::from_millis(extra)
    }
}

/// 对任意 LlmClient 增加有界重试与回显兜底
pub struct RetryingLlmClient {
    inner: Arc<dyn LlmClient>,
    config: RetryConfig,
}

impl RetryingLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

#[async_trait]
impl LlmClient for RetryingLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let mut last_error = String::new();
        for attempt in 0..self.config.attempts {
            match self.inner.complete(messages).await {
                Ok(text) => return Ok(text),
                Err(e) => {
                    tracing::warn!(attempt = attempt + 1, error = %e, "LLM call failed");
                    // 最后一次失败后不再等待
                    if attempt + 1 < self.config.attempts {
                        let mut wait = self.config.backoff(attempt);
                        if let LlmError::RateLimited { retry_after_ms } = &e {
                            wait = wait.max(Duration::from_millis(*retry_after_ms));
                        }
                        tokio::time::sleep(wait).await;
                    }
                    last_error = e.to_string();
                }
            }
        }

        if self.config.echo_fallback {
            tracing::warn!(
                attempts = self.config.attempts,
                "LLM retries exhausted, echoing last user message"
            );
            return Ok(last_user_content(messages).to_string());
        }
        Err(LlmError::Exhausted {
            attempts: self.config.attempts,
            last_error,
        })
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.inner.token_usage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;

    fn fast(echo_fallback: bool) -> RetryConfig {
        RetryConfig {
            attempts: 3,
            base: Duration::from_millis(1),
            jitter: Duration::from_millis(1),
            echo_fallback,
        }
    }

    #[test]
    fn test_backoff_grows_exponentially() {
        let cfg = RetryConfig {
            attempts: 3,
            base: Duration::from_millis(100),
            jitter: Duration::ZERO,
            echo_fallback: false,
        };
        assert_eq!(cfg.backoff(0), Duration::from_millis(100));
        assert_eq!(cfg.backoff(1), Duration::from_millis(200));
        assert_eq!(cfg.backoff(2), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_jitter_bounded() {
        let cfg = RetryConfig {
            attempts: 3,
            base: Duration::from_millis(10),
            jitter: Duration::from_millis(5),
            echo_fallback: false,
        };
        for _ in 0..20 {
            let d = cfg.backoff(0);
            assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(15));
        }
    }

    #[tokio::test]
    async fn test_retry_recovers_after_transient_failure() {
        let inner = Arc::new(ScriptedLlmClient::new());
        inner.push_err(LlmError::Timeout);
        inner.push_ok("好的");
        let client = RetryingLlmClient::new(inner.clone(), fast(false));

        let out = client.complete(&[Message::user("hi")]).await.unwrap();
        assert_eq!(out, "好的");
        assert_eq!(inner.calls(), 2);
    }

    #[tokio::test]
    async fn test_rate_limited_waits_at_least_retry_after() {
        let inner = Arc::new(ScriptedLlmClient::new());
        inner.push_err(LlmError::RateLimited { retry_after_ms: 40 });
        inner.push_ok("好的");
        let client = RetryingLlmClient::new(inner.clone(), fast(false));

        let started = std::time::Instant::now();
        let out = client.complete(&[Message::user("hi")]).await.unwrap();
        assert_eq!(out, "好的");
        assert!(started.elapsed() >= Duration::from_millis(40));
        assert_eq!(inner.calls(), 2);
    }

    #[tokio::test]
    async fn test_retry_echoes_last_user_message_when_exhausted() {
        let inner = Arc::new(ScriptedLlmClient::new());
        for _ in 0..3 {
            inner.push_err(LlmError::ApiError("boom".into()));
        }
        let client = RetryingLlmClient::new(inner.clone(), fast(true));

        let msgs = vec![Message::system("sys"), Message::user("原文")];
        let out = client.complete(&msgs).await.unwrap();
        assert_eq!(out, "原文");
        assert_eq!(inner.calls(), 3);
    }

    #[tokio::test]
    async fn test_retry_reports_exhaustion_without_fallback() {
        let inner = Arc::new(ScriptedLlmClient::new());
        for _ in 0..3 {
            inner.push_err(LlmError::Timeout);
        }
        let client = RetryingLlmClient::new(inner, fast(false));

        let err = client.complete(&[Message::user("x")]).await.unwrap_err();
        assert!(matches!(err, LlmError::Exhausted { attempts: 3, .. }));
    }
}
