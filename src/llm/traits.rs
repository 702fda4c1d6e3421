//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Mock）实现 LlmClient::complete；
//! RetryingLlmClient 为任意后端加上有界指数退避重试，仅重试可重试错误。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::RetrySection;
use crate::memory::Message;

/// 单次调用的 token 使用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    pub fn add(&mut self, other: Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

/// 一次非流式完成：文本内容与用量
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub content: String,
    pub usage: Usage,
}

impl Completion {
    pub fn new(content: impl Into<String>, usage: Usage) -> Self {
        Self {
            content: content.into(),
            usage,
        }
    }
}

/// 推理后端错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("request timed out")]
    Timeout,

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("empty response from model")]
    EmptyResponse,
}

impl LlmError {
    /// 超时、限流、网络错误与空响应可重试；请求本身无效或 API 拒绝则不重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::Timeout
                | LlmError::RateLimited { .. }
                | LlmError::Transport(_)
                | LlmError::EmptyResponse
        )
    }
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成
    async fn complete(&self, messages: &[Message]) -> Result<Completion, LlmError>;

    /// 模型名（日志与台账使用）
    fn model_name(&self) -> &str {
        "unknown"
    }
}

/// 重试配置
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from(&RetrySection::default())
    }
}

impl From<&RetrySection> for RetryConfig {
    fn from(section: &RetrySection) -> Self {
        Self {
            max_attempts: section.max_attempts.max(1),
            base_delay_ms: section.base_delay_ms,
            max_delay_ms: section.max_delay_ms,
        }
    }
}

impl RetryConfig {
    /// 第 attempt 次失败后的等待时间（attempt 从 1 开始）
    pub fn delay_for(&self, attempt: u32, err: &LlmError) -> Duration {
        if let LlmError::RateLimited { retry_after_ms } = err {
            return Duration::from_millis((*retry_after_ms).min(self.max_delay_ms));
        }
        let exp = self
            .base_delay_ms
            .saturating_mul(1u64 << (attempt.saturating_sub(1)).min(16));
        Duration::from_millis(exp.min(self.max_delay_ms))
    }
}

/// 包装任意 LlmClient，对可重试错误做有界重试
pub struct RetryingLlmClient {
    inner: Arc<dyn LlmClient>,
    config: RetryConfig,
}

impl RetryingLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl LlmClient for RetryingLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<Completion, LlmError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.inner.complete(messages).await {
                Ok(completion) => return Ok(completion),
                Err(e) if e.is_retryable() && attempt < self.config.max_attempts => {
                    let delay = self.config.delay_for(attempt, &e);
                    tracing::warn!(
                        model = self.inner.model_name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "LLM call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}
