//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；支持 DeepSeek、OpenAI、自建代理等。
//! Tool 角色的消息以带前缀的 user 文本发送，动作协议由 Reasoner 负责。

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::{Completion, LlmClient, LlmError, Usage};
use crate::memory::{Message, Role};

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";

/// OpenAI 兼容客户端：持有 Client 与 model 名，complete 时转 Message 为 API 格式并取首条 content
#[derive(Clone)]
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
        }
    }

    /// DeepSeek 端点；密钥优先级：参数 > `DEEPSEEK_API_KEY` > `OPENAI_API_KEY`
    pub fn deepseek(model: Option<&str>, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("DEEPSEEK_API_KEY").ok());
        Self::new(
            Some(DEEPSEEK_BASE_URL),
            model.unwrap_or(DEEPSEEK_CHAT),
            api_key.as_deref(),
        )
    }

    /// 同一端点与密钥、不同模型（按智能体路由时使用）
    pub fn with_model(&self, model: &str) -> Self {
        Self {
            client: self.client.clone(),
            model: model.to_string(),
        }
    }

    fn to_openai_messages(
        &self,
        messages: &[Message],
    ) -> Result<Vec<ChatCompletionRequestMessage>, OpenAIError> {
        messages
            .iter()
            .map(|m| {
                let msg = match m.role {
                    Role::System => ChatCompletionRequestMessage::System(
                        ChatCompletionRequestSystemMessageArgs::default()
                            .content(m.content.clone())
                            .build()?,
                    ),
                    Role::User => ChatCompletionRequestMessage::User(
                        ChatCompletionRequestUserMessageArgs::default()
                            .content(m.content.clone())
                            .build()?,
                    ),
                    Role::Tool => ChatCompletionRequestMessage::User(
                        ChatCompletionRequestUserMessageArgs::default()
                            .content(format!(
                                "[result of {} #{}]\n{}",
                                m.name.as_deref().unwrap_or("action"),
                                m.tool_call_id.as_deref().unwrap_or("-"),
                                m.content
                            ))
                            .build()?,
                    ),
                    Role::Assistant => ChatCompletionRequestMessage::Assistant(
                        ChatCompletionRequestAssistantMessageArgs::default()
                            .content(m.content.clone())
                            .build()?,
                    ),
                };
                Ok(msg)
            })
            .collect()
    }
}

fn classify(err: OpenAIError) -> LlmError {
    match err {
        OpenAIError::Reqwest(e) if e.is_timeout() => LlmError::Timeout,
        OpenAIError::Reqwest(e) => LlmError::Transport(e.to_string()),
        other => {
            let text = other.to_string();
            let lower = text.to_lowercase();
            if lower.contains("rate limit") || lower.contains("429") {
                LlmError::RateLimited {
                    retry_after_ms: 1_000,
                }
            } else {
                LlmError::Api(text)
            }
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, messages: &[Message]) -> Result<Completion, LlmError> {
        let openai_messages = self
            .to_openai_messages(messages)
            .map_err(|e| LlmError::InvalidRequest(e.to_string()))?;
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(openai_messages)
            .build()
            .map_err(|e| LlmError::InvalidRequest(e.to_string()))?;

        let response = self.client.chat().create(request).await.map_err(classify)?;

        let usage = response
            .usage
            .as_ref()
            .map(|u| Usage::new(u.prompt_tokens as u64, u.completion_tokens as u64))
            .unwrap_or_default();

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or(LlmError::EmptyResponse)?;

        Ok(Completion::new(content, usage))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
