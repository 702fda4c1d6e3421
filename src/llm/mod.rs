//! LLM 层：客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）、重试、按智能体路由、嵌入

pub mod embedding;
pub mod mock;
pub mod openai;
pub mod router;
pub mod traits;

pub use embedding::{create_embedder_from_config, EmbeddingProvider, OpenAiEmbedder};
pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, DEEPSEEK_BASE_URL, DEEPSEEK_CHAT};
pub use router::{create_router_from_config, AgentRole, ModelRouter};
pub use traits::{Completion, LlmClient, LlmError, RetryConfig, RetryingLlmClient, Usage};
