//! 按智能体路由模型
//!
//! 澄清/简报、监督者、子研究、报告四类智能体可分别使用不同模型（如监督者用 deepseek-reasoner）；
//! 未单独配置的智能体回落到默认客户端。所有客户端统一包上 RetryingLlmClient。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{LlmClient, MockLlmClient, OpenAiClient, RetryConfig, RetryingLlmClient};
use crate::config::AppConfig;

/// 流程中的智能体角色（也用于台账中的用量归属）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Scope,
    Supervisor,
    Researcher,
    Reporter,
}

impl AgentRole {
    pub const ALL: [AgentRole; 4] = [
        AgentRole::Scope,
        AgentRole::Supervisor,
        AgentRole::Researcher,
        AgentRole::Reporter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Scope => "scope",
            AgentRole::Supervisor => "supervisor",
            AgentRole::Researcher => "researcher",
            AgentRole::Reporter => "reporter",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 模型路由表
#[derive(Clone)]
pub struct ModelRouter {
    default: Arc<dyn LlmClient>,
    routes: HashMap<AgentRole, Arc<dyn LlmClient>>,
}

impl ModelRouter {
    pub fn new(default: Arc<dyn LlmClient>) -> Self {
        Self {
            default,
            routes: HashMap::new(),
        }
    }

    pub fn with_route(mut self, role: AgentRole, client: Arc<dyn LlmClient>) -> Self {
        self.routes.insert(role, client);
        self
    }

    pub fn client_for(&self, role: AgentRole) -> Arc<dyn LlmClient> {
        self.routes
            .get(&role)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.default))
    }
}

/// 根据配置创建路由：provider=mock 或无任何 API Key 时使用 Mock
pub fn create_router_from_config(cfg: &AppConfig) -> ModelRouter {
    let provider = cfg.llm.provider.to_lowercase();
    let retry = RetryConfig::from(&cfg.llm.retry);
    let has_key = cfg.llm.api_key.is_some()
        || std::env::var("DEEPSEEK_API_KEY").is_ok()
        || std::env::var("OPENAI_API_KEY").is_ok();

    if provider == "mock" || !has_key {
        tracing::warn!("No API key set or provider is mock, using Mock LLM");
        return ModelRouter::new(Arc::new(MockLlmClient::default()));
    }

    let base = if provider == "deepseek" {
        tracing::info!("Using DeepSeek LLM ({})", cfg.llm.model);
        OpenAiClient::deepseek(Some(&cfg.llm.model), cfg.llm.api_key.as_deref())
    } else {
        tracing::info!("Using OpenAI-compatible LLM ({})", cfg.llm.model);
        OpenAiClient::new(
            cfg.llm.base_url.as_deref(),
            &cfg.llm.model,
            cfg.llm.api_key.as_deref(),
        )
    };

    let wrap = |client: OpenAiClient| -> Arc<dyn LlmClient> {
        Arc::new(RetryingLlmClient::new(Arc::new(client), retry))
    };

    let routing = &cfg.llm.routing;
    let overrides = [
        (AgentRole::Scope, &routing.scope),
        (AgentRole::Supervisor, &routing.supervisor),
        (AgentRole::Researcher, &routing.researcher),
        (AgentRole::Reporter, &routing.reporter),
    ];

    let mut router = ModelRouter::new(wrap(base.with_model(&cfg.llm.model)));
    for (role, model) in overrides {
        if let Some(model) = model {
            tracing::info!(agent = %role, model = %model, "model route");
            router = router.with_route(role, wrap(base.with_model(model)));
        }
    }
    router
}
