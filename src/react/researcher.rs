//! 研究子智能体
//!
//! 每个委派主题一个全新实例，私有历史以主题为第一条消息：
//! think（带 search / reflect 动作调用模型）⇄ act（按顺序执行动作）→ compress（总结为压缩发现）。
//! think 次数受 max_steps 限制，到达上限后直接进入 compress。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::ResearchError;
use crate::llm::AgentRole;
use crate::memory::{ActionResult, Message, Role};
use crate::react::{PromptKey, PromptLibrary, Reasoner, ReasoningRequest};
use crate::tools::ToolExecutor;
use crate::workflow::RunContext;

/// 一个主题的研究结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchFindings {
    pub topic: String,
    /// 压缩后的发现（进入 notes）
    pub compressed_research: String,
    /// 工具输出与模型回复拼接的原始记录（进入 raw_notes）
    pub raw_notes: String,
}

/// 子研究执行者（委派研究的扇出目标）
#[async_trait]
pub trait SubResearcher: Send + Sync {
    async fn research(&self, topic: &str, ctx: &RunContext) -> Result<ResearchFindings, ResearchError>;
}

/// 基于 Reasoner 与工具箱的研究子智能体
pub struct ResearchAgent {
    reasoner: Arc<Reasoner>,
    tools: ToolExecutor,
    prompts: Arc<PromptLibrary>,
    max_steps: u32,
}

impl ResearchAgent {
    pub fn new(reasoner: Arc<Reasoner>, tools: ToolExecutor, prompts: Arc<PromptLibrary>, max_steps: u32) -> Self {
        Self {
            reasoner,
            tools,
            prompts,
            max_steps: max_steps.max(1),
        }
    }

    async fn compress(
        &self,
        topic: &str,
        history: &[Message],
        ctx: &RunContext,
    ) -> Result<ResearchFindings, ResearchError> {
        let system = self.prompts.render(PromptKey::CompressSystem, &[]);
        let mut messages = history.to_vec();
        messages.push(Message::user(
            self.prompts
                .render(PromptKey::CompressHuman, &[("research_topic", topic)]),
        ));
        let response = self.reasoner.invoke_text(system, &messages).await?;
        ctx.emit_usage(AgentRole::Researcher, response.usage);

        Ok(ResearchFindings {
            topic: topic.to_string(),
            compressed_research: response.text,
            raw_notes: raw_notes(history),
        })
    }
}

/// 工具消息与助手消息的内容按顺序拼接
fn raw_notes(history: &[Message]) -> String {
    history
        .iter()
        .filter(|m| matches!(m.role, Role::Tool | Role::Assistant))
        .map(|m| m.content.as_str())
        .filter(|c| !c.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl SubResearcher for ResearchAgent {
    async fn research(&self, topic: &str, ctx: &RunContext) -> Result<ResearchFindings, ResearchError> {
        let system = self.prompts.render(PromptKey::Researcher, &[]);
        let actions = self.tools.action_specs();
        let mut history = vec![Message::user(topic)];

        let mut step = 0;
        loop {
            if ctx.cancel.is_cancelled() {
                return Err(ResearchError::Cancelled);
            }
            if step >= self.max_steps {
                tracing::warn!(topic = %topic, max_steps = self.max_steps, "researcher step cap reached, compressing");
                break;
            }

            let request = ReasoningRequest::new(system.clone(), &history)
                .with_actions(actions.clone())
                .with_call_prefix(format!("step_{step}"));
            let response = self.reasoner.invoke(request).await?;
            ctx.emit_usage(AgentRole::Researcher, response.usage);
            history.push(response.to_message());
            step += 1;

            if response.action_requests.is_empty() {
                break;
            }
            for request in &response.action_requests {
                tracing::debug!(topic = %topic, tool = %request.name, id = %request.id, "researcher action");
                let content = self
                    .tools
                    .execute(&request.name, request.arguments.clone())
                    .await?;
                history.push(ActionResult::for_request(request, content).into_message());
            }
        }

        self.compress(topic, &history, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::tools::{ReflectTool, Tool, ToolRegistry};
    use serde_json::Value;

    struct StubSearch;

    #[async_trait]
    impl Tool for StubSearch {
        fn name(&self) -> &str {
            "search"
        }

        fn description(&self) -> &str {
            "stub search"
        }

        async fn execute(&self, args: Value) -> Result<String, String> {
            Ok(format!("results for {}", args["query"].as_str().unwrap_or("")))
        }
    }

    fn executor() -> ToolExecutor {
        let mut registry = ToolRegistry::new();
        registry.register(StubSearch);
        registry.register(ReflectTool);
        ToolExecutor::new(registry, 5)
    }

    fn agent(llm: Arc<MockLlmClient>, max_steps: u32) -> ResearchAgent {
        ResearchAgent::new(
            Arc::new(Reasoner::new(llm)),
            executor(),
            Arc::new(PromptLibrary::builtin()),
            max_steps,
        )
    }

    /// 有 tool 结果之前发起搜索；看到结果后停止；压缩请求返回摘要
    fn scripted_researcher(messages: &[Message]) -> String {
        let last = messages.last().map(|m| m.content.as_str()).unwrap_or("");
        if last.contains("Produce the cleaned-up findings") {
            return "compressed findings".into();
        }
        if messages.iter().any(|m| m.role == Role::Tool) {
            "I have enough information.".into()
        } else {
            r#"{"tool_calls": [{"tool": "search", "args": {"query": "tokio"}}]}"#.into()
        }
    }

    #[tokio::test]
    async fn test_think_act_compress() {
        let llm = Arc::new(MockLlmClient::new(scripted_researcher));
        let findings = agent(llm.clone(), 6)
            .research("tokio scheduler", &RunContext::new("t"))
            .await
            .unwrap();
        assert_eq!(findings.topic, "tokio scheduler");
        assert_eq!(findings.compressed_research, "compressed findings");
        assert_eq!(findings.raw_notes, "results for tokio\nI have enough information.");
        assert_eq!(llm.calls(), 3);
    }

    #[tokio::test]
    async fn test_step_cap_forces_compress() {
        let llm = Arc::new(MockLlmClient::new(|messages: &[Message]| {
            let last = messages.last().map(|m| m.content.as_str()).unwrap_or("");
            if last.contains("Produce the cleaned-up findings") {
                "partial".into()
            } else {
                r#"{"tool": "reflect", "args": {"reflection": "keep going"}}"#.into()
            }
        }));
        let findings = agent(llm.clone(), 2)
            .research("endless", &RunContext::new("t"))
            .await
            .unwrap();
        assert_eq!(findings.compressed_research, "partial");
        assert_eq!(llm.calls(), 3);
    }

    #[tokio::test]
    async fn test_unknown_tool_aborts() {
        let llm = Arc::new(MockLlmClient::new(|_| {
            r#"{"tool_calls": [{"tool": "browse", "args": {}}]}"#.into()
        }));
        let err = agent(llm, 3)
            .research("x", &RunContext::new("t"))
            .await
            .unwrap_err();
        assert!(matches!(err, ResearchError::ActionExecution { ref name, .. } if name == "browse"));
    }
}
