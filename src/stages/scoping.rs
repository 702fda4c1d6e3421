//! 范围界定：clarify 判断是否需要向用户追问，write_brief 把对话整理为研究简报

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;

use crate::core::ResearchError;
use crate::llm::AgentRole;
use crate::memory::{buffer_string, Message};
use crate::react::{PromptKey, PromptLibrary, Reasoner};
use crate::stages::{CLARIFY, SUPERVISE, WRITE_BRIEF};
use crate::workflow::{ResearchState, RunContext, Stage, StageOutcome, StateUpdate};

/// clarify 的结构化决策
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ClarifyDecision {
    /// 是否需要向用户追问
    pub need_clarification: bool,
    /// 追问的问题
    #[serde(default)]
    pub question: String,
    /// 不需要追问时，对将要研究内容的确认
    #[serde(default)]
    pub verification: String,
}

/// write_brief 的结构化输出
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ResearchQuestion {
    /// 指导后续研究的详细简报
    pub research_brief: String,
}

pub struct ClarifyStage {
    reasoner: Arc<Reasoner>,
    prompts: Arc<PromptLibrary>,
    enabled: bool,
}

impl ClarifyStage {
    pub fn new(reasoner: Arc<Reasoner>, prompts: Arc<PromptLibrary>) -> Self {
        Self {
            reasoner,
            prompts,
            enabled: true,
        }
    }

    /// 关闭后直接进入 write_brief
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

#[async_trait]
impl Stage for ClarifyStage {
    fn name(&self) -> &str {
        CLARIFY
    }

    async fn run(&self, state: &ResearchState, ctx: &RunContext) -> Result<StageOutcome, ResearchError> {
        if !self.enabled {
            return Ok(StageOutcome::goto(WRITE_BRIEF, StateUpdate::new()));
        }

        let system = self
            .prompts
            .render(PromptKey::Clarify, &[("messages", &buffer_string(&state.messages))]);
        let (decision, usage) = self
            .reasoner
            .invoke_structured::<ClarifyDecision>(system, &state.messages)
            .await?;
        ctx.emit_usage(AgentRole::Scope, usage);

        if decision.need_clarification {
            let question = decision.question.trim();
            if question.is_empty() {
                return Err(ResearchError::InvalidOutput(
                    "clarification requested without a question".into(),
                ));
            }
            tracing::info!(thread_id = %ctx.thread_id, "clarification required");
            return Ok(StageOutcome::await_input(
                StateUpdate::new().message(Message::assistant(question)),
            ));
        }

        let mut update = StateUpdate::new();
        if !decision.verification.trim().is_empty() {
            update = update.message(Message::assistant(decision.verification.trim()));
        }
        Ok(StageOutcome::goto(WRITE_BRIEF, update))
    }
}

pub struct WriteBriefStage {
    reasoner: Arc<Reasoner>,
    prompts: Arc<PromptLibrary>,
}

impl WriteBriefStage {
    pub fn new(reasoner: Arc<Reasoner>, prompts: Arc<PromptLibrary>) -> Self {
        Self { reasoner, prompts }
    }
}

#[async_trait]
impl Stage for WriteBriefStage {
    fn name(&self) -> &str {
        WRITE_BRIEF
    }

    async fn run(&self, state: &ResearchState, ctx: &RunContext) -> Result<StageOutcome, ResearchError> {
        let system = self
            .prompts
            .render(PromptKey::ResearchBrief, &[("messages", &buffer_string(&state.messages))]);
        let (question, usage) = self
            .reasoner
            .invoke_structured::<ResearchQuestion>(system, &state.messages)
            .await?;
        ctx.emit_usage(AgentRole::Scope, usage);

        let brief = question.research_brief.trim();
        if brief.is_empty() {
            return Err(ResearchError::InvalidOutput("empty research brief".into()));
        }
        tracing::info!(thread_id = %ctx.thread_id, brief_chars = brief.len(), "research brief written");
        Ok(StageOutcome::goto(
            SUPERVISE,
            StateUpdate::new()
                .research_brief(brief)
                .supervisor_message(Message::user(brief)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::memory::Role;
    use crate::workflow::Transition;

    fn stage_parts(output: &'static str) -> (Arc<Reasoner>, Arc<PromptLibrary>) {
        let llm = Arc::new(MockLlmClient::new(move |_| output.to_string()));
        (Arc::new(Reasoner::new(llm)), Arc::new(PromptLibrary::builtin()))
    }

    #[tokio::test]
    async fn test_clarify_asks_question() {
        let (reasoner, prompts) =
            stage_parts(r#"{"need_clarification": true, "question": "Which market?", "verification": ""}"#);
        let stage = ClarifyStage::new(reasoner, prompts);
        let state = ResearchState::from_input("research the market");
        let outcome = stage.run(&state, &RunContext::new("t")).await.unwrap();

        assert_eq!(outcome.next, Transition::AwaitInput);
        assert_eq!(outcome.update.messages.len(), 1);
        assert_eq!(outcome.update.messages[0].role, Role::Assistant);
        assert_eq!(outcome.update.messages[0].content, "Which market?");
        assert!(outcome.update.research_brief.is_none());
    }

    #[tokio::test]
    async fn test_clarify_verifies_and_moves_on() {
        let (reasoner, prompts) = stage_parts(
            r#"{"need_clarification": false, "question": "", "verification": "I will research Rust runtimes."}"#,
        );
        let stage = ClarifyStage::new(reasoner, prompts);
        let outcome = stage
            .run(&ResearchState::from_input("rust runtimes"), &RunContext::new("t"))
            .await
            .unwrap();
        assert_eq!(outcome.next, Transition::Goto(WRITE_BRIEF.into()));
        assert_eq!(outcome.update.messages[0].content, "I will research Rust runtimes.");
    }

    #[tokio::test]
    async fn test_clarify_disabled_skips_model() {
        let llm = Arc::new(MockLlmClient::default());
        let stage = ClarifyStage::new(Arc::new(Reasoner::new(llm.clone())), Arc::new(PromptLibrary::builtin()))
            .with_enabled(false);
        let outcome = stage
            .run(&ResearchState::from_input("x"), &RunContext::new("t"))
            .await
            .unwrap();
        assert_eq!(outcome.next, Transition::Goto(WRITE_BRIEF.into()));
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn test_write_brief_seeds_supervisor() {
        let (reasoner, prompts) = stage_parts(r#"{"research_brief": "Compare tokio and async-std."}"#);
        let stage = WriteBriefStage::new(reasoner, prompts);
        let outcome = stage
            .run(&ResearchState::from_input("tokio vs async-std"), &RunContext::new("t"))
            .await
            .unwrap();

        assert_eq!(outcome.next, Transition::Goto(SUPERVISE.into()));
        assert_eq!(outcome.update.research_brief.as_deref(), Some("Compare tokio and async-std."));
        assert_eq!(outcome.update.supervisor_messages.len(), 1);
        assert_eq!(outcome.update.supervisor_messages[0].role, Role::User);
    }

    #[tokio::test]
    async fn test_empty_brief_is_invalid_output() {
        let (reasoner, prompts) = stage_parts(r#"{"research_brief": "  "}"#);
        let err = WriteBriefStage::new(reasoner, prompts)
            .run(&ResearchState::from_input("x"), &RunContext::new("t"))
            .await
            .unwrap_err();
        assert!(matches!(err, ResearchError::InvalidOutput(_)));
    }
}
