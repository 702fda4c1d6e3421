//! 报告合成：根据研究简报与全部 notes 生成最终报告

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::ResearchError;
use crate::llm::AgentRole;
use crate::memory::Message;
use crate::react::{PromptKey, PromptLibrary, Reasoner};
use crate::stages::FINAL_REPORT;
use crate::workflow::{ResearchState, RunContext, Stage, StageOutcome, StateUpdate};

pub struct ReportStage {
    reasoner: Arc<Reasoner>,
    prompts: Arc<PromptLibrary>,
}

impl ReportStage {
    pub fn new(reasoner: Arc<Reasoner>, prompts: Arc<PromptLibrary>) -> Self {
        Self { reasoner, prompts }
    }
}

#[async_trait]
impl Stage for ReportStage {
    fn name(&self) -> &str {
        FINAL_REPORT
    }

    async fn run(&self, state: &ResearchState, ctx: &RunContext) -> Result<StageOutcome, ResearchError> {
        let brief = state.brief().unwrap_or_default();
        let findings = state.notes.join("\n");
        if findings.is_empty() {
            tracing::warn!(thread_id = %ctx.thread_id, "writing report without findings");
        }
        let prompt = self.prompts.render(
            PromptKey::FinalReport,
            &[("research_brief", brief), ("findings", &findings)],
        );
        let history = [Message::user(prompt)];
        let response = self
            .reasoner
            .invoke_text("You write the final research report.", &history)
            .await?;
        ctx.emit_usage(AgentRole::Reporter, response.usage);

        let report = response.text.trim().to_string();
        if report.is_empty() {
            return Err(ResearchError::InvalidOutput("empty final report".into()));
        }
        tracing::info!(thread_id = %ctx.thread_id, chars = report.len(), notes = state.notes.len(), "final report written");
        Ok(StageOutcome::end(
            StateUpdate::new()
                .final_report(report.clone())
                .message(Message::assistant(report)),
        ))
    }
}
