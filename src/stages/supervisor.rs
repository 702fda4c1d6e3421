//! 监督循环：supervise ⇄ act_on_decisions
//!
//! supervise 调用模型决定下一批动作并计数；act_on_decisions 判断是否结束，
//! 否则按 reflect → memory_lookup → delegate_research 的顺序执行整批动作，
//! 委派研究并发扇出、全部完成后按请求顺序合并，任一失败则整批中止。

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use tokio::task::JoinSet;

use crate::config::AppConfig;
use crate::core::ResearchError;
use crate::llm::AgentRole;
use crate::memory::{self, ActionRequest, ActionResult, MemoryIndex, MemoryLookup, Message, Role};
use crate::react::{
    ActionSpec, PromptKey, PromptLibrary, Reasoner, ReasoningRequest, ResearchFindings, SubResearcher,
};
use crate::stages::{ACT_ON_DECISIONS, FINAL_REPORT, SUPERVISE};
use crate::tools::{reflection_recorded, ReflectArgs};
use crate::workflow::{ResearchState, RunContext, Stage, StageOutcome, StateUpdate, WorkflowEvent};

pub const REFLECT: &str = "reflect";
pub const MEMORY_LOOKUP: &str = "memory_lookup";
pub const DELEGATE_RESEARCH: &str = "delegate_research";
pub const RESEARCH_COMPLETE: &str = "research_complete";

/// 跳过委派时返回给监督者的内容前缀（不计入 notes）
const SKIPPED_PREFIX: &str = "Research skipped:";

/// delegate_research 的参数
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct DelegateResearchArgs {
    /// 交给子智能体的独立研究主题，需包含足够的上下文
    pub research_topic: String,
}

/// 监督者可用的动作（每批解码一次）
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorAction {
    Reflect { reflection: String },
    MemoryLookup,
    DelegateResearch { topic: String },
    ResearchComplete,
}

impl SupervisorAction {
    pub fn decode(request: &ActionRequest) -> Result<Self, ResearchError> {
        match request.name.as_str() {
            REFLECT => {
                let args: ReflectArgs = serde_json::from_value(request.arguments.clone())
                    .map_err(|e| ResearchError::action(REFLECT, format!("invalid arguments: {e}")))?;
                Ok(SupervisorAction::Reflect {
                    reflection: args.reflection,
                })
            }
            MEMORY_LOOKUP => Ok(SupervisorAction::MemoryLookup),
            DELEGATE_RESEARCH => {
                let args: DelegateResearchArgs = serde_json::from_value(request.arguments.clone())
                    .map_err(|e| ResearchError::action(DELEGATE_RESEARCH, format!("invalid arguments: {e}")))?;
                if args.research_topic.trim().is_empty() {
                    return Err(ResearchError::action(DELEGATE_RESEARCH, "empty research_topic"));
                }
                Ok(SupervisorAction::DelegateResearch {
                    topic: args.research_topic,
                })
            }
            RESEARCH_COMPLETE => Ok(SupervisorAction::ResearchComplete),
            other => Err(ResearchError::action(other, "unknown action")),
        }
    }
}

/// 暴露给监督者模型的动作
pub fn supervisor_actions(memory_enabled: bool) -> Vec<ActionSpec> {
    let mut actions = vec![
        ActionSpec::new(
            REFLECT,
            "Reflect on the findings so far, the remaining gaps and whether to delegate more research.",
        )
        .with_args::<ReflectArgs>(),
        ActionSpec::new(
            DELEGATE_RESEARCH,
            "Delegate one self-contained research topic to a sub-agent. Several may run in parallel.",
        )
        .with_args::<DelegateResearchArgs>(),
        ActionSpec::new(
            RESEARCH_COMPLETE,
            "Signal that the collected findings are sufficient to write the report.",
        ),
    ];
    if memory_enabled {
        actions.insert(
            1,
            ActionSpec::new(
                MEMORY_LOOKUP,
                "Look up earlier reports similar to the research brief before delegating new research.",
            ),
        );
    }
    actions
}

/// 监督循环参数
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub max_iterations: u32,
    pub max_concurrent: u32,
    pub memory_enabled: bool,
    pub distance_threshold: f32,
    pub top_k: usize,
    /// 记忆命中时清除 trigger_search
    pub clear_trigger_on_hit: bool,
    /// trigger_search 为 false 时跳过委派研究
    pub suppress_delegation_on_hit: bool,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            max_iterations: 6,
            max_concurrent: 3,
            memory_enabled: true,
            distance_threshold: 0.30,
            top_k: 10,
            clear_trigger_on_hit: true,
            suppress_delegation_on_hit: true,
        }
    }
}

impl From<&AppConfig> for SupervisorSettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            max_iterations: cfg.research.max_iterations,
            max_concurrent: cfg.research.max_concurrent_researchers,
            memory_enabled: cfg.memory.enabled,
            distance_threshold: cfg.memory.distance_threshold,
            top_k: cfg.memory.top_k,
            clear_trigger_on_hit: cfg.memory.clear_trigger_on_hit,
            suppress_delegation_on_hit: cfg.memory.suppress_delegation_on_hit,
        }
    }
}

/// supervise：一次决策步
pub struct SuperviseStage {
    reasoner: Arc<Reasoner>,
    prompts: Arc<PromptLibrary>,
    settings: SupervisorSettings,
}

impl SuperviseStage {
    pub fn new(reasoner: Arc<Reasoner>, prompts: Arc<PromptLibrary>, settings: SupervisorSettings) -> Self {
        Self {
            reasoner,
            prompts,
            settings,
        }
    }
}

#[async_trait]
impl Stage for SuperviseStage {
    fn name(&self) -> &str {
        SUPERVISE
    }

    async fn run(&self, state: &ResearchState, ctx: &RunContext) -> Result<StageOutcome, ResearchError> {
        if state.brief().is_none() {
            return Err(ResearchError::InvalidState(
                "research brief must be set before supervision".into(),
            ));
        }
        if state.research_iterations >= self.settings.max_iterations {
            tracing::warn!(
                thread_id = %ctx.thread_id,
                iteration = state.research_iterations,
                "iteration cap reached before supervise"
            );
            return Ok(StageOutcome::goto(ACT_ON_DECISIONS, StateUpdate::new()));
        }

        let system = self.prompts.render(
            PromptKey::Supervisor,
            &[
                ("max_iterations", &self.settings.max_iterations.to_string()),
                ("max_concurrent", &self.settings.max_concurrent.to_string()),
            ],
        );
        let request = ReasoningRequest::new(system, &state.supervisor_messages)
            .with_actions(supervisor_actions(self.settings.memory_enabled))
            .with_call_prefix(format!("call_{}", state.research_iterations));
        let response = self.reasoner.invoke(request).await?;
        ctx.emit_usage(AgentRole::Supervisor, response.usage);

        let iteration = state.research_iterations + 1;
        tracing::info!(
            thread_id = %ctx.thread_id,
            iteration,
            actions = response.action_requests.len(),
            "supervisor decided"
        );
        Ok(StageOutcome::goto(
            ACT_ON_DECISIONS,
            StateUpdate::new()
                .supervisor_message(response.to_message())
                .research_iterations(iteration),
        ))
    }
}

/// act_on_decisions：执行最近一次决策中的动作
pub struct ActOnDecisionsStage {
    researcher: Arc<dyn SubResearcher>,
    memory: Option<Arc<dyn MemoryIndex>>,
    settings: SupervisorSettings,
}

impl ActOnDecisionsStage {
    pub fn new(researcher: Arc<dyn SubResearcher>, settings: SupervisorSettings) -> Self {
        Self {
            researcher,
            memory: None,
            settings,
        }
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryIndex>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// 结束循环：notes 为全部委派结果与记忆命中内容（已有的部分不重复追加）
    fn finish(&self, state: &ResearchState, ctx: &RunContext, reason: &str) -> StageOutcome {
        let all = collect_notes(&state.supervisor_messages);
        let fresh: Vec<String> = all.into_iter().skip(state.notes.len()).collect();
        tracing::info!(
            thread_id = %ctx.thread_id,
            reason,
            iteration = state.research_iterations,
            notes = state.notes.len() + fresh.len(),
            "supervisor loop finished"
        );
        StageOutcome::goto(FINAL_REPORT, StateUpdate::new().notes(fresh))
    }

    async fn memory_lookup(&self, brief: &str) -> Result<MemoryLookup, ResearchError> {
        match (&self.memory, self.settings.memory_enabled) {
            (Some(index), true) => {
                memory::lookup(index.as_ref(), brief, self.settings.top_k, self.settings.distance_threshold).await
            }
            _ => {
                tracing::debug!("memory lookup requested but no memory index is configured");
                Ok(MemoryLookup {
                    needs_research: true,
                    serialized: String::new(),
                })
            }
        }
    }

    /// 并发执行全部委派；任一失败立即返回该错误（其余任务随 JoinSet 丢弃而取消）
    async fn fan_out(
        &self,
        topics: Vec<(usize, String)>,
        ctx: &RunContext,
    ) -> Result<Vec<(usize, ResearchFindings)>, ResearchError> {
        let mut set = JoinSet::new();
        for (slot, topic) in topics {
            let researcher = Arc::clone(&self.researcher);
            let ctx = ctx.clone();
            set.spawn(async move {
                let result = researcher.research(&topic, &ctx).await;
                (slot, result)
            });
        }

        let mut findings = Vec::with_capacity(set.len());
        while let Some(joined) = set.join_next().await {
            let (slot, result) = joined
                .map_err(|e| ResearchError::action(DELEGATE_RESEARCH, format!("sub-agent task failed: {e}")))?;
            match result {
                Ok(f) => findings.push((slot, f)),
                Err(e) => {
                    tracing::error!(thread_id = %ctx.thread_id, error = %e, "delegated research failed, aborting batch");
                    set.abort_all();
                    return Err(e);
                }
            }
        }
        findings.sort_by_key(|(slot, _)| *slot);
        Ok(findings)
    }
}

#[async_trait]
impl Stage for ActOnDecisionsStage {
    fn name(&self) -> &str {
        ACT_ON_DECISIONS
    }

    async fn run(&self, state: &ResearchState, ctx: &RunContext) -> Result<StageOutcome, ResearchError> {
        let requests: Vec<ActionRequest> = state
            .supervisor_messages
            .last()
            .filter(|m| m.role == Role::Assistant)
            .map(|m| m.action_requests.clone())
            .unwrap_or_default();

        if state.research_iterations >= self.settings.max_iterations {
            return Ok(self.finish(state, ctx, "iteration cap"));
        }
        if requests.is_empty() {
            return Ok(self.finish(state, ctx, "no actions"));
        }
        if requests.iter().any(|r| r.name == RESEARCH_COMPLETE) {
            return Ok(self.finish(state, ctx, "research complete"));
        }

        let actions = requests
            .iter()
            .map(SupervisorAction::decode)
            .collect::<Result<Vec<_>, _>>()?;
        for request in &requests {
            ctx.emit(WorkflowEvent::ActionDispatched {
                thread_id: ctx.thread_id.clone(),
                action: request.name.clone(),
                id: request.id.clone(),
            });
        }

        let mut results: Vec<Option<String>> = vec![None; requests.len()];
        let mut trigger_search = state.trigger_search;

        for (slot, action) in actions.iter().enumerate() {
            if let SupervisorAction::Reflect { reflection } = action {
                results[slot] = Some(reflection_recorded(reflection));
            }
        }

        let brief = state.brief().unwrap_or_default();
        for (slot, action) in actions.iter().enumerate() {
            if *action == SupervisorAction::MemoryLookup {
                let lookup = self.memory_lookup(brief).await?;
                if lookup.is_hit() && self.settings.clear_trigger_on_hit {
                    trigger_search = false;
                }
                results[slot] = Some(serde_json::to_string(&lookup)?);
            }
        }

        let topics: Vec<(usize, String)> = actions
            .iter()
            .enumerate()
            .filter_map(|(slot, a)| match a {
                SupervisorAction::DelegateResearch { topic } => Some((slot, topic.clone())),
                _ => None,
            })
            .collect();
        let mut raw_notes = Vec::new();
        if !topics.is_empty() {
            if !trigger_search && self.settings.suppress_delegation_on_hit {
                tracing::info!(thread_id = %ctx.thread_id, skipped = topics.len(), "memory hit, delegation skipped");
                for (slot, topic) in &topics {
                    results[*slot] = Some(format!(
                        "{SKIPPED_PREFIX} earlier reports already cover the brief; not researching \"{topic}\"."
                    ));
                }
            } else {
                tracing::info!(thread_id = %ctx.thread_id, count = topics.len(), "delegating research");
                for (slot, findings) in self.fan_out(topics, ctx).await? {
                    results[slot] = Some(findings.compressed_research);
                    raw_notes.push(findings.raw_notes);
                }
            }
        }

        let messages: Vec<Message> = requests
            .iter()
            .zip(results)
            .map(|(request, content)| ActionResult::for_request(request, content.unwrap_or_default()).into_message())
            .collect();

        let mut update = StateUpdate::new().supervisor_messages(messages).raw_notes(raw_notes);
        if trigger_search != state.trigger_search {
            update = update.trigger_search(trigger_search);
        }
        Ok(StageOutcome::goto(SUPERVISE, update))
    }
}

/// 从监督者对话中提取发现：委派研究的结果（跳过的除外）与命中的记忆内容
fn collect_notes(messages: &[Message]) -> Vec<String> {
    messages
        .iter()
        .filter(|m| m.role == Role::Tool)
        .filter_map(|m| match m.name.as_deref() {
            Some(DELEGATE_RESEARCH) if !m.content.starts_with(SKIPPED_PREFIX) => Some(m.content.clone()),
            Some(MEMORY_LOOKUP) => serde_json::from_str::<MemoryLookup>(&m.content)
                .ok()
                .filter(|l| l.is_hit())
                .map(|l| l.serialized),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::memory::{MemoryDocument, ScoredDocument};
    use crate::workflow::Transition;
    use std::time::Duration;

    struct EchoResearcher;

    #[async_trait]
    impl SubResearcher for EchoResearcher {
        async fn research(&self, topic: &str, _ctx: &RunContext) -> Result<ResearchFindings, ResearchError> {
            // 越靠前的主题完成得越晚
            let delay = 40u64.saturating_sub(topic.len() as u64 * 5);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if topic.contains("fail") {
                return Err(ResearchError::action("search", "HTTP 500"));
            }
            Ok(ResearchFindings {
                topic: topic.to_string(),
                compressed_research: format!("findings on {topic}"),
                raw_notes: format!("raw {topic}"),
            })
        }
    }

    struct FixedMemory(f32);

    #[async_trait]
    impl MemoryIndex for FixedMemory {
        async fn search(&self, _query: &str, _k: usize) -> Result<Vec<ScoredDocument>, ResearchError> {
            Ok(vec![ScoredDocument {
                document: MemoryDocument::new("earlier report"),
                distance: self.0,
            }])
        }

        async fn add(&self, _documents: Vec<MemoryDocument>) -> Result<usize, ResearchError> {
            Ok(0)
        }
    }

    fn state_with(requests: Vec<ActionRequest>, iterations: u32) -> ResearchState {
        let mut state = ResearchState::from_input("q");
        state.research_brief = Some("brief".into());
        state.supervisor_messages = vec![
            Message::user("brief"),
            Message::assistant("").with_action_requests(requests),
        ];
        state.research_iterations = iterations;
        state
    }

    fn delegate(id: &str, topic: &str) -> ActionRequest {
        ActionRequest::new(id, DELEGATE_RESEARCH, serde_json::json!({"research_topic": topic}))
    }

    fn act() -> ActOnDecisionsStage {
        ActOnDecisionsStage::new(Arc::new(EchoResearcher), SupervisorSettings::default())
    }

    #[tokio::test]
    async fn test_fan_out_preserves_request_order() {
        let state = state_with(
            vec![
                delegate("a", "t"),
                ActionRequest::new("r", REFLECT, serde_json::json!({"reflection": "gaps"})),
                delegate("b", "topic"),
                delegate("c", "topic-c"),
            ],
            1,
        );
        let outcome = act().run(&state, &RunContext::new("t")).await.unwrap();
        assert_eq!(outcome.next, Transition::Goto(SUPERVISE.into()));

        let contents: Vec<&str> = outcome
            .update
            .supervisor_messages
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(
            contents,
            vec!["findings on t", "Reflection recorded: gaps", "findings on topic", "findings on topic-c"]
        );
        let ids: Vec<&str> = outcome
            .update
            .supervisor_messages
            .iter()
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();
        assert_eq!(ids, vec!["a", "r", "b", "c"]);
        assert_eq!(outcome.update.raw_notes, vec!["raw t", "raw topic", "raw topic-c"]);
        assert!(outcome.update.notes.is_empty());
    }

    #[tokio::test]
    async fn test_failure_aborts_batch() {
        let state = state_with(vec![delegate("a", "ok"), delegate("b", "will fail")], 1);
        let err = act().run(&state, &RunContext::new("t")).await.unwrap_err();
        assert!(matches!(err, ResearchError::ActionExecution { .. }));
    }

    #[tokio::test]
    async fn test_unknown_action_is_error() {
        let state = state_with(vec![ActionRequest::new("x", "browse", serde_json::json!({}))], 1);
        let err = act().run(&state, &RunContext::new("t")).await.unwrap_err();
        assert!(err.to_string().contains("browse"));
    }

    #[tokio::test]
    async fn test_memory_hit_skips_delegation() {
        let state = state_with(
            vec![
                ActionRequest::new("m", MEMORY_LOOKUP, serde_json::json!({})),
                delegate("d", "topic"),
            ],
            1,
        );
        let outcome = act()
            .with_memory(Arc::new(FixedMemory(0.20)))
            .run(&state, &RunContext::new("t"))
            .await
            .unwrap();
        assert_eq!(outcome.update.trigger_search, Some(false));
        assert!(outcome.update.raw_notes.is_empty());
        let lookup: MemoryLookup = serde_json::from_str(&outcome.update.supervisor_messages[0].content).unwrap();
        assert!(!lookup.needs_research);
        assert_eq!(lookup.serialized, "Content: earlier report");
        assert!(outcome.update.supervisor_messages[1].content.starts_with(SKIPPED_PREFIX));
    }

    #[tokio::test]
    async fn test_memory_miss_keeps_trigger() {
        let state = state_with(
            vec![
                ActionRequest::new("m", MEMORY_LOOKUP, serde_json::json!({})),
                delegate("d", "topic"),
            ],
            1,
        );
        let outcome = act()
            .with_memory(Arc::new(FixedMemory(0.80)))
            .run(&state, &RunContext::new("t"))
            .await
            .unwrap();
        assert_eq!(outcome.update.trigger_search, None);
        assert_eq!(outcome.update.supervisor_messages[1].content, "findings on topic");
    }

    #[tokio::test]
    async fn test_end_conditions_collect_notes() {
        let mut state = state_with(vec![delegate("a", "x")], 2);
        state
            .supervisor_messages
            .push(Message::tool("a", DELEGATE_RESEARCH, "findings on x"));
        state.supervisor_messages.push(Message::tool(
            "s",
            DELEGATE_RESEARCH,
            format!("{SKIPPED_PREFIX} nope"),
        ));
        state.supervisor_messages.push(
            Message::assistant("done")
                .with_action_requests(vec![ActionRequest::new("z", RESEARCH_COMPLETE, serde_json::json!({}))]),
        );
        let outcome = act().run(&state, &RunContext::new("t")).await.unwrap();
        assert_eq!(outcome.next, Transition::Goto(FINAL_REPORT.into()));
        assert_eq!(outcome.update.notes, vec!["findings on x"]);

        // 达到上限时即使还有委派请求也结束
        let capped = state_with(vec![delegate("a", "x")], 6);
        let outcome = act().run(&capped, &RunContext::new("t")).await.unwrap();
        assert_eq!(outcome.next, Transition::Goto(FINAL_REPORT.into()));

        // 没有动作请求
        let idle = state_with(vec![], 1);
        let outcome = act().run(&idle, &RunContext::new("t")).await.unwrap();
        assert_eq!(outcome.next, Transition::Goto(FINAL_REPORT.into()));
    }

    #[tokio::test]
    async fn test_supervise_counts_iteration_and_requires_brief() {
        let llm = Arc::new(MockLlmClient::new(|_| {
            r#"{"tool_calls": [{"tool": "delegate_research", "args": {"research_topic": "x"}}]}"#.into()
        }));
        let stage = SuperviseStage::new(
            Arc::new(Reasoner::new(llm)),
            Arc::new(PromptLibrary::builtin()),
            SupervisorSettings::default(),
        );
        let state = state_with(vec![], 2);
        let outcome = stage.run(&state, &RunContext::new("t")).await.unwrap();
        assert_eq!(outcome.update.research_iterations, Some(3));
        let requests = &outcome.update.supervisor_messages[0].action_requests;
        assert_eq!(requests[0].id, "call_2_0");

        let mut no_brief = ResearchState::from_input("q");
        no_brief.research_brief = None;
        let err = stage.run(&no_brief, &RunContext::new("t")).await.unwrap_err();
        assert!(matches!(err, ResearchError::InvalidState(_)));
    }

    #[test]
    fn test_supervisor_actions_without_memory() {
        let names: Vec<String> = supervisor_actions(false).into_iter().map(|a| a.name).collect();
        assert_eq!(names, vec![REFLECT, DELEGATE_RESEARCH, RESEARCH_COMPLETE]);
        assert_eq!(supervisor_actions(true)[1].name, MEMORY_LOOKUP);
    }
}
