//! 研究系统构建器：按配置统一装配路由、推理、工具、记忆、存储、工作流与服务
//!
//! 任何组件都可以用 with_* 预先注入（测试用 Mock/Stub 替换外部依赖），未注入的按配置创建。

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::ResearchError;
use crate::llm::{create_embedder_from_config, create_router_from_config, AgentRole, ModelRouter};
use crate::memory::{Chunker, ChunkingConfig, MemoryIndex, VectorMemoryIndex};
use crate::react::{PromptLibrary, Reasoner, ResearchAgent, SubResearcher};
use crate::service::{InMemoryTaskLedger, ResearchService, SqliteTaskLedger, TaskLedger};
use crate::stages::{
    ActOnDecisionsStage, ClarifyStage, ReportStage, SuperviseStage, SupervisorSettings, WriteBriefStage, CLARIFY,
};
use crate::tools::{ReflectTool, SearchTool, Tool, ToolExecutor, ToolRegistry};
use crate::workflow::{CheckpointStore, InMemoryCheckpointStore, SqliteCheckpointStore, WorkflowBuilder, WorkflowEngine};

/// 研究系统构建器
pub struct ResearchBuilder {
    config: AppConfig,
    router: Option<ModelRouter>,
    prompts: Option<Arc<PromptLibrary>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    ledger: Option<Arc<dyn TaskLedger>>,
    memory: Option<Arc<dyn MemoryIndex>>,
    researcher: Option<Arc<dyn SubResearcher>>,
    search: Option<Arc<dyn Tool>>,
    cancel: CancellationToken,
    observer: Option<UnboundedSender<crate::workflow::WorkflowEvent>>,
}

impl ResearchBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            router: None,
            prompts: None,
            checkpoints: None,
            ledger: None,
            memory: None,
            researcher: None,
            search: None,
            cancel: CancellationToken::new(),
            observer: None,
        }
    }

    pub fn with_router(mut self, router: ModelRouter) -> Self {
        self.router = Some(router);
        self
    }

    pub fn with_prompts(mut self, prompts: PromptLibrary) -> Self {
        self.prompts = Some(Arc::new(prompts));
        self
    }

    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn TaskLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryIndex>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// 替换子研究执行者（默认是基于 search / reflect 的 ResearchAgent）
    pub fn with_researcher(mut self, researcher: Arc<dyn SubResearcher>) -> Self {
        self.researcher = Some(researcher);
        self
    }

    /// 替换 search 工具（默认是 Tavily）
    pub fn with_search_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.search = Some(tool);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_observer(mut self, tx: UnboundedSender<crate::workflow::WorkflowEvent>) -> Self {
        self.observer = Some(tx);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    fn reasoner(&self, router: &ModelRouter, role: AgentRole) -> Arc<Reasoner> {
        Arc::new(Reasoner::new(router.client_for(role)).with_structured_retries(self.config.llm.structured_retries))
    }

    fn tool_executor(&self) -> ToolExecutor {
        let mut tools = ToolRegistry::new();
        match &self.search {
            Some(tool) => tools.register_arc(Arc::clone(tool)),
            None => tools.register(SearchTool::new(&self.config.tools.search)),
        }
        tools.register(ReflectTool);
        ToolExecutor::new(tools, self.config.tools.tool_timeout_secs)
    }

    async fn memory_index(&self) -> Result<Option<Arc<dyn MemoryIndex>>, ResearchError> {
        if let Some(memory) = &self.memory {
            return Ok(Some(Arc::clone(memory)));
        }
        if !self.config.memory.enabled {
            return Ok(None);
        }
        let Some(embedder) = create_embedder_from_config(
            self.config.llm.base_url.as_deref(),
            &self.config.memory.embedding_model,
            self.config.llm.api_key.as_deref(),
        ) else {
            tracing::warn!("memory enabled but no embedding backend is available, memory lookup disabled");
            return Ok(None);
        };
        let index = match &self.config.memory.snapshot_path {
            Some(path) => VectorMemoryIndex::open(embedder, path).await?,
            None => VectorMemoryIndex::new(embedder),
        };
        Ok(Some(Arc::new(index)))
    }

    fn checkpoint_store(&self) -> Result<Arc<dyn CheckpointStore>, ResearchError> {
        if let Some(store) = &self.checkpoints {
            return Ok(Arc::clone(store));
        }
        Ok(match &self.config.storage.checkpoint_db {
            Some(path) => {
                tracing::info!(path = %path.display(), "using sqlite checkpoint store");
                Arc::new(SqliteCheckpointStore::open(path)?)
            }
            None => Arc::new(InMemoryCheckpointStore::new()),
        })
    }

    fn task_ledger(&self) -> Result<Arc<dyn TaskLedger>, ResearchError> {
        if let Some(ledger) = &self.ledger {
            return Ok(Arc::clone(ledger));
        }
        Ok(match &self.config.storage.ledger_db {
            Some(path) => Arc::new(SqliteTaskLedger::open(path)?),
            None => Arc::new(InMemoryTaskLedger::new()),
        })
    }

    /// 装配工作流引擎
    pub async fn build_engine(&self) -> Result<(WorkflowEngine, Option<Arc<dyn MemoryIndex>>), ResearchError> {
        let router = match &self.router {
            Some(router) => router.clone(),
            None => create_router_from_config(&self.config),
        };
        let prompts = match &self.prompts {
            Some(prompts) => Arc::clone(prompts),
            None => Arc::new(PromptLibrary::load(self.config.app.prompts_path.as_deref())?),
        };
        let researcher: Arc<dyn SubResearcher> = match &self.researcher {
            Some(researcher) => Arc::clone(researcher),
            None => Arc::new(ResearchAgent::new(
                self.reasoner(&router, AgentRole::Researcher),
                self.tool_executor(),
                Arc::clone(&prompts),
                self.config.research.researcher_steps(),
            )),
        };
        let memory = self.memory_index().await?;
        let settings = SupervisorSettings::from(&self.config);

        let scope = self.reasoner(&router, AgentRole::Scope);
        let mut act = ActOnDecisionsStage::new(researcher, settings.clone());
        if let Some(memory) = &memory {
            act = act.with_memory(Arc::clone(memory));
        }

        let engine = WorkflowBuilder::new(self.checkpoint_store()?)
            .entry(CLARIFY)
            .stage(Arc::new(
                ClarifyStage::new(Arc::clone(&scope), Arc::clone(&prompts))
                    .with_enabled(self.config.research.allow_clarification),
            ))
            .stage(Arc::new(WriteBriefStage::new(scope, Arc::clone(&prompts))))
            .stage(Arc::new(SuperviseStage::new(
                self.reasoner(&router, AgentRole::Supervisor),
                Arc::clone(&prompts),
                settings,
            )))
            .stage(Arc::new(act))
            .stage(Arc::new(ReportStage::new(
                self.reasoner(&router, AgentRole::Reporter),
                prompts,
            )))
            .build()?;
        tracing::info!(stages = ?engine.stage_names(), memory = memory.is_some(), "workflow assembled");
        Ok((engine, memory))
    }

    /// 装配研究服务
    pub async fn build(self) -> Result<Arc<ResearchService>, ResearchError> {
        let (engine, memory) = self.build_engine().await?;
        let mut service = ResearchService::new(Arc::new(engine), self.task_ledger()?).with_cancel(self.cancel.clone());
        if let Some(memory) = memory {
            let chunking = ChunkingConfig::new(self.config.memory.chunk_size, self.config.memory.chunk_overlap);
            service = service.with_memory(memory, Chunker::new(chunking));
        }
        if let Some(tx) = self.observer {
            service = service.with_observer(tx);
        }
        Ok(Arc::new(service))
    }
}

/// 便捷函数：从配置文件创建构建器，加载失败时使用默认配置
pub fn create_research_builder(config_path: Option<PathBuf>) -> ResearchBuilder {
    let config = crate::config::load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    ResearchBuilder::new(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    fn mock_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.llm.provider = "mock".into();
        config.memory.enabled = false;
        config
    }

    #[tokio::test]
    async fn test_build_engine_registers_all_stages() {
        let builder = ResearchBuilder::new(mock_config())
            .with_router(ModelRouter::new(Arc::new(MockLlmClient::default())))
            .with_prompts(PromptLibrary::builtin());
        let (engine, memory) = builder.build_engine().await.unwrap();
        assert_eq!(engine.entry(), CLARIFY);
        assert_eq!(
            engine.stage_names(),
            vec!["act_on_decisions", "clarify", "final_report", "supervise", "write_brief"]
        );
        assert!(memory.is_none());
    }

    #[tokio::test]
    async fn test_sqlite_storage_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = mock_config();
        config.storage.checkpoint_db = Some(dir.path().join("checkpoints.db"));
        config.storage.ledger_db = Some(dir.path().join("ledger.db"));
        let service = ResearchBuilder::new(config)
            .with_prompts(PromptLibrary::builtin())
            .build()
            .await
            .unwrap();
        assert!(service.checkpoint("nope").await.unwrap().is_none());
        assert!(dir.path().join("checkpoints.db").exists());
        assert!(dir.path().join("ledger.db").exists());
    }
}
