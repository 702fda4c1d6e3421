//! 工作流构建器
//!
//! 提供流式 API 注册阶段与入口，build 时检查入口存在且阶段名不重复。

use std::collections::HashMap;
use std::sync::Arc;

use crate::core::ResearchError;
use crate::workflow::{CheckpointStore, Stage, WorkflowEngine};

/// 工作流构建器
pub struct WorkflowBuilder {
    store: Arc<dyn CheckpointStore>,
    entry: Option<String>,
    stages: Vec<Arc<dyn Stage>>,
}

impl WorkflowBuilder {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            store,
            entry: None,
            stages: Vec::new(),
        }
    }

    /// 设置入口阶段；未设置时使用第一个注册的阶段
    pub fn entry(mut self, name: impl Into<String>) -> Self {
        self.entry = Some(name.into());
        self
    }

    pub fn stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn build(self) -> Result<WorkflowEngine, ResearchError> {
        let entry = self
            .entry
            .or_else(|| self.stages.first().map(|s| s.name().to_string()))
            .ok_or_else(|| ResearchError::Config("workflow has no stages".into()))?;

        let mut stages: HashMap<String, Arc<dyn Stage>> = HashMap::new();
        for stage in self.stages {
            let name = stage.name().to_string();
            if stages.insert(name.clone(), stage).is_some() {
                return Err(ResearchError::Config(format!("duplicate stage: {name}")));
            }
        }

        if !stages.contains_key(&entry) {
            return Err(ResearchError::UnknownStage(entry));
        }

        Ok(WorkflowEngine::new(stages, entry, self.store))
    }
}
