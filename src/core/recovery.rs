//! 错误恢复引擎
//!
//! 根据 ResearchError 类型返回 RecoveryAction，供 Reasoner 决定是纠正重试还是终止。
//! 后端的瞬时错误由 RetryingLlmClient 重试，到这里已是最终失败。

use crate::core::{RecoveryAction, ResearchError};

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Default, Clone)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    /// schema 为期望的 JSON 结构描述，写入纠正提示
    pub fn handle(&self, err: &ResearchError, schema: Option<&str>) -> RecoveryAction {
        match err {
            ResearchError::InvalidOutput(raw) => {
                let shape = schema.unwrap_or(
                    r#"{"tool_calls": [{"tool": "<action name>", "args": {...}}]}"#,
                );
                RecoveryAction::RetryWithPrompt(format!(
                    "Your previous output could not be parsed: {raw}. \
                     Reply with exactly one valid JSON object and nothing else \
                     (no Markdown, no commentary). Required shape: {shape}"
                ))
            }
            _ => RecoveryAction::Abort,
        }
    }
}
