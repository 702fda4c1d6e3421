//! 编排错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 ResearchError 决定 RetryWithPrompt / Abort。
//! 澄清与迭代上限不是错误，分别体现为 RunStatus::AwaitingInput 与监督循环的正常结束。

use thiserror::Error;

use crate::llm::LlmError;

/// 一次运行中可能出现的错误
#[derive(Error, Debug)]
pub enum ResearchError {
    /// 推理服务持续失败（可重试错误已在 RetryingLlmClient 中耗尽）
    #[error("reasoning service error: {0}")]
    Reasoning(#[from] LlmError),

    /// 模型输出无法解析为要求的结构
    #[error("invalid model output: {0}")]
    InvalidOutput(String),

    /// 未知动作或外部动作执行失败，整批中止
    #[error("action `{name}` failed: {reason}")]
    ActionExecution { name: String, reason: String },

    #[error("memory index error: {0}")]
    Memory(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("stale checkpoint for thread {thread_id}: stored version {stored}, attempted {attempted}")]
    StaleCheckpoint {
        thread_id: String,
        stored: u64,
        attempted: u64,
    },

    #[error("thread {0} is in a failed state; reset it before resuming")]
    ThreadFailed(String),

    #[error("thread {0} has no checkpoint and no input to start from")]
    NothingToResume(String),

    #[error("unknown stage: {0}")]
    UnknownStage(String),

    #[error("invalid workflow state: {0}")]
    InvalidState(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("cancelled")]
    Cancelled,
}

impl ResearchError {
    pub fn action(name: impl Into<String>, reason: impl Into<String>) -> Self {
        ResearchError::ActionExecution {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// 运行失败后检查点是否仍可信（持久化错误使检查点处于不确定状态）
    pub fn leaves_checkpoint_indeterminate(&self) -> bool {
        matches!(
            self,
            ResearchError::Persistence(_) | ResearchError::StaleCheckpoint { .. }
        )
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 将纠正提示注入下一轮，让 LLM 重新输出
    RetryWithPrompt(String),
    /// 终止当前运行
    Abort,
}
