//! 工作流过程事件：阶段进入/完成、动作派发、token 用量、运行结束
//!
//! 引擎与各阶段通过可选的 mpsc 发送端推送事件；服务层据此更新任务台账。

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::llm::{AgentRole, Usage};
use crate::workflow::RunStatus;

/// 单条过程事件（可序列化为 JSON）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// 即将执行某阶段
    StageEntered {
        thread_id: String,
        stage: String,
        research_iterations: u32,
        trigger_search: bool,
    },
    /// 阶段执行完成并已写入检查点
    StageCompleted {
        thread_id: String,
        stage: String,
        version: u64,
    },
    /// 监督者派发的动作
    ActionDispatched {
        thread_id: String,
        action: String,
        id: String,
    },
    /// 一次推理调用的用量
    TokenUsage {
        thread_id: String,
        agent: AgentRole,
        prompt_tokens: u64,
        completion_tokens: u64,
    },
    /// 本次 run 结束（完成、暂停、等待输入或失败）
    RunFinished { thread_id: String, status: RunStatus },
}

/// 发送事件；无接收端时忽略
pub fn send_event(tx: &Option<UnboundedSender<WorkflowEvent>>, event: WorkflowEvent) {
    if let Some(tx) = tx {
        let _ = tx.send(event);
    }
}

impl WorkflowEvent {
    pub fn usage(thread_id: &str, agent: AgentRole, usage: Usage) -> Self {
        WorkflowEvent::TokenUsage {
            thread_id: thread_id.to_string(),
            agent,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        }
    }
}
