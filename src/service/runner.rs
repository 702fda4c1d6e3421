//! 研究服务：对外入口
//!
//! ask(thread_id, text) 同步执行到 supervise 之前：需要澄清时直接返回问题，
//! 否则把剩余的监督循环与报告交给后台任务（从检查点恢复），返回 ResearchHandle。
//! 每次 run 都有一个事件消费任务，把阶段进入与 token 用量写入任务台账。
//! 成功完成且 trigger_search 仍为 true 时，最终报告分块写回记忆索引。

use std::sync::Arc;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::ResearchError;
use crate::llm::Usage;
use crate::memory::{remember_report, Chunker, MemoryIndex, Role};
use crate::service::{TaskLedger, TaskRecord, TaskStatus};
use crate::stages::{FINAL_REPORT, SUPERVISE};
use crate::workflow::{
    Checkpoint, RunContext, RunOptions, RunOutcome, RunStatus, WorkflowEngine, WorkflowEvent,
};

/// ask 的结果
#[derive(Debug)]
pub enum AskOutcome {
    /// 需要用户回答澄清问题；用同一 thread_id 再次 ask 即可继续
    Clarification { thread_id: String, question: String },
    /// 研究已转入后台
    Researching(ResearchHandle),
    /// 会话早已完成，返回已存结果
    Completed(RunOutcome),
}

/// 后台研究任务的句柄
#[derive(Debug)]
pub struct ResearchHandle {
    thread_id: String,
    task: JoinHandle<Result<RunOutcome, ResearchError>>,
}

impl ResearchHandle {
    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// 等待后台任务结束
    pub async fn wait(self) -> Result<RunOutcome, ResearchError> {
        let thread_id = self.thread_id;
        self.task.await.map_err(|e| {
            ResearchError::InvalidState(format!("research task for {thread_id} ended abnormally: {e}"))
        })?
    }
}

/// 研究服务
pub struct ResearchService {
    engine: Arc<WorkflowEngine>,
    ledger: Arc<dyn TaskLedger>,
    memory: Option<Arc<dyn MemoryIndex>>,
    chunker: Arc<Chunker>,
    cancel: CancellationToken,
    observer: Option<UnboundedSender<WorkflowEvent>>,
}

impl ResearchService {
    pub fn new(engine: Arc<WorkflowEngine>, ledger: Arc<dyn TaskLedger>) -> Self {
        Self {
            engine,
            ledger,
            memory: None,
            chunker: Arc::new(Chunker::default()),
            cancel: CancellationToken::new(),
            observer: None,
        }
    }

    /// 启用报告回写
    pub fn with_memory(mut self, memory: Arc<dyn MemoryIndex>, chunker: Chunker) -> Self {
        self.memory = Some(memory);
        self.chunker = Arc::new(chunker);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// 额外接收全部过程事件（如 CLI 进度输出）
    pub fn with_observer(mut self, tx: UnboundedSender<WorkflowEvent>) -> Self {
        self.observer = Some(tx);
        self
    }

    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    /// 取消所有进行中的 run；各会话停在阶段边界，之后可恢复
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub async fn task(&self, thread_id: &str) -> Result<Option<TaskRecord>, ResearchError> {
        self.ledger.get(thread_id).await
    }

    pub async fn checkpoint(&self, thread_id: &str) -> Result<Option<Checkpoint>, ResearchError> {
        self.engine.checkpoint(thread_id).await
    }

    /// 提交问题或澄清回答
    pub async fn ask(self: &Arc<Self>, thread_id: &str, text: &str) -> Result<AskOutcome, ResearchError> {
        self.ledger.create_task(thread_id, text).await?;

        let options = RunOptions::interrupt_before(&[SUPERVISE]);
        let outcome = self.run_tracked(thread_id, Some(text.to_string()), &options).await?;
        if let Some(brief) = outcome.state.research_brief.as_deref() {
            self.ledger.set_brief(thread_id, brief).await?;
        }

        match outcome.status {
            RunStatus::AwaitingInput => {
                let question = outcome
                    .state
                    .messages
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::Assistant)
                    .map(|m| m.content.clone())
                    .unwrap_or_default();
                tracing::info!(thread_id = %thread_id, "asking user for clarification");
                Ok(AskOutcome::Clarification {
                    thread_id: thread_id.to_string(),
                    question,
                })
            }
            RunStatus::Completed => Ok(AskOutcome::Completed(outcome)),
            _ => {
                tracing::info!(thread_id = %thread_id, stage = %outcome.stage, "handing research to background task");
                Ok(AskOutcome::Researching(self.spawn_resume(thread_id)))
            }
        }
    }

    /// 在后台从检查点继续
    pub fn spawn_resume(self: &Arc<Self>, thread_id: &str) -> ResearchHandle {
        let this = Arc::clone(self);
        let tid = thread_id.to_string();
        let task = tokio::spawn(async move { this.resume(&tid).await });
        ResearchHandle {
            thread_id: thread_id.to_string(),
            task,
        }
    }

    /// 不带新输入地继续会话，直到完成、暂停或失败
    pub async fn resume(&self, thread_id: &str) -> Result<RunOutcome, ResearchError> {
        self.run_tracked(thread_id, None, &RunOptions::default()).await
    }

    /// 把失败的会话恢复为可继续状态
    pub async fn reset(&self, thread_id: &str) -> Result<bool, ResearchError> {
        let reset = self.engine.reset(thread_id).await?;
        if reset {
            tracing::info!(thread_id = %thread_id, "thread reset, resume to retry the failed stage");
        }
        Ok(reset)
    }

    /// 执行一次 run，并在结束后按最终状态更新台账、回写记忆
    async fn run_tracked(
        &self,
        thread_id: &str,
        input: Option<String>,
        options: &RunOptions,
    ) -> Result<RunOutcome, ResearchError> {
        let (tx, rx) = unbounded_channel();
        let tracker = tokio::spawn(track_events(
            Arc::clone(&self.ledger),
            rx,
            self.observer.clone(),
        ));
        let ctx = RunContext::new(thread_id)
            .with_events(tx)
            .with_cancel(self.cancel.child_token());

        let result = self.engine.run(thread_id, input, &ctx, options).await;
        drop(ctx);
        let finished = match tracker.await {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(thread_id = %thread_id, error = %e, "event tracker ended abnormally");
                None
            }
        };

        match (&result, finished) {
            (Ok(outcome), Some(RunStatus::Completed)) => self.on_completed(outcome).await,
            (Err(err), Some(RunStatus::Failed { .. })) => {
                if let Err(e) = self.ledger.fail(thread_id, &err.to_string()).await {
                    tracing::warn!(thread_id = %thread_id, error = %e, "failed to record failure in ledger");
                }
            }
            _ => {}
        }
        result
    }

    async fn on_completed(&self, outcome: &RunOutcome) {
        let thread_id = outcome.thread_id.as_str();
        let Some(report) = outcome.state.final_report.as_deref() else {
            return;
        };
        if let Err(e) = self.ledger.complete(thread_id, report).await {
            tracing::warn!(thread_id = %thread_id, error = %e, "failed to record completion in ledger");
        }

        if !outcome.state.trigger_search {
            tracing::debug!(thread_id = %thread_id, "answer came from memory, skipping write-back");
            return;
        }
        let Some(memory) = &self.memory else {
            return;
        };
        let brief = outcome.state.research_brief.as_deref().unwrap_or_default();
        if let Err(e) = remember_report(memory.as_ref(), &self.chunker, thread_id, brief, report).await {
            tracing::warn!(thread_id = %thread_id, error = %e, "failed to write report to memory");
        }
    }
}

/// 消费一次 run 的事件：首次进入 supervise（trigger_search 为真）记 searching，进入 final_report 记 summarizing，
/// token 用量按智能体累计；返回本次 run 的结束状态（无操作的 run 没有）
async fn track_events(
    ledger: Arc<dyn TaskLedger>,
    mut rx: UnboundedReceiver<WorkflowEvent>,
    observer: Option<UnboundedSender<WorkflowEvent>>,
) -> Option<RunStatus> {
    let mut searching = false;
    let mut finished = None;

    while let Some(event) = rx.recv().await {
        let result = match &event {
            WorkflowEvent::StageEntered {
                thread_id,
                stage,
                trigger_search,
                ..
            } if stage == SUPERVISE && *trigger_search && !searching => {
                searching = true;
                ledger.set_status(thread_id, TaskStatus::Searching).await
            }
            WorkflowEvent::StageEntered { thread_id, stage, .. } if stage == FINAL_REPORT => {
                ledger.set_status(thread_id, TaskStatus::Summarizing).await
            }
            WorkflowEvent::TokenUsage {
                thread_id,
                agent,
                prompt_tokens,
                completion_tokens,
            } => {
                ledger
                    .record_usage(thread_id, *agent, Usage::new(*prompt_tokens, *completion_tokens))
                    .await
            }
            WorkflowEvent::RunFinished { status, .. } => {
                finished = Some(status.clone());
                Ok(())
            }
            _ => Ok(()),
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "task ledger update failed");
        }
        if let Some(tx) = &observer {
            let _ = tx.send(event);
        }
    }
    finished
}
