//! 工作流引擎
//!
//! 持有阶段注册表与检查点存储。run(thread_id, input, ctx, options) 加载或初始化状态后循环：
//! 执行当前阶段 → 合并增量 → 写检查点（version + 1）→ 进入下一阶段，直到终点、等待输入、暂停或失败。
//! 同一 thread 的 run 串行执行；不同 thread 互不阻塞。
//! 检查点写入失败时会话被标记为失败，在 reset 之前不可恢复。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::core::ResearchError;
use crate::llm::{AgentRole, Usage};
use crate::memory::Message;
use crate::workflow::{
    send_event, Checkpoint, CheckpointStore, ResearchState, RunStatus, StageOutcome, StateUpdate,
    Transition, WorkflowEvent,
};

/// 工作流阶段
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    /// 读取当前状态，返回去向与增量；不得直接修改状态
    async fn run(&self, state: &ResearchState, ctx: &RunContext) -> Result<StageOutcome, ResearchError>;
}

/// 单次 run 的上下文：会话 id、事件发送端、取消 token
#[derive(Clone, Default)]
pub struct RunContext {
    pub thread_id: String,
    pub events: Option<UnboundedSender<WorkflowEvent>>,
    pub cancel: CancellationToken,
}

impl RunContext {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            ..Default::default()
        }
    }

    pub fn with_events(mut self, tx: UnboundedSender<WorkflowEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn emit(&self, event: WorkflowEvent) {
        send_event(&self.events, event);
    }

    pub fn emit_usage(&self, agent: AgentRole, usage: Usage) {
        self.emit(WorkflowEvent::usage(&self.thread_id, agent, usage));
    }
}

/// run 选项
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// 在进入这些阶段之前暂停（本次 run 的起始阶段除外）
    pub interrupt_before: Vec<String>,
}

impl RunOptions {
    pub fn interrupt_before(stages: &[&str]) -> Self {
        Self {
            interrupt_before: stages.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// run 的结果
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub thread_id: String,
    pub state: ResearchState,
    pub status: RunStatus,
    pub stage: String,
    pub version: u64,
}

impl From<Checkpoint> for RunOutcome {
    fn from(cp: Checkpoint) -> Self {
        Self {
            thread_id: cp.thread_id,
            state: cp.state,
            status: cp.status,
            stage: cp.stage,
            version: cp.version,
        }
    }
}

/// 工作流引擎（由 WorkflowBuilder 构建）
pub struct WorkflowEngine {
    stages: HashMap<String, Arc<dyn Stage>>,
    entry: String,
    store: Arc<dyn CheckpointStore>,
    thread_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// 遇到持久化错误的会话；reset 之前拒绝 run
    poisoned: Mutex<HashSet<String>>,
}

impl WorkflowEngine {
    pub(crate) fn new(
        stages: HashMap<String, Arc<dyn Stage>>,
        entry: String,
        store: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            stages,
            entry,
            store,
            thread_locks: Mutex::new(HashMap::new()),
            poisoned: Mutex::new(HashSet::new()),
        }
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn stage_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stages.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn store(&self) -> Arc<dyn CheckpointStore> {
        Arc::clone(&self.store)
    }

    async fn thread_lock(&self, thread_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.thread_locks.lock().await;
        Arc::clone(
            locks
                .entry(thread_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// 无其他持有者时移除该会话的锁
    async fn release_lock(&self, thread_id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.thread_locks.lock().await;
        let ours = locks.get(thread_id).map(|l| Arc::ptr_eq(l, &lock)).unwrap_or(false);
        if ours && Arc::strong_count(&lock) == 2 {
            locks.remove(thread_id);
        }
    }

    #[cfg(test)]
    async fn tracked_locks(&self) -> usize {
        self.thread_locks.lock().await.len()
    }

    /// 当前检查点
    pub async fn checkpoint(&self, thread_id: &str) -> Result<Option<Checkpoint>, ResearchError> {
        self.store.get(thread_id).await
    }

    /// 执行或恢复一个会话
    ///
    /// - 无检查点：需要 input，以其初始化状态并从入口阶段开始
    /// - Completed：无操作，返回已存状态
    /// - AwaitingInput：有 input 时追加用户消息并从等待的阶段重新开始，否则无操作
    /// - Running / Interrupted：从持久化的阶段继续（input 若有则追加）
    /// - Failed：返回 ThreadFailed，需先 reset
    pub async fn run(
        &self,
        thread_id: &str,
        input: Option<String>,
        ctx: &RunContext,
        options: &RunOptions,
    ) -> Result<RunOutcome, ResearchError> {
        let lock = self.thread_lock(thread_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.run_locked(thread_id, input, ctx, options).await
        };
        self.release_lock(thread_id, lock).await;
        result
    }

    async fn run_locked(
        &self,
        thread_id: &str,
        input: Option<String>,
        ctx: &RunContext,
        options: &RunOptions,
    ) -> Result<RunOutcome, ResearchError> {
        if self.poisoned.lock().await.contains(thread_id) {
            return Err(ResearchError::ThreadFailed(thread_id.to_string()));
        }

        let stored = match self.store.get(thread_id).await {
            Ok(stored) => stored,
            Err(err) => return Err(self.fail_unloaded(thread_id, err, ctx).await),
        };
        let mut checkpoint = match stored {
            None => {
                let text = input.ok_or_else(|| ResearchError::NothingToResume(thread_id.to_string()))?;
                let cp = Checkpoint::new(thread_id, ResearchState::from_input(text), self.entry.clone());
                if let Err(err) = self.store.put(&cp).await {
                    return Err(self.fail(cp, err, ctx).await);
                }
                tracing::info!(thread_id = %thread_id, "thread started");
                cp
            }
            Some(cp) => match &cp.status {
                RunStatus::Completed => {
                    tracing::info!(thread_id = %thread_id, "thread already completed, returning stored state");
                    return Ok(cp.into());
                }
                RunStatus::Failed { .. } => {
                    return Err(ResearchError::ThreadFailed(thread_id.to_string()));
                }
                RunStatus::AwaitingInput if input.is_none() => {
                    tracing::info!(thread_id = %thread_id, "thread is waiting for user input");
                    return Ok(cp.into());
                }
                RunStatus::Running if input.is_none() => {
                    tracing::info!(thread_id = %thread_id, stage = %cp.stage, version = cp.version, "resuming thread");
                    cp
                }
                _ => {
                    let mut state = cp.state.clone();
                    if let Some(text) = input {
                        state.apply(StateUpdate::new().message(Message::user(text)));
                    }
                    tracing::info!(thread_id = %thread_id, stage = %cp.stage, version = cp.version, "resuming thread");
                    let next = cp.advance(state, cp.stage.clone(), RunStatus::Running);
                    if let Err(err) = self.store.put(&next).await {
                        return Err(self.fail(cp, err, ctx).await);
                    }
                    next
                }
            },
        };

        let mut first = true;
        loop {
            let stage_name = checkpoint.stage.clone();
            let interrupt = !first && options.interrupt_before.iter().any(|s| *s == stage_name);
            if interrupt || ctx.cancel.is_cancelled() {
                return self.pause(checkpoint, ctx).await;
            }
            first = false;

            ctx.emit(WorkflowEvent::StageEntered {
                thread_id: thread_id.to_string(),
                stage: stage_name.clone(),
                research_iterations: checkpoint.state.research_iterations,
                trigger_search: checkpoint.state.trigger_search,
            });
            tracing::info!(
                thread_id = %thread_id,
                stage = %stage_name,
                iteration = checkpoint.state.research_iterations,
                "stage started"
            );

            let result = match self.stages.get(&stage_name) {
                Some(stage) => stage.run(&checkpoint.state, ctx).await,
                None => Err(ResearchError::UnknownStage(stage_name.clone())),
            };
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(ResearchError::Cancelled) => return self.pause(checkpoint, ctx).await,
                Err(err) => return Err(self.fail(checkpoint, err, ctx).await),
            };

            let (next_stage, status) = match outcome.next {
                Transition::Goto(next) if self.stages.contains_key(&next) => (next, RunStatus::Running),
                Transition::Goto(next) => {
                    return Err(self.fail(checkpoint, ResearchError::UnknownStage(next), ctx).await)
                }
                Transition::AwaitInput => (stage_name.clone(), RunStatus::AwaitingInput),
                Transition::End => (stage_name.clone(), RunStatus::Completed),
            };

            let mut state = checkpoint.state.clone();
            state.apply(outcome.update);
            let next = checkpoint.advance(state, next_stage, status.clone());
            if let Err(err) = self.store.put(&next).await {
                return Err(self.fail(checkpoint, err, ctx).await);
            }
            checkpoint = next;

            ctx.emit(WorkflowEvent::StageCompleted {
                thread_id: thread_id.to_string(),
                stage: stage_name,
                version: checkpoint.version,
            });

            if status != RunStatus::Running {
                tracing::info!(thread_id = %thread_id, status = status.label(), "run finished");
                ctx.emit(WorkflowEvent::RunFinished {
                    thread_id: thread_id.to_string(),
                    status,
                });
                return Ok(checkpoint.into());
            }
        }
    }

    async fn pause(&self, checkpoint: Checkpoint, ctx: &RunContext) -> Result<RunOutcome, ResearchError> {
        let next = checkpoint.advance(
            checkpoint.state.clone(),
            checkpoint.stage.clone(),
            RunStatus::Interrupted,
        );
        if let Err(err) = self.store.put(&next).await {
            return Err(self.fail(checkpoint, err, ctx).await);
        }
        tracing::info!(thread_id = %next.thread_id, stage = %next.stage, "run paused");
        ctx.emit(WorkflowEvent::RunFinished {
            thread_id: next.thread_id.clone(),
            status: RunStatus::Interrupted,
        });
        Ok(next.into())
    }

    /// 将最后一个良好状态标记为失败
    ///
    /// 持久化类错误下，失败的那次写入可能已落盘，失败状态跳过其版本号再尽力写一次；
    /// 无论是否写成，会话都被标记为失败直到 reset。
    async fn fail(&self, checkpoint: Checkpoint, err: ResearchError, ctx: &RunContext) -> ResearchError {
        tracing::error!(
            thread_id = %checkpoint.thread_id,
            stage = %checkpoint.stage,
            error = %err,
            "stage failed"
        );
        let status = RunStatus::Failed {
            stage: checkpoint.stage.clone(),
            error: err.to_string(),
        };
        let mut failed = checkpoint.advance(checkpoint.state.clone(), checkpoint.stage.clone(), status.clone());
        if err.leaves_checkpoint_indeterminate() {
            failed.version += 1;
            self.poisoned.lock().await.insert(checkpoint.thread_id.clone());
        }
        if let Err(e) = self.store.put(&failed).await {
            tracing::error!(thread_id = %checkpoint.thread_id, error = %e, "failed to persist failure status");
            self.poisoned.lock().await.insert(checkpoint.thread_id.clone());
        }
        ctx.emit(WorkflowEvent::RunFinished {
            thread_id: checkpoint.thread_id.clone(),
            status,
        });
        err
    }

    /// 检查点读取失败：没有可标记的检查点，只标记会话并结束本次 run
    async fn fail_unloaded(&self, thread_id: &str, err: ResearchError, ctx: &RunContext) -> ResearchError {
        tracing::error!(thread_id = %thread_id, error = %err, "checkpoint load failed");
        self.poisoned.lock().await.insert(thread_id.to_string());
        ctx.emit(WorkflowEvent::RunFinished {
            thread_id: thread_id.to_string(),
            status: RunStatus::Failed {
                stage: String::new(),
                error: err.to_string(),
            },
        });
        err
    }

    /// 将失败的会话恢复为可继续状态（从最后一个良好检查点的阶段重新执行）；返回是否做了重置
    pub async fn reset(&self, thread_id: &str) -> Result<bool, ResearchError> {
        let lock = self.thread_lock(thread_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.reset_locked(thread_id).await
        };
        self.release_lock(thread_id, lock).await;
        result
    }

    async fn reset_locked(&self, thread_id: &str) -> Result<bool, ResearchError> {
        let reset = match self.store.get(thread_id).await? {
            Some(cp) if matches!(cp.status, RunStatus::Failed { .. }) => {
                let next = cp.advance(cp.state.clone(), cp.stage.clone(), RunStatus::Interrupted);
                self.store.put(&next).await?;
                tracing::info!(thread_id = %thread_id, stage = %next.stage, "failed thread reset");
                true
            }
            _ => false,
        };
        let cleared = self.poisoned.lock().await.remove(thread_id);
        if cleared && !reset {
            tracing::info!(thread_id = %thread_id, "thread cleared after persistence failure");
        }
        Ok(reset || cleared)
    }

    /// 删除会话检查点
    pub async fn forget(&self, thread_id: &str) -> Result<bool, ResearchError> {
        let lock = self.thread_lock(thread_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.poisoned.lock().await.remove(thread_id);
            self.store.delete(thread_id).await
        };
        self.release_lock(thread_id, lock).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{InMemoryCheckpointStore, WorkflowBuilder};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 第 n 次 put（从 1 计）属于 failing 时返回持久化错误
    struct FlakyStore {
        inner: InMemoryCheckpointStore,
        puts: AtomicUsize,
        failing: Vec<usize>,
    }

    impl FlakyStore {
        fn new(failing: &[usize]) -> Arc<Self> {
            Arc::new(Self {
                inner: InMemoryCheckpointStore::new(),
                puts: AtomicUsize::new(0),
                failing: failing.to_vec(),
            })
        }
    }

    #[async_trait]
    impl CheckpointStore for FlakyStore {
        async fn get(&self, thread_id: &str) -> Result<Option<Checkpoint>, ResearchError> {
            self.inner.get(thread_id).await
        }

        async fn put(&self, checkpoint: &Checkpoint) -> Result<(), ResearchError> {
            let n = self.puts.fetch_add(1, Ordering::SeqCst) + 1;
            if self.failing.contains(&n) {
                return Err(ResearchError::Persistence("disk full".into()));
            }
            self.inner.put(checkpoint).await
        }

        async fn delete(&self, thread_id: &str) -> Result<bool, ResearchError> {
            self.inner.delete(thread_id).await
        }
    }

    fn flaky_engine(store: Arc<FlakyStore>) -> (WorkflowEngine, Arc<Step>) {
        let a = Step::new("a", Transition::Goto("b".into()));
        let engine = WorkflowBuilder::new(store)
            .entry("a")
            .stage(a.clone())
            .stage(Step::new("b", Transition::End))
            .build()
            .unwrap();
        (engine, a)
    }

    /// 计数阶段：追加一条备注后前往 next
    struct Step {
        name: &'static str,
        next: Transition,
        calls: AtomicUsize,
    }

    impl Step {
        fn new(name: &'static str, next: Transition) -> Arc<Self> {
            Arc::new(Self {
                name,
                next,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Stage for Step {
        fn name(&self) -> &str {
            self.name
        }

        async fn run(&self, _state: &ResearchState, _ctx: &RunContext) -> Result<StageOutcome, ResearchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(StageOutcome {
                next: self.next.clone(),
                update: StateUpdate::new().notes(vec![self.name.to_string()]),
            })
        }
    }

    struct Boom;

    #[async_trait]
    impl Stage for Boom {
        fn name(&self) -> &str {
            "boom"
        }

        async fn run(&self, _state: &ResearchState, _ctx: &RunContext) -> Result<StageOutcome, ResearchError> {
            Err(ResearchError::action("search", "upstream down"))
        }
    }

    fn engine_with(stages: Vec<Arc<dyn Stage>>, store: Arc<InMemoryCheckpointStore>) -> WorkflowEngine {
        let mut builder = WorkflowBuilder::new(store).entry("a");
        for s in stages {
            builder = builder.stage(s);
        }
        builder.build().unwrap()
    }

    #[tokio::test]
    async fn test_runs_to_end_and_versions_increase() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let a = Step::new("a", Transition::Goto("b".into()));
        let b = Step::new("b", Transition::End);
        let engine = engine_with(vec![a.clone(), b.clone()], store.clone());

        let out = engine
            .run("t", Some("hi".into()), &RunContext::new("t"), &RunOptions::default())
            .await
            .unwrap();
        assert_eq!(out.status, RunStatus::Completed);
        assert_eq!(out.state.notes, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(out.version, 3);

        let again = engine
            .run("t", None, &RunContext::new("t"), &RunOptions::default())
            .await
            .unwrap();
        assert_eq!(again, out);
        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_interrupt_before_then_resume() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let a = Step::new("a", Transition::Goto("b".into()));
        let b = Step::new("b", Transition::End);
        let engine = engine_with(vec![a.clone(), b.clone()], store.clone());
        let opts = RunOptions::interrupt_before(&["b"]);

        let paused = engine
            .run("t", Some("hi".into()), &RunContext::new("t"), &opts)
            .await
            .unwrap();
        assert_eq!(paused.status, RunStatus::Interrupted);
        assert_eq!(paused.stage, "b");
        assert_eq!(b.calls.load(Ordering::SeqCst), 0);

        let done = engine.run("t", None, &RunContext::new("t"), &opts).await.unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
        assert_eq!(b.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_is_sticky_until_reset() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let a = Step::new("a", Transition::Goto("boom".into()));
        let engine = engine_with(vec![a.clone(), Arc::new(Boom)], store.clone());
        let ctx = RunContext::new("t");

        let err = engine
            .run("t", Some("hi".into()), &ctx, &RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ResearchError::ActionExecution { .. }));

        let cp = store.get("t").await.unwrap().unwrap();
        assert!(matches!(cp.status, RunStatus::Failed { ref stage, .. } if stage == "boom"));
        assert_eq!(cp.state.notes, vec!["a".to_string()]);

        let err = engine.run("t", None, &ctx, &RunOptions::default()).await.unwrap_err();
        assert!(matches!(err, ResearchError::ThreadFailed(_)));

        assert!(engine.reset("t").await.unwrap());
        let cp = store.get("t").await.unwrap().unwrap();
        assert_eq!(cp.status, RunStatus::Interrupted);
        assert_eq!(cp.stage, "boom");
    }

    #[tokio::test]
    async fn test_await_input_restarts_stage_with_new_message() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let a = Step::new("a", Transition::AwaitInput);
        let engine = engine_with(vec![a.clone()], store.clone());
        let ctx = RunContext::new("t");

        let out = engine.run("t", Some("q".into()), &ctx, &RunOptions::default()).await.unwrap();
        assert_eq!(out.status, RunStatus::AwaitingInput);

        let idle = engine.run("t", None, &ctx, &RunOptions::default()).await.unwrap();
        assert_eq!(idle.version, out.version);
        assert_eq!(a.calls.load(Ordering::SeqCst), 1);

        let out = engine
            .run("t", Some("answer".into()), &ctx, &RunOptions::default())
            .await
            .unwrap();
        assert_eq!(out.state.messages.len(), 2);
        assert_eq!(a.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_resume_without_checkpoint_or_input() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let engine = engine_with(vec![Step::new("a", Transition::End)], store);
        let err = engine
            .run("ghost", None, &RunContext::new("ghost"), &RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ResearchError::NothingToResume(_)));
    }

    #[tokio::test]
    async fn test_cancelled_run_stays_resumable() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let a = Step::new("a", Transition::End);
        let engine = engine_with(vec![a.clone()], store.clone());
        let token = CancellationToken::new();
        token.cancel();
        let ctx = RunContext::new("t").with_cancel(token);

        let out = engine.run("t", Some("q".into()), &ctx, &RunOptions::default()).await.unwrap();
        assert_eq!(out.status, RunStatus::Interrupted);
        assert_eq!(a.calls.load(Ordering::SeqCst), 0);

        let out = engine
            .run("t", None, &RunContext::new("t"), &RunOptions::default())
            .await
            .unwrap();
        assert_eq!(out.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_events_are_emitted() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let engine = engine_with(vec![Step::new("a", Transition::End)], store);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let ctx = RunContext::new("t").with_events(tx);
        engine.run("t", Some("q".into()), &ctx, &RunOptions::default()).await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            kinds.push(serde_json::to_value(&ev).unwrap()["type"].as_str().unwrap().to_string());
        }
        assert_eq!(kinds, vec!["stage_entered", "stage_completed", "run_finished"]);
    }

    #[tokio::test]
    async fn test_write_failure_marks_thread_failed() {
        let store = FlakyStore::new(&[2]);
        let (engine, a) = flaky_engine(store.clone());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let ctx = RunContext::new("t").with_events(tx);

        let err = engine
            .run("t", Some("hi".into()), &ctx, &RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ResearchError::Persistence(_)));

        let mut finished = None;
        while let Ok(ev) = rx.try_recv() {
            if let WorkflowEvent::RunFinished { status, .. } = ev {
                finished = Some(status);
            }
        }
        assert!(matches!(finished, Some(RunStatus::Failed { ref stage, .. }) if stage == "a"));

        let cp = store.get("t").await.unwrap().unwrap();
        assert!(matches!(cp.status, RunStatus::Failed { .. }));
        assert_eq!(cp.version, 3);

        let err = engine.run("t", None, &ctx, &RunOptions::default()).await.unwrap_err();
        assert!(matches!(err, ResearchError::ThreadFailed(_)));

        assert!(engine.reset("t").await.unwrap());
        let out = engine.run("t", None, &ctx, &RunOptions::default()).await.unwrap();
        assert_eq!(out.status, RunStatus::Completed);
        assert_eq!(a.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unwritable_failure_still_blocks_resume_until_reset() {
        let store = FlakyStore::new(&[2, 3]);
        let (engine, _) = flaky_engine(store.clone());
        let ctx = RunContext::new("t");

        engine
            .run("t", Some("hi".into()), &ctx, &RunOptions::default())
            .await
            .unwrap_err();
        let cp = store.get("t").await.unwrap().unwrap();
        assert_eq!(cp.status, RunStatus::Running);

        let err = engine.run("t", None, &ctx, &RunOptions::default()).await.unwrap_err();
        assert!(matches!(err, ResearchError::ThreadFailed(_)));
        assert_eq!(store.get("t").await.unwrap().unwrap().version, cp.version);

        assert!(engine.reset("t").await.unwrap());
        let out = engine.run("t", None, &ctx, &RunOptions::default()).await.unwrap();
        assert_eq!(out.status, RunStatus::Completed);
        assert!(!engine.reset("t").await.unwrap());
    }

    #[tokio::test]
    async fn test_thread_locks_are_released() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let engine = engine_with(vec![Step::new("a", Transition::End)], store);
        for id in ["t1", "t2", "t3"] {
            engine
                .run(id, Some("q".into()), &RunContext::new(id), &RunOptions::default())
                .await
                .unwrap();
        }
        assert_eq!(engine.tracked_locks().await, 0);

        assert!(engine.forget("t1").await.unwrap());
        assert!(!engine.reset("t2").await.unwrap());
        assert_eq!(engine.tracked_locks().await, 0);
        assert!(engine.checkpoint("t1").await.unwrap().is_none());
    }
}
