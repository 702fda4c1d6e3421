//! 工作流类型定义
//!
//! ResearchState 是一次研究会话（thread）的完整状态；阶段只返回 StateUpdate，
//! 由引擎调用 ResearchState::apply 按字段合并：标量覆盖，列表追加，简报与最终报告只写一次。

use serde::{Deserialize, Serialize};

use crate::memory::Message;

pub type ThreadId = String;

/// 研究会话状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchState {
    /// 与用户的对话（追加）
    pub messages: Vec<Message>,
    /// 研究简报；写入后不可变
    pub research_brief: Option<String>,
    /// 监督者内部对话（追加）
    pub supervisor_messages: Vec<Message>,
    /// 压缩后的研究发现（追加）
    pub notes: Vec<String>,
    /// 未压缩的原始发现（追加）
    pub raw_notes: Vec<String>,
    /// 监督者决策步数
    pub research_iterations: u32,
    /// 记忆命中后可被清除
    pub trigger_search: bool,
    /// 最终报告；仅在成功到达终点时写入一次
    pub final_report: Option<String>,
}

impl Default for ResearchState {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            research_brief: None,
            supervisor_messages: Vec::new(),
            notes: Vec::new(),
            raw_notes: Vec::new(),
            research_iterations: 0,
            trigger_search: true,
            final_report: None,
        }
    }
}

impl ResearchState {
    pub fn from_input(text: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::user(text)],
            ..Self::default()
        }
    }

    /// 合并阶段返回的增量
    pub fn apply(&mut self, update: StateUpdate) {
        append(&mut self.messages, update.messages);
        set_once("research_brief", &mut self.research_brief, update.research_brief);
        append(&mut self.supervisor_messages, update.supervisor_messages);
        append(&mut self.notes, update.notes);
        append(&mut self.raw_notes, update.raw_notes);
        overwrite(&mut self.research_iterations, update.research_iterations);
        overwrite(&mut self.trigger_search, update.trigger_search);
        set_once("final_report", &mut self.final_report, update.final_report);
    }

    pub fn brief(&self) -> Option<&str> {
        self.research_brief.as_deref().filter(|b| !b.trim().is_empty())
    }
}

fn append<T>(field: &mut Vec<T>, items: Vec<T>) {
    field.extend(items);
}

fn overwrite<T>(field: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *field = v;
    }
}

fn set_once(name: &str, field: &mut Option<String>, value: Option<String>) {
    match (field.as_ref(), value) {
        (_, None) => {}
        (None, Some(v)) => *field = Some(v),
        (Some(existing), Some(v)) if *existing == v => {}
        (Some(_), Some(_)) => {
            tracing::warn!(field = name, "ignoring second write to a set-once field");
        }
    }
}

/// 阶段返回的状态增量
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    pub messages: Vec<Message>,
    pub research_brief: Option<String>,
    pub supervisor_messages: Vec<Message>,
    pub notes: Vec<String>,
    pub raw_notes: Vec<String>,
    pub research_iterations: Option<u32>,
    pub trigger_search: Option<bool>,
    pub final_report: Option<String>,
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    pub fn research_brief(mut self, brief: impl Into<String>) -> Self {
        self.research_brief = Some(brief.into());
        self
    }

    pub fn supervisor_message(mut self, message: Message) -> Self {
        self.supervisor_messages.push(message);
        self
    }

    pub fn supervisor_messages(mut self, messages: Vec<Message>) -> Self {
        self.supervisor_messages.extend(messages);
        self
    }

    pub fn notes(mut self, notes: Vec<String>) -> Self {
        self.notes.extend(notes);
        self
    }

    pub fn raw_notes(mut self, notes: Vec<String>) -> Self {
        self.raw_notes.extend(notes);
        self
    }

    pub fn research_iterations(mut self, n: u32) -> Self {
        self.research_iterations = Some(n);
        self
    }

    pub fn trigger_search(mut self, value: bool) -> Self {
        self.trigger_search = Some(value);
        self
    }

    pub fn final_report(mut self, report: impl Into<String>) -> Self {
        self.final_report = Some(report.into());
        self
    }
}

/// 阶段之后的去向
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "stage", rename_all = "snake_case")]
pub enum Transition {
    /// 进入指定阶段
    Goto(String),
    /// 停下等待用户输入（澄清）；新输入到来后从当前阶段重新开始
    AwaitInput,
    /// 终点
    End,
}

/// 阶段执行结果
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutcome {
    pub next: Transition,
    pub update: StateUpdate,
}

impl StageOutcome {
    pub fn goto(stage: impl Into<String>, update: StateUpdate) -> Self {
        Self {
            next: Transition::Goto(stage.into()),
            update,
        }
    }

    pub fn await_input(update: StateUpdate) -> Self {
        Self {
            next: Transition::AwaitInput,
            update,
        }
    }

    pub fn end(update: StateUpdate) -> Self {
        Self {
            next: Transition::End,
            update,
        }
    }
}

/// 会话运行状态（随检查点持久化）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    /// 正在执行，stage 为下一个要执行的阶段
    Running,
    /// 在阶段边界暂停（interrupt_before 或取消），可用空输入恢复
    Interrupted,
    /// 等待用户回答澄清问题
    AwaitingInput,
    Completed,
    /// 致命错误；需显式 reset 才能恢复
    Failed { stage: String, error: String },
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Interrupted => "interrupted",
            RunStatus::AwaitingInput => "awaiting_input",
            RunStatus::Completed => "completed",
            RunStatus::Failed { .. } => "failed",
        }
    }
}

/// 检查点：每次阶段转移后写入；version 单调递增，用于识别过期写入
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub thread_id: ThreadId,
    pub state: ResearchState,
    /// 下一个要执行的阶段（终止时为最后执行的阶段）
    pub stage: String,
    pub version: u64,
    pub status: RunStatus,
    /// 毫秒时间戳
    pub updated_at: i64,
}

impl Checkpoint {
    pub fn new(thread_id: impl Into<String>, state: ResearchState, stage: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            state,
            stage: stage.into(),
            version: 1,
            status: RunStatus::Running,
            updated_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// 下一版本
    pub fn advance(&self, state: ResearchState, stage: impl Into<String>, status: RunStatus) -> Self {
        Self {
            thread_id: self.thread_id.clone(),
            state,
            stage: stage.into(),
            version: self.version + 1,
            status,
            updated_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_state_triggers_search() {
        let state = ResearchState::from_input("hello");
        assert!(state.trigger_search);
        assert_eq!(state.messages.len(), 1);
        assert_eq!(state.research_iterations, 0);
    }

    #[test]
    fn test_apply_appends_lists_and_overwrites_scalars() {
        let mut state = ResearchState::from_input("q");
        state.apply(
            StateUpdate::new()
                .message(Message::assistant("a"))
                .notes(vec!["n1".into()])
                .research_iterations(2)
                .trigger_search(false),
        );
        state.apply(StateUpdate::new().notes(vec!["n2".into()]));
        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.notes, vec!["n1".to_string(), "n2".to_string()]);
        assert_eq!(state.research_iterations, 2);
        assert!(!state.trigger_search);
    }

    #[test]
    fn test_brief_and_report_are_set_once() {
        let mut state = ResearchState::default();
        state.apply(StateUpdate::new().research_brief("first").final_report("r1"));
        state.apply(StateUpdate::new().research_brief("second").final_report("r2"));
        assert_eq!(state.research_brief.as_deref(), Some("first"));
        assert_eq!(state.final_report.as_deref(), Some("r1"));
    }

    #[test]
    fn test_checkpoint_advance_bumps_version() {
        let cp = Checkpoint::new("t1", ResearchState::default(), "clarify");
        let next = cp.advance(cp.state.clone(), "write_brief", RunStatus::Running);
        assert_eq!(next.version, 2);
        assert_eq!(next.thread_id, "t1");
    }

    #[test]
    fn test_checkpoint_serde() {
        let mut cp = Checkpoint::new("t1", ResearchState::from_input("q"), "supervise");
        cp.status = RunStatus::Failed {
            stage: "supervise".into(),
            error: "boom".into(),
        };
        let json = serde_json::to_string(&cp).unwrap();
        let back: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cp);
    }
}
