//! 工作流引擎：可恢复的阶段状态机、检查点存储与过程事件

pub mod builder;
pub mod checkpoint;
pub mod engine;
pub mod events;
pub mod types;

pub use builder::WorkflowBuilder;
pub use checkpoint::{CheckpointStore, InMemoryCheckpointStore, SqliteCheckpointStore};
pub use engine::{RunContext, RunOptions, RunOutcome, Stage, WorkflowEngine};
pub use events::{send_event, WorkflowEvent};
pub use types::{
    Checkpoint, ResearchState, RunStatus, StageOutcome, StateUpdate, ThreadId, Transition,
};
