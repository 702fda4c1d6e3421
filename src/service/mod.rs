//! 服务层：任务台账与研究服务（同步范围界定 + 后台研究）

pub mod ledger;
pub mod runner;

pub use ledger::{AgentUsage, InMemoryTaskLedger, SqliteTaskLedger, TaskLedger, TaskRecord, TaskStatus};
pub use runner::{AskOutcome, ResearchHandle, ResearchService};
