//! 研究工作流的各阶段
//!
//! scoping（clarify → write_brief）→ supervisor（supervise ⇄ act_on_decisions）→ report（final_report）

pub mod report;
pub mod scoping;
pub mod supervisor;

pub const CLARIFY: &str = "clarify";
pub const WRITE_BRIEF: &str = "write_brief";
pub const SUPERVISE: &str = "supervise";
pub const ACT_ON_DECISIONS: &str = "act_on_decisions";
pub const FINAL_REPORT: &str = "final_report";

pub use report::ReportStage;
pub use scoping::{ClarifyDecision, ClarifyStage, ResearchQuestion, WriteBriefStage};
pub use supervisor::{
    supervisor_actions, ActOnDecisionsStage, DelegateResearchArgs, SuperviseStage, SupervisorAction,
    SupervisorSettings,
};
