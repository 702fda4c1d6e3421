//! 核心层：错误分类与恢复策略、系统装配、优雅关闭

pub mod builder;
pub mod error;
pub mod recovery;
pub mod shutdown;

pub use builder::{create_research_builder, ResearchBuilder};
pub use error::{RecoveryAction, ResearchError};
pub use recovery::RecoveryEngine;
pub use shutdown::{ShutdownManager, ShutdownReason};
