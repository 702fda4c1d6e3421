//! Delve - Rust 多智能体深度研究编排引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类与恢复、系统装配、优雅关闭
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）、按智能体路由、嵌入
//! - **memory**: 对话消息、文本分块、向量记忆索引
//! - **observability**: tracing 初始化
//! - **react**: Prompt 库、结构化推理、研究子智能体
//! - **service**: 对外研究服务与任务台账
//! - **stages**: 澄清、简报、监督循环、报告等工作流阶段
//! - **tools**: 工具注册、带超时的执行器、search 与 reflect
//! - **workflow**: 可恢复的检查点工作流引擎

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod service;
pub mod stages;
pub mod tools;
pub mod workflow;

pub use crate::core::{ResearchBuilder, ResearchError};
pub use crate::service::{AskOutcome, ResearchService};
