//! 推理层：Prompt 模板、结构化推理服务与研究子智能体

pub mod prompts;
pub mod reasoner;
pub mod researcher;

pub use prompts::{today, PromptKey, PromptLibrary};
pub use reasoner::{
    parse_model_output, ActionSpec, OutputSchema, ParsedOutput, Reasoner, ReasoningRequest, ReasoningResponse,
    ToolCall,
};
pub use researcher::{ResearchAgent, ResearchFindings, SubResearcher};
