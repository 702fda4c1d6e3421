//! 记忆层：对话消息、报告分块与以往报告的检索索引

pub mod chunker;
pub mod conversation;
pub mod index;

pub use chunker::{Chunk, Chunker, ChunkingConfig};
pub use conversation::{buffer_string, ActionRequest, ActionResult, Message, Role};
pub use index::{
    lookup, remember_report, MemoryDocument, MemoryIndex, MemoryLookup, ScoredDocument, VectorMemoryIndex,
};
