//! 报告分块：按字符窗口切分，优先在分隔符处断开，相邻块保留重叠（UTF-8 安全）

use serde::{Deserialize, Serialize};

/// 分块策略
#[derive(Debug, Clone)]
pub struct ChunkingConfig {
    /// 目标块大小（字符数）
    pub chunk_size: usize,
    /// 块之间的重叠（字符数）
    pub chunk_overlap: usize,
    /// 分隔符优先级（从高到低）
    pub separators: Vec<String>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1800,
            chunk_overlap: 200,
            separators: ["\n\n", "\n", ". ", "。", "! ", "? ", " "]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl ChunkingConfig {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            chunk_overlap: chunk_overlap.min(chunk_size.saturating_sub(1)),
            ..Default::default()
        }
    }
}

/// 文档块
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,
    /// 在原文中的字符偏移
    pub offset: usize,
}

/// 文档分块器
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Self {
        Self { config }
    }

    pub fn chunk(&self, text: &str) -> Vec<Chunk> {
        let chars: Vec<char> = text.chars().collect();
        let total = chars.len();
        let mut chunks = Vec::new();
        let mut start = 0;

        while start < total {
            let target_end = (start + self.config.chunk_size).min(total);
            let mut end = target_end;

            if target_end < total {
                let window: String = chars[start..target_end].iter().collect();
                for sep in &self.config.separators {
                    if let Some(pos) = window.rfind(sep.as_str()) {
                        let upto = window[..pos].chars().count() + sep.chars().count();
                        // 断点太靠前时，块会退化为很小的碎片
                        if upto > self.config.chunk_overlap {
                            end = start + upto;
                            break;
                        }
                    }
                }
            }
            if end <= start {
                end = (start + 1).min(total);
            }

            let piece: String = chars[start..end].iter().collect();
            if !piece.trim().is_empty() {
                chunks.push(Chunk {
                    text: piece.trim().to_string(),
                    offset: start,
                });
            }
            if end >= total {
                break;
            }

            let next = end.saturating_sub(self.config.chunk_overlap);
            start = if next > start { next } else { end };
        }

        chunks
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(ChunkingConfig::default())
    }
}
