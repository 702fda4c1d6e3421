//! 记忆索引：以往报告的相似度检索
//!
//! - `MemoryIndex`：search(query, k) 按距离升序返回；add 写入新文档。
//! - `VectorMemoryIndex`：基于 EmbeddingProvider 的内存余弦距离索引（距离 = 1 - 余弦相似度），
//!   可选 JSON 快照（打开时加载，每次写入后保存）。
//! - `lookup`：memory_lookup 动作使用的阈值判断与序列化；`remember_report`：报告分块回写。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::ResearchError;
use crate::llm::EmbeddingProvider;
use crate::memory::Chunker;

/// 待写入的文档
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryDocument {
    pub content: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl MemoryDocument {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// 检索结果：距离越小越相似
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredDocument {
    pub document: MemoryDocument,
    pub distance: f32,
}

/// 记忆索引接口（可被多个线程并发调用）
#[async_trait]
pub trait MemoryIndex: Send + Sync {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<ScoredDocument>, ResearchError>;

    /// 写入文档，返回成功写入的条数
    async fn add(&self, documents: Vec<MemoryDocument>) -> Result<usize, ResearchError>;
}

/// memory_lookup 的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryLookup {
    pub needs_research: bool,
    pub serialized: String,
}

impl MemoryLookup {
    pub fn is_hit(&self) -> bool {
        !self.needs_research
    }
}

/// 检索 k 条；最优距离不超过 threshold 视为命中，命中时把全部结果序列化为 "Content: ..." 段落
pub async fn lookup(
    index: &dyn MemoryIndex,
    query: &str,
    k: usize,
    threshold: f32,
) -> Result<MemoryLookup, ResearchError> {
    let hits = index.search(query, k).await?;
    let best = hits
        .iter()
        .map(|h| h.distance)
        .fold(f32::INFINITY, f32::min);
    let needs_research = hits.is_empty() || best > threshold;
    tracing::info!(
        hits = hits.len(),
        best_distance = if hits.is_empty() { -1.0 } else { best },
        needs_research,
        "memory lookup"
    );

    if needs_research {
        return Ok(MemoryLookup {
            needs_research: true,
            serialized: String::new(),
        });
    }
    let serialized = hits
        .iter()
        .map(|h| format!("Content: {}", h.document.content))
        .collect::<Vec<_>>()
        .join("\n\n");
    Ok(MemoryLookup {
        needs_research: false,
        serialized,
    })
}

/// 把最终报告分块写入索引，附带线程、主题与时间元数据
pub async fn remember_report(
    index: &dyn MemoryIndex,
    chunker: &Chunker,
    thread_id: &str,
    research_brief: &str,
    report: &str,
) -> Result<usize, ResearchError> {
    let written_at = chrono::Utc::now().to_rfc3339();
    let documents: Vec<MemoryDocument> = chunker
        .chunk(report)
        .into_iter()
        .map(|c| {
            MemoryDocument::new(c.text)
                .with_metadata("thread_id", thread_id)
                .with_metadata("research_brief", research_brief)
                .with_metadata("offset", c.offset.to_string())
                .with_metadata("written_at", written_at.clone())
        })
        .collect();
    let added = index.add(documents).await?;
    tracing::info!(thread_id = %thread_id, chunks = added, "report written to memory");
    Ok(added)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    document: MemoryDocument,
    embedding: Vec<f32>,
}

/// 内存向量索引
pub struct VectorMemoryIndex {
    embedder: Arc<dyn EmbeddingProvider>,
    entries: RwLock<Vec<IndexEntry>>,
    snapshot_path: Option<PathBuf>,
}

impl VectorMemoryIndex {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            embedder,
            entries: RwLock::new(Vec::new()),
            snapshot_path: None,
        }
    }

    /// 从快照打开；文件不存在时从空索引开始，之后的写入都会保存到该路径
    pub async fn open(embedder: Arc<dyn EmbeddingProvider>, path: impl AsRef<Path>) -> Result<Self, ResearchError> {
        let path = path.as_ref().to_path_buf();
        let entries: Vec<IndexEntry> = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| ResearchError::Memory(format!("corrupt snapshot {}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(ResearchError::Memory(format!("read {}: {e}", path.display()))),
        };
        tracing::info!(path = %path.display(), entries = entries.len(), "memory index opened");
        Ok(Self {
            embedder,
            entries: RwLock::new(entries),
            snapshot_path: Some(path),
        })
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ResearchError> {
        let v = self
            .embedder
            .embed(text)
            .await
            .map_err(|e| ResearchError::Memory(format!("embedding failed: {e}")))?;
        if v.is_empty() {
            return Err(ResearchError::Memory("empty embedding".into()));
        }
        Ok(v)
    }

    async fn save(&self, entries: &[IndexEntry]) -> Result<(), ResearchError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ResearchError::Memory(format!("create {}: {e}", parent.display())))?;
        }
        let bytes = serde_json::to_vec(entries)?;
        tokio::fs::write(path, bytes)
            .await
            .map_err(|e| ResearchError::Memory(format!("write {}: {e}", path.display())))
    }
}

#[async_trait]
impl MemoryIndex for VectorMemoryIndex {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<ScoredDocument>, ResearchError> {
        if self.is_empty().await || k == 0 {
            return Ok(Vec::new());
        }
        let query_embedding = self.embed(query).await?;
        let entries = self.entries.read().await;
        let mut scored: Vec<ScoredDocument> = entries
            .iter()
            .map(|e| ScoredDocument {
                document: e.document.clone(),
                distance: 1.0 - cosine_similarity(&query_embedding, &e.embedding),
            })
            .collect();
        scored.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        scored.truncate(k);
        Ok(scored)
    }

    async fn add(&self, documents: Vec<MemoryDocument>) -> Result<usize, ResearchError> {
        let mut embedded = Vec::with_capacity(documents.len());
        for document in documents {
            if document.content.trim().is_empty() {
                continue;
            }
            let embedding = self.embed(&document.content).await?;
            embedded.push(IndexEntry { document, embedding });
        }
        let added = embedded.len();
        if added == 0 {
            return Ok(0);
        }

        let mut entries = self.entries.write().await;
        entries.extend(embedded);
        self.save(&entries).await?;
        tracing::debug!(added, total = entries.len(), "memory index updated");
        Ok(added)
    }
}

/// 余弦相似度
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}
