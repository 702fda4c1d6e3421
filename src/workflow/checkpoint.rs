//! 检查点存储
//!
//! CheckpointStore 以 thread_id 为键保存最新检查点。put 拒绝版本号不大于已存版本的写入（StaleCheckpoint），
//! 同一会话的并发写因此只有一个能成功。提供内存实现（测试、单进程）与 SQLite 实现（跨重启持久）。

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::RwLock;

use crate::core::ResearchError;
use crate::workflow::{Checkpoint, RunStatus};

/// 检查点存储 trait
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, thread_id: &str) -> Result<Option<Checkpoint>, ResearchError>;

    /// 写入检查点；checkpoint.version 必须大于已存版本
    async fn put(&self, checkpoint: &Checkpoint) -> Result<(), ResearchError>;

    /// 删除检查点；返回是否存在
    async fn delete(&self, thread_id: &str) -> Result<bool, ResearchError>;
}

fn check_version(thread_id: &str, stored: Option<u64>, attempted: u64) -> Result<(), ResearchError> {
    match stored {
        Some(stored) if attempted <= stored => Err(ResearchError::StaleCheckpoint {
            thread_id: thread_id.to_string(),
            stored,
            attempted,
        }),
        _ => Ok(()),
    }
}

/// 内存检查点存储
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: RwLock<HashMap<String, Checkpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.checkpoints.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.checkpoints.read().await.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get(&self, thread_id: &str) -> Result<Option<Checkpoint>, ResearchError> {
        Ok(self.checkpoints.read().await.get(thread_id).cloned())
    }

    async fn put(&self, checkpoint: &Checkpoint) -> Result<(), ResearchError> {
        let mut map = self.checkpoints.write().await;
        let stored = map.get(&checkpoint.thread_id).map(|c| c.version);
        check_version(&checkpoint.thread_id, stored, checkpoint.version)?;
        map.insert(checkpoint.thread_id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn delete(&self, thread_id: &str) -> Result<bool, ResearchError> {
        Ok(self.checkpoints.write().await.remove(thread_id).is_some())
    }
}

fn db_err(context: &str, e: impl std::fmt::Display) -> ResearchError {
    ResearchError::Persistence(format!("{context}: {e}"))
}

/// SQLite 检查点存储；表结构在 open 时创建一次
pub struct SqliteCheckpointStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCheckpointStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ResearchError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| db_err("create data dir", e))?;
            }
        }
        let conn = Connection::open(path).map_err(|e| db_err("open checkpoint db", e))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, ResearchError> {
        let conn = Connection::open_in_memory().map_err(|e| db_err("open checkpoint db", e))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, ResearchError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                 thread_id TEXT PRIMARY KEY,
                 version INTEGER NOT NULL,
                 stage TEXT NOT NULL,
                 status TEXT NOT NULL,
                 state TEXT NOT NULL,
                 updated_at INTEGER NOT NULL
             );",
        )
        .map_err(|e| db_err("create checkpoints table", e))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, ResearchError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, ResearchError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| db_err("checkpoint db lock poisoned", e))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| db_err("task join error", e))?
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn get(&self, thread_id: &str) -> Result<Option<Checkpoint>, ResearchError> {
        let tid = thread_id.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT thread_id, version, stage, status, state, updated_at
                     FROM checkpoints WHERE thread_id = ?1",
                    params![tid],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, i64>(5)?,
                        ))
                    },
                )
                .optional()
                .map_err(|e| db_err("load checkpoint", e))?;

            let Some((thread_id, version, stage, status, state, updated_at)) = row else {
                return Ok(None);
            };
            let status: RunStatus =
                serde_json::from_str(&status).map_err(|e| db_err("decode status", e))?;
            let state = serde_json::from_str(&state).map_err(|e| db_err("decode state", e))?;
            Ok(Some(Checkpoint {
                thread_id,
                state,
                stage,
                version: version as u64,
                status,
                updated_at,
            }))
        })
        .await
    }

    async fn put(&self, checkpoint: &Checkpoint) -> Result<(), ResearchError> {
        let cp = checkpoint.clone();
        let status = serde_json::to_string(&cp.status)?;
        let state = serde_json::to_string(&cp.state)?;
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(|e| db_err("begin transaction", e))?;
            let stored: Option<i64> = tx
                .query_row(
                    "SELECT version FROM checkpoints WHERE thread_id = ?1",
                    params![cp.thread_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| db_err("read version", e))?;
            check_version(&cp.thread_id, stored.map(|v| v as u64), cp.version)?;
            tx.execute(
                "INSERT OR REPLACE INTO checkpoints
                 (thread_id, version, stage, status, state, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    cp.thread_id,
                    cp.version as i64,
                    cp.stage,
                    status,
                    state,
                    cp.updated_at
                ],
            )
            .map_err(|e| db_err("save checkpoint", e))?;
            tx.commit().map_err(|e| db_err("commit checkpoint", e))
        })
        .await
    }

    async fn delete(&self, thread_id: &str) -> Result<bool, ResearchError> {
        let tid = thread_id.to_string();
        self.with_conn(move |conn| {
            let n = conn
                .execute("DELETE FROM checkpoints WHERE thread_id = ?1", params![tid])
                .map_err(|e| db_err("delete checkpoint", e))?;
            Ok(n > 0)
        })
        .await
    }
}
