//! 任务台账：研究任务的状态流转、简报、最终报告与各智能体的 token 用量
//!
//! 状态序列：clarifying → searching → summarizing → completed | failed。
//! 内存实现额外记录状态历史；SQLite 实现使用 research_tasks 与 agent_metrics 两张表。

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::ResearchError;
use crate::llm::{AgentRole, Usage};

/// 台账中的任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Clarifying,
    Searching,
    Summarizing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Clarifying => "clarifying",
            TaskStatus::Searching => "searching",
            TaskStatus::Summarizing => "summarizing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "clarifying" => Some(TaskStatus::Clarifying),
            "searching" => Some(TaskStatus::Searching),
            "summarizing" => Some(TaskStatus::Summarizing),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单个智能体的累计用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub calls: u64,
}

impl AgentUsage {
    fn add(&mut self, usage: Usage) {
        self.prompt_tokens += usage.prompt_tokens;
        self.completion_tokens += usage.completion_tokens;
        self.calls += 1;
    }
}

/// 一个研究任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub thread_id: String,
    pub query: String,
    pub status: TaskStatus,
    pub research_brief: Option<String>,
    pub final_report: Option<String>,
    pub error: Option<String>,
    /// 按智能体（scope / supervisor / researcher / reporter）汇总
    pub usage: BTreeMap<String, AgentUsage>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TaskRecord {
    fn new(thread_id: &str, query: &str) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            thread_id: thread_id.to_string(),
            query: query.to_string(),
            status: TaskStatus::Clarifying,
            research_brief: None,
            final_report: None,
            error: None,
            usage: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.usage
            .values()
            .map(|u| u.prompt_tokens + u.completion_tokens)
            .sum()
    }
}

/// 任务台账接口
#[async_trait]
pub trait TaskLedger: Send + Sync {
    /// 新建任务（状态 clarifying）；已存在时不做修改
    async fn create_task(&self, thread_id: &str, query: &str) -> Result<(), ResearchError>;

    async fn set_status(&self, thread_id: &str, status: TaskStatus) -> Result<(), ResearchError>;

    async fn set_brief(&self, thread_id: &str, brief: &str) -> Result<(), ResearchError>;

    /// 写入最终报告并置为 completed
    async fn complete(&self, thread_id: &str, final_report: &str) -> Result<(), ResearchError>;

    /// 记录错误并置为 failed
    async fn fail(&self, thread_id: &str, error: &str) -> Result<(), ResearchError>;

    async fn record_usage(&self, thread_id: &str, agent: AgentRole, usage: Usage) -> Result<(), ResearchError>;

    async fn get(&self, thread_id: &str) -> Result<Option<TaskRecord>, ResearchError>;
}

fn unknown_task(thread_id: &str) -> ResearchError {
    ResearchError::Persistence(format!("unknown task: {thread_id}"))
}

/// 内存台账（测试与未配置数据库时使用）
#[derive(Default)]
pub struct InMemoryTaskLedger {
    tasks: RwLock<HashMap<String, TaskRecord>>,
    history: RwLock<HashMap<String, Vec<TaskStatus>>>,
}

impl InMemoryTaskLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// 状态历史（连续重复的状态只记一次）
    pub async fn status_history(&self, thread_id: &str) -> Vec<TaskStatus> {
        self.history
            .read()
            .await
            .get(thread_id)
            .cloned()
            .unwrap_or_default()
    }

    async fn update<F>(&self, thread_id: &str, f: F) -> Result<(), ResearchError>
    where
        F: FnOnce(&mut TaskRecord) + Send,
    {
        let status = {
            let mut tasks = self.tasks.write().await;
            let task = tasks.get_mut(thread_id).ok_or_else(|| unknown_task(thread_id))?;
            f(task);
            task.updated_at = chrono::Utc::now().timestamp_millis();
            task.status
        };
        let mut history = self.history.write().await;
        let entries = history.entry(thread_id.to_string()).or_default();
        if entries.last() != Some(&status) {
            entries.push(status);
        }
        Ok(())
    }
}

#[async_trait]
impl TaskLedger for InMemoryTaskLedger {
    async fn create_task(&self, thread_id: &str, query: &str) -> Result<(), ResearchError> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(thread_id) {
            return Ok(());
        }
        tasks.insert(thread_id.to_string(), TaskRecord::new(thread_id, query));
        self.history
            .write()
            .await
            .insert(thread_id.to_string(), vec![TaskStatus::Clarifying]);
        Ok(())
    }

    async fn set_status(&self, thread_id: &str, status: TaskStatus) -> Result<(), ResearchError> {
        self.update(thread_id, |t| t.status = status).await
    }

    async fn set_brief(&self, thread_id: &str, brief: &str) -> Result<(), ResearchError> {
        let brief = brief.to_string();
        self.update(thread_id, move |t| t.research_brief = Some(brief)).await
    }

    async fn complete(&self, thread_id: &str, final_report: &str) -> Result<(), ResearchError> {
        let report = final_report.to_string();
        self.update(thread_id, move |t| {
            t.final_report = Some(report);
            t.error = None;
            t.status = TaskStatus::Completed;
        })
        .await
    }

    async fn fail(&self, thread_id: &str, error: &str) -> Result<(), ResearchError> {
        let error = error.to_string();
        self.update(thread_id, move |t| {
            t.error = Some(error);
            t.status = TaskStatus::Failed;
        })
        .await
    }

    async fn record_usage(&self, thread_id: &str, agent: AgentRole, usage: Usage) -> Result<(), ResearchError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(thread_id).ok_or_else(|| unknown_task(thread_id))?;
        task.usage.entry(agent.as_str().to_string()).or_default().add(usage);
        Ok(())
    }

    async fn get(&self, thread_id: &str) -> Result<Option<TaskRecord>, ResearchError> {
        Ok(self.tasks.read().await.get(thread_id).cloned())
    }
}

fn db_err(context: &str, e: impl std::fmt::Display) -> ResearchError {
    ResearchError::Persistence(format!("{context}: {e}"))
}

/// SQLite 台账；表结构在 open 时创建一次
pub struct SqliteTaskLedger {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTaskLedger {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ResearchError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| db_err("create data dir", e))?;
            }
        }
        let conn = Connection::open(path).map_err(|e| db_err("open ledger db", e))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, ResearchError> {
        let conn = Connection::open_in_memory().map_err(|e| db_err("open ledger db", e))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, ResearchError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS research_tasks (
                 thread_id TEXT PRIMARY KEY,
                 query TEXT NOT NULL,
                 status TEXT NOT NULL,
                 research_brief TEXT,
                 final_report TEXT,
                 error TEXT,
                 created_at INTEGER NOT NULL,
                 updated_at INTEGER NOT NULL
             );
             CREATE TABLE IF NOT EXISTS agent_metrics (
                 thread_id TEXT NOT NULL,
                 agent TEXT NOT NULL,
                 prompt_tokens INTEGER NOT NULL DEFAULT 0,
                 completion_tokens INTEGER NOT NULL DEFAULT 0,
                 calls INTEGER NOT NULL DEFAULT 0,
                 PRIMARY KEY (thread_id, agent)
             );",
        )
        .map_err(|e| db_err("create ledger tables", e))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, ResearchError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, ResearchError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|e| db_err("ledger db lock poisoned", e))?;
            f(&guard)
        })
        .await
        .map_err(|e| db_err("task join error", e))?
    }

    /// 执行一条 UPDATE research_tasks 语句；没有命中行时视为未知任务
    async fn update(&self, thread_id: &str, sql: &'static str, value: Option<String>) -> Result<(), ResearchError> {
        let tid = thread_id.to_string();
        self.with_conn(move |conn| {
            let now = chrono::Utc::now().timestamp_millis();
            let changed = conn
                .execute(sql, params![value, now, tid])
                .map_err(|e| db_err("update task", e))?;
            if changed == 0 {
                return Err(unknown_task(&tid));
            }
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl TaskLedger for SqliteTaskLedger {
    async fn create_task(&self, thread_id: &str, query: &str) -> Result<(), ResearchError> {
        let record = TaskRecord::new(thread_id, query);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO research_tasks
                 (thread_id, query, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.thread_id,
                    record.query,
                    record.status.as_str(),
                    record.created_at,
                    record.updated_at
                ],
            )
            .map_err(|e| db_err("insert task", e))?;
            Ok(())
        })
        .await
    }

    async fn set_status(&self, thread_id: &str, status: TaskStatus) -> Result<(), ResearchError> {
        self.update(
            thread_id,
            "UPDATE research_tasks SET status = ?1, updated_at = ?2 WHERE thread_id = ?3",
            Some(status.as_str().to_string()),
        )
        .await
    }

    async fn set_brief(&self, thread_id: &str, brief: &str) -> Result<(), ResearchError> {
        self.update(
            thread_id,
            "UPDATE research_tasks SET research_brief = ?1, updated_at = ?2 WHERE thread_id = ?3",
            Some(brief.to_string()),
        )
        .await
    }

    async fn complete(&self, thread_id: &str, final_report: &str) -> Result<(), ResearchError> {
        self.update(
            thread_id,
            "UPDATE research_tasks SET final_report = ?1, error = NULL, status = 'completed', updated_at = ?2
             WHERE thread_id = ?3",
            Some(final_report.to_string()),
        )
        .await
    }

    async fn fail(&self, thread_id: &str, error: &str) -> Result<(), ResearchError> {
        self.update(
            thread_id,
            "UPDATE research_tasks SET error = ?1, status = 'failed', updated_at = ?2 WHERE thread_id = ?3",
            Some(error.to_string()),
        )
        .await
    }

    async fn record_usage(&self, thread_id: &str, agent: AgentRole, usage: Usage) -> Result<(), ResearchError> {
        let tid = thread_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO agent_metrics (thread_id, agent, prompt_tokens, completion_tokens, calls)
                 VALUES (?1, ?2, ?3, ?4, 1)
                 ON CONFLICT(thread_id, agent) DO UPDATE SET
                     prompt_tokens = prompt_tokens + excluded.prompt_tokens,
                     completion_tokens = completion_tokens + excluded.completion_tokens,
                     calls = calls + 1",
                params![
                    tid,
                    agent.as_str(),
                    usage.prompt_tokens as i64,
                    usage.completion_tokens as i64
                ],
            )
            .map_err(|e| db_err("record usage", e))?;
            Ok(())
        })
        .await
    }

    async fn get(&self, thread_id: &str) -> Result<Option<TaskRecord>, ResearchError> {
        let tid = thread_id.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT thread_id, query, status, research_brief, final_report, error, created_at, updated_at
                     FROM research_tasks WHERE thread_id = ?1",
                    params![tid],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Option<String>>(3)?,
                            row.get::<_, Option<String>>(4)?,
                            row.get::<_, Option<String>>(5)?,
                            row.get::<_, i64>(6)?,
                            row.get::<_, i64>(7)?,
                        ))
                    },
                )
                .optional()
                .map_err(|e| db_err("load task", e))?;
            let Some((thread_id, query, status, research_brief, final_report, error, created_at, updated_at)) = row
            else {
                return Ok(None);
            };
            let status = TaskStatus::parse(&status)
                .ok_or_else(|| db_err("decode status", format!("unknown status `{status}`")))?;

            let mut stmt = conn
                .prepare(
                    "SELECT agent, prompt_tokens, completion_tokens, calls
                     FROM agent_metrics WHERE thread_id = ?1",
                )
                .map_err(|e| db_err("load usage", e))?;
            let usage = stmt
                .query_map(params![thread_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        AgentUsage {
                            prompt_tokens: row.get::<_, i64>(1)? as u64,
                            completion_tokens: row.get::<_, i64>(2)? as u64,
                            calls: row.get::<_, i64>(3)? as u64,
                        },
                    ))
                })
                .map_err(|e| db_err("load usage", e))?
                .collect::<Result<BTreeMap<_, _>, _>>()
                .map_err(|e| db_err("load usage", e))?;

            Ok(Some(TaskRecord {
                thread_id,
                query,
                status,
                research_brief,
                final_report,
                error,
                usage,
                created_at,
                updated_at,
            }))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise(ledger: &dyn TaskLedger) {
        ledger.create_task("t1", "what is tokio?").await.unwrap();
        ledger.create_task("t1", "ignored").await.unwrap();
        ledger.set_brief("t1", "Explain tokio").await.unwrap();
        ledger.set_status("t1", TaskStatus::Searching).await.unwrap();
        ledger
            .record_usage("t1", AgentRole::Supervisor, Usage::new(100, 20))
            .await
            .unwrap();
        ledger
            .record_usage("t1", AgentRole::Supervisor, Usage::new(50, 10))
            .await
            .unwrap();
        ledger
            .record_usage("t1", AgentRole::Reporter, Usage::new(5, 5))
            .await
            .unwrap();
        ledger.complete("t1", "# Tokio").await.unwrap();

        let task = ledger.get("t1").await.unwrap().unwrap();
        assert_eq!(task.query, "what is tokio?");
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.research_brief.as_deref(), Some("Explain tokio"));
        assert_eq!(task.final_report.as_deref(), Some("# Tokio"));
        let supervisor = task.usage.get("supervisor").copied().unwrap();
        assert_eq!(supervisor.prompt_tokens, 150);
        assert_eq!(supervisor.calls, 2);
        assert_eq!(task.total_tokens(), 190);

        assert!(ledger.get("missing").await.unwrap().is_none());
        assert!(ledger.set_status("missing", TaskStatus::Failed).await.is_err());
    }

    #[tokio::test]
    async fn test_in_memory_ledger() {
        let ledger = InMemoryTaskLedger::new();
        exercise(&ledger).await;
        assert_eq!(
            ledger.status_history("t1").await,
            vec![TaskStatus::Clarifying, TaskStatus::Searching, TaskStatus::Completed]
        );
    }

    #[tokio::test]
    async fn test_sqlite_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = SqliteTaskLedger::open(dir.path().join("ledger.db")).unwrap();
        exercise(&ledger).await;

        ledger.create_task("t2", "q").await.unwrap();
        ledger.fail("t2", "search failed").await.unwrap();
        let task = ledger.get("t2").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("search failed"));
    }

    #[test]
    fn test_status_parse() {
        for status in [
            TaskStatus::Clarifying,
            TaskStatus::Searching,
            TaskStatus::Summarizing,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("paused"), None);
    }
}
