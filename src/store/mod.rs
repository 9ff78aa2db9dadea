//! 任务存储抽象层
//!
//! TaskStore 是编排层唯一的共享可变资源：并发读安全，写入受单调迁移规则约束。
//! 提供两种实现：内存版（默认）与 SQLite 持久化版（`async-sqlite` feature）。

mod memory;
#[cfg(feature = "async-sqlite")]
mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::core::{Task, TaskStatus};

pub use memory::MemoryTaskStore;
#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteTaskStore;

/// 存储层错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

#[cfg(feature = "async-sqlite")]
impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// 幂等插入的结果
#[derive(Debug, Clone)]
pub enum Insertion {
    /// 新建了 Pending 记录
    Created(Task),
    /// 同一幂等键下已有未失败的任务
    Existing(Task),
}

impl Insertion {
    pub fn task(&self) -> &Task {
        match self {
            Insertion::Created(t) | Insertion::Existing(t) => t,
        }
    }
}

/// 状态写入请求：目标状态 + 可选结果 / 错误
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl StatusUpdate {
    pub fn processing() -> Self {
        Self {
            status: TaskStatus::Processing,
            result: None,
            error: None,
        }
    }

    pub fn completed(result: Value) -> Self {
        Self {
            status: TaskStatus::Completed,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failed,
            result: None,
            error: Some(error.into()),
        }
    }

    /// 失败但附带降级结果
    pub fn failed_with_fallback(result: Value, error: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failed,
            result: Some(result),
            error: Some(error.into()),
        }
    }
}

/// compare-and-set 写入结果
#[derive(Debug, Clone)]
pub enum Transition {
    /// 迁移已生效，返回新记录
    Applied(Task),
    /// 目标状态与当前非终态相同，无需写入
    Unchanged(Task),
    /// 当前状态已是终态或目标会回退；返回存储中的记录
    Rejected(Task),
}

impl Transition {
    pub fn task(&self) -> &Task {
        match self {
            Transition::Applied(t) | Transition::Unchanged(t) | Transition::Rejected(t) => t,
        }
    }

    /// 本次写入是否首次把任务推入终态（只有它负责发通知）
    pub fn entered_terminal(&self) -> bool {
        matches!(self, Transition::Applied(t) if t.status.is_terminal())
    }
}

/// 任务存储接口
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// 原子地：若同幂等键下已有状态不为 Failed 的任务则返回它，否则插入 `task`
    async fn insert_or_get(&self, task: Task) -> Result<Insertion, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<Task>, StoreError>;

    /// 查找幂等键下状态不为 Failed 的任务
    async fn find_by_key(&self, idempotency_key: &str) -> Result<Option<Task>, StoreError>;

    /// 仅当存储状态可推进到 `update.status` 时写入（终态先写者胜）
    async fn transition(&self, id: &str, update: StatusUpdate) -> Result<Option<Transition>, StoreError>;

    /// 记录传输尝试次数；终态任务不再更新
    async fn record_attempts(&self, id: &str, attempts: u32) -> Result<(), StoreError>;

    /// 所有非终态任务（用于重启后恢复对账）
    async fn list_in_flight(&self) -> Result<Vec<Task>, StoreError>;

    /// 某个用户的全部任务，按创建时间排序
    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<Task>, StoreError>;
}

/// 在内存记录上执行单调迁移；两种存储实现共用
pub(crate) fn apply_update(task: &mut Task, update: StatusUpdate) -> Transition {
    if task.status == update.status && !task.status.is_terminal() {
        return Transition::Unchanged(task.clone());
    }
    if !task.status.can_advance_to(update.status) {
        return Transition::Rejected(task.clone());
    }
    task.status = update.status;
    if update.result.is_some() {
        task.result = update.result;
    }
    if update.error.is_some() {
        task.error = update.error;
    }
    task.updated_at = chrono::Utc::now().timestamp_millis().max(task.updated_at);
    Transition::Applied(task.clone())
}

/// 创建任务存储
///
/// 如果提供了 db_path 且启用了 async-sqlite feature，则使用持久化存储；否则使用内存存储
pub async fn create_task_store(db_path: Option<&std::path::Path>) -> Arc<dyn TaskStore> {
    #[cfg(feature = "async-sqlite")]
    if let Some(path) = db_path {
        match SqliteTaskStore::new(path).await {
            Ok(store) => {
                tracing::info!("Using sqlite task store: {:?}", path);
                return Arc::new(store);
            }
            Err(e) => {
                tracing::warn!("Failed to open sqlite task store, falling back to memory: {}", e);
            }
        }
    }

    #[cfg(not(feature = "async-sqlite"))]
    if db_path.is_some() {
        tracing::warn!("Persistent task store requested but async-sqlite feature not enabled, using memory store");
    }

    tracing::info!("Using in-memory task store");
    Arc::new(MemoryTaskStore::new())
}
