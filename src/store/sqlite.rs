//! SQLite 任务存储（sqlx，异步）
//!
//! - 幂等：`idempotency_key` 上的部分唯一索引（排除 Failed），冲突时回读已有记录
//! - compare-and-set：`UPDATE ... WHERE id = ? AND status = <读到的状态>`，受影响行数为 0 说明有并发写者，重读后再判定

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use super::{apply_update, Insertion, StatusUpdate, StoreError, TaskStore, Transition};
use crate::core::{Task, TaskKind, TaskStatus};

const COLUMNS: &str = "id, kind, idempotency_key, status, payload, result, error, attempt,
                       owner_id, owner_entity_id, created_at, updated_at";

/// SQLite 版 TaskStore
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    /// 打开（或创建）数据库文件并建表
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    /// 从连接池创建
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    async fn init_tables(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS orchestrated_tasks (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                idempotency_key TEXT NOT NULL,
                status TEXT NOT NULL,
                payload TEXT NOT NULL,
                result TEXT,
                error TEXT,
                attempt INTEGER NOT NULL DEFAULT 0,
                owner_id TEXT NOT NULL,
                owner_entity_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_active_key
             ON orchestrated_tasks(idempotency_key) WHERE status != 'Failed'",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_owner ON orchestrated_tasks(owner_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_status ON orchestrated_tasks(status)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

fn row_to_task(row: &SqliteRow) -> Result<Task, StoreError> {
    let id: String = row.get("id");
    let kind_str: String = row.get("kind");
    let status_str: String = row.get("status");
    let kind = TaskKind::parse(&kind_str).ok_or_else(|| StoreError::Corrupt {
        id: id.clone(),
        reason: format!("unknown kind {kind_str}"),
    })?;
    let status = TaskStatus::parse(&status_str).ok_or_else(|| StoreError::Corrupt {
        id: id.clone(),
        reason: format!("unknown status {status_str}"),
    })?;
    let payload: String = row.get("payload");
    let result: Option<String> = row.get("result");

    Ok(Task {
        kind,
        status,
        idempotency_key: row.get("idempotency_key"),
        payload: serde_json::from_str(&payload)?,
        result: result.map(|s| serde_json::from_str(&s)).transpose()?,
        error: row.get("error"),
        attempt: row.get::<i64, _>("attempt") as u32,
        owner_id: row.get("owner_id"),
        owner_entity_id: row.get("owner_entity_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        id,
    })
}

impl SqliteTaskStore {
    async fn fetch_one(&self, id: &str) -> Result<Option<Task>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM orchestrated_tasks WHERE id = ?");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(row_to_task).transpose()
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert_or_get(&self, task: Task) -> Result<Insertion, StoreError> {
        let payload = serde_json::to_string(&task.payload)?;
        let result = task.result.as_ref().map(serde_json::to_string).transpose()?;

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO orchestrated_tasks
             (id, kind, idempotency_key, status, payload, result, error, attempt,
              owner_id, owner_entity_id, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&task.id)
        .bind(task.kind.as_str())
        .bind(&task.idempotency_key)
        .bind(task.status.as_str())
        .bind(&payload)
        .bind(&result)
        .bind(&task.error)
        .bind(task.attempt as i64)
        .bind(&task.owner_id)
        .bind(&task.owner_entity_id)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 1 {
            return Ok(Insertion::Created(task));
        }

        match self.find_by_key(&task.idempotency_key).await? {
            Some(existing) => Ok(Insertion::Existing(existing)),
            None => Err(StoreError::Database(format!(
                "insert of {} ignored but no active task holds its key",
                task.id
            ))),
        }
    }

    async fn get(&self, id: &str) -> Result<Option<Task>, StoreError> {
        self.fetch_one(id).await
    }

    async fn find_by_key(&self, idempotency_key: &str) -> Result<Option<Task>, StoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM orchestrated_tasks
             WHERE idempotency_key = ? AND status != 'Failed'
             ORDER BY created_at DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(idempotency_key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_task).transpose()
    }

    async fn transition(&self, id: &str, update: StatusUpdate) -> Result<Option<Transition>, StoreError> {
        // 状态只能单调推进，输给并发写者后重读最多也只会再走两轮
        loop {
            let Some(mut current) = self.fetch_one(id).await? else {
                return Ok(None);
            };
            let prior = current.status;

            let next = match apply_update(&mut current, update.clone()) {
                Transition::Applied(next) => next,
                other => return Ok(Some(other)),
            };

            let result = next.result.as_ref().map(serde_json::to_string).transpose()?;
            let affected = sqlx::query(
                "UPDATE orchestrated_tasks
                 SET status = ?, result = ?, error = ?, updated_at = ?
                 WHERE id = ? AND status = ?",
            )
            .bind(next.status.as_str())
            .bind(&result)
            .bind(&next.error)
            .bind(next.updated_at)
            .bind(id)
            .bind(prior.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();

            if affected == 1 {
                return Ok(Some(Transition::Applied(next)));
            }
            tracing::debug!("Task {} changed concurrently, re-reading before transition", id);
        }
    }

    async fn record_attempts(&self, id: &str, attempts: u32) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE orchestrated_tasks SET attempt = MAX(attempt, ?), updated_at = ?
             WHERE id = ? AND status IN ('Pending', 'Processing')",
        )
        .bind(attempts as i64)
        .bind(chrono::Utc::now().timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_in_flight(&self) -> Result<Vec<Task>, StoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM orchestrated_tasks
             WHERE status IN ('Pending', 'Processing') ORDER BY created_at ASC"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_task).collect()
    }

    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<Task>, StoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM orchestrated_tasks WHERE owner_id = ? ORDER BY created_at ASC"
        );
        let rows = sqlx::query(&sql).bind(owner_id).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_task).collect()
    }
}
