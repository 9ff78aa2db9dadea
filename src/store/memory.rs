//! 内存任务存储
//!
//! 一把写锁同时保护任务表与幂等键索引，因此「查重 + 插入」和「读状态 + 写状态」都是原子的。

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{apply_update, Insertion, StatusUpdate, StoreError, TaskStore, Transition};
use crate::core::{Task, TaskId, TaskStatus};

#[derive(Default)]
struct Inner {
    tasks: HashMap<TaskId, Task>,
    /// 幂等键 -> 最近一个状态不为 Failed 的任务
    by_key: HashMap<String, TaskId>,
}

/// 内存版 TaskStore
#[derive(Default)]
pub struct MemoryTaskStore {
    inner: RwLock<Inner>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.tasks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn insert_or_get(&self, task: Task) -> Result<Insertion, StoreError> {
        let mut inner = self.inner.write().await;

        if let Some(existing_id) = inner.by_key.get(&task.idempotency_key) {
            if let Some(existing) = inner.tasks.get(existing_id) {
                if existing.status != TaskStatus::Failed {
                    return Ok(Insertion::Existing(existing.clone()));
                }
            }
        }

        inner
            .by_key
            .insert(task.idempotency_key.clone(), task.id.clone());
        inner.tasks.insert(task.id.clone(), task.clone());
        Ok(Insertion::Created(task))
    }

    async fn get(&self, id: &str) -> Result<Option<Task>, StoreError> {
        Ok(self.inner.read().await.tasks.get(id).cloned())
    }

    async fn find_by_key(&self, idempotency_key: &str) -> Result<Option<Task>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_key
            .get(idempotency_key)
            .and_then(|id| inner.tasks.get(id))
            .filter(|t| t.status != TaskStatus::Failed)
            .cloned())
    }

    async fn transition(&self, id: &str, update: StatusUpdate) -> Result<Option<Transition>, StoreError> {
        let mut inner = self.inner.write().await;
        Ok(inner.tasks.get_mut(id).map(|task| apply_update(task, update)))
    }

    async fn record_attempts(&self, id: &str, attempts: u32) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(task) = inner.tasks.get_mut(id) {
            if !task.is_finished() {
                task.attempt = task.attempt.max(attempts);
                task.updated_at = chrono::Utc::now().timestamp_millis().max(task.updated_at);
            }
        }
        Ok(())
    }

    async fn list_in_flight(&self) -> Result<Vec<Task>, StoreError> {
        let inner = self.inner.read().await;
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| !t.is_finished())
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<Task>, StoreError> {
        let inner = self.inner.read().await;
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.owner_id == owner_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::core::TaskKind;

    fn task(key: &str) -> Task {
        Task::new(
            TaskKind::CommitSummary,
            "user_1",
            "repo_1",
            key.to_string(),
            json!({"commitData": {"sha": "abc"}}),
        )
    }

    #[tokio::test]
    async fn test_insert_is_idempotent() {
        let store = MemoryTaskStore::new();
        let first = store.insert_or_get(task("k")).await.unwrap();
        let second = store.insert_or_get(task("k")).await.unwrap();

        assert!(matches!(first, Insertion::Created(_)));
        match second {
            Insertion::Existing(t) => assert_eq!(t.id, first.task().id),
            _ => panic!("Expected Existing"),
        }
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_failed_task_does_not_block_resubmission() {
        let store = MemoryTaskStore::new();
        let first = store.insert_or_get(task("k")).await.unwrap();
        store
            .transition(&first.task().id, StatusUpdate::failed("boom"))
            .await
            .unwrap();

        assert!(store.find_by_key("k").await.unwrap().is_none());
        let again = store.insert_or_get(task("k")).await.unwrap();
        assert!(matches!(again, Insertion::Created(_)));
        assert_ne!(again.task().id, first.task().id);
    }

    #[tokio::test]
    async fn test_concurrent_inserts_create_one_record() {
        let store = Arc::new(MemoryTaskStore::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.insert_or_get(task("same")).await.unwrap().task().id.clone()
            }));
        }
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_terminal_is_first_writer_wins() {
        let store = MemoryTaskStore::new();
        let id = store.insert_or_get(task("k")).await.unwrap().task().id.clone();

        let t = store.transition(&id, StatusUpdate::processing()).await.unwrap().unwrap();
        assert!(matches!(t, Transition::Applied(_)));

        let done = store
            .transition(&id, StatusUpdate::completed(json!({"summary": "ok"})))
            .await
            .unwrap()
            .unwrap();
        assert!(done.entered_terminal());

        let late = store
            .transition(&id, StatusUpdate::failed_with_fallback(json!({"answer": "x"}), "late"))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(late, Transition::Rejected(_)));

        let back = store.transition(&id, StatusUpdate::processing()).await.unwrap().unwrap();
        assert!(matches!(back, Transition::Rejected(_)));

        let stored = store.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.result, Some(json!({"summary": "ok"})));
        assert!(stored.error.is_none());
    }

    #[tokio::test]
    async fn test_repeated_processing_is_unchanged() {
        let store = MemoryTaskStore::new();
        let id = store.insert_or_get(task("k")).await.unwrap().task().id.clone();
        store.transition(&id, StatusUpdate::processing()).await.unwrap();
        let again = store.transition(&id, StatusUpdate::processing()).await.unwrap().unwrap();
        assert!(matches!(again, Transition::Unchanged(_)));
    }

    #[tokio::test]
    async fn test_unknown_task_transition_is_none() {
        let store = MemoryTaskStore::new();
        assert!(store
            .transition("missing", StatusUpdate::processing())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_attempts_frozen_after_terminal() {
        let store = MemoryTaskStore::new();
        let id = store.insert_or_get(task("k")).await.unwrap().task().id.clone();
        store.record_attempts(&id, 2).await.unwrap();
        store.transition(&id, StatusUpdate::failed("x")).await.unwrap();
        store.record_attempts(&id, 3).await.unwrap();
        assert_eq!(store.get(&id).await.unwrap().unwrap().attempt, 2);
        assert!(store.list_in_flight().await.unwrap().is_empty());
    }
}
