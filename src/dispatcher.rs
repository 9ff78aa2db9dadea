//! 任务分发
//!
//! `submit` 同步完成校验与幂等插入（记录对轮询者立即可见），随后在后台驱动任务：
//! Pending → Processing → 调用 Worker → 终态（或交给对账器轮询）。

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::{content_fingerprint, idempotency_key, OrchestratorError, Task, TaskId, TaskKind, TaskStatus};
use crate::fallback::{question_of, FallbackSynthesizer};
use crate::notify::NotificationEmitter;
use crate::reconciler::{apply_transition, StatusReconciler};
use crate::store::{Insertion, StatusUpdate, TaskStore};
use crate::token::DownloadTokenSigner;
use crate::worker::{SubmitReply, WorkerClient};

/// 提交结果
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitOutcome {
    pub task_id: TaskId,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// 命中了已有任务，没有新的分发
    pub deduplicated: bool,
}

impl SubmitOutcome {
    fn from_task(task: &Task, deduplicated: bool) -> Self {
        Self {
            task_id: task.id.clone(),
            status: task.status,
            result: task.result.clone(),
            deduplicated,
        }
    }
}

/// 任务分发器
#[derive(Clone)]
pub struct TaskDispatcher {
    store: Arc<dyn TaskStore>,
    worker: WorkerClient,
    reconciler: Arc<StatusReconciler>,
    fallback: Arc<FallbackSynthesizer>,
    notifier: NotificationEmitter,
    signer: Arc<DownloadTokenSigner>,
    shutdown: CancellationToken,
}

impl TaskDispatcher {
    pub fn new(
        store: Arc<dyn TaskStore>,
        worker: WorkerClient,
        reconciler: Arc<StatusReconciler>,
        fallback: Arc<FallbackSynthesizer>,
        notifier: NotificationEmitter,
        signer: Arc<DownloadTokenSigner>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            worker,
            reconciler,
            fallback,
            notifier,
            signer,
            shutdown,
        }
    }

    /// 提交任务
    ///
    /// 同一 `(kind, owner_entity_id, 内容指纹)` 下已有未失败的任务时直接返回它（含已完成的结果），
    /// 不会重复分发；校验失败时不创建记录。
    pub async fn submit(
        &self,
        kind: TaskKind,
        owner_id: &str,
        owner_entity_id: &str,
        payload: Value,
    ) -> Result<SubmitOutcome, OrchestratorError> {
        Ok(self
            .submit_inner(kind, owner_id, owner_entity_id, payload)
            .await?
            .0)
    }

    /// 与 `submit` 相同，另外返回后台驱动任务的句柄（命中已有任务时为 None）
    pub async fn submit_inner(
        &self,
        kind: TaskKind,
        owner_id: &str,
        owner_entity_id: &str,
        payload: Value,
    ) -> Result<(SubmitOutcome, Option<JoinHandle<()>>), OrchestratorError> {
        if owner_id.trim().is_empty() {
            return Err(OrchestratorError::Validation("ownerId is required".to_string()));
        }
        if owner_entity_id.trim().is_empty() {
            return Err(OrchestratorError::Validation("ownerEntityId is required".to_string()));
        }
        let fingerprint = content_fingerprint(kind, &payload)?;
        let key = idempotency_key(kind, owner_entity_id, &fingerprint);
        let task = Task::new(kind, owner_id, owner_entity_id, key, payload);

        match self.store.insert_or_get(task).await? {
            Insertion::Existing(existing) => {
                tracing::info!(
                    "Duplicate {} submission for {}, reusing {} ({})",
                    kind,
                    owner_entity_id,
                    existing.id,
                    existing.status
                );
                Ok((SubmitOutcome::from_task(&existing, true), None))
            }
            Insertion::Created(created) => {
                tracing::info!("Created {} task {} for {}", kind, created.id, owner_entity_id);
                let outcome = SubmitOutcome::from_task(&created, false);
                let this = self.clone();
                let handle = tokio::spawn(async move { this.run(created).await });
                Ok((outcome, Some(handle)))
            }
        }
    }

    pub async fn get(&self, task_id: &str) -> Result<Task, OrchestratorError> {
        self.store
            .get(task_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("task {task_id}")))
    }

    pub async fn list_for_owner(&self, owner_id: &str) -> Result<Vec<Task>, OrchestratorError> {
        Ok(self.store.list_by_owner(owner_id).await?)
    }

    /// 驱动一个新建任务直到终态；错误只记录日志
    pub async fn run(&self, task: Task) {
        if let Err(e) = self.drive(&task).await {
            match e {
                OrchestratorError::Cancelled => {
                    tracing::info!("Dispatch of {} interrupted by shutdown", task.id)
                }
                e => tracing::error!("Dispatch of {} aborted: {}", task.id, e),
            }
        }
    }

    async fn drive(&self, task: &Task) -> Result<(), OrchestratorError> {
        let cancel = self.shutdown.child_token();
        apply_transition(&self.store, &self.notifier, &task.id, StatusUpdate::processing()).await?;

        match self.worker.submit(task, &cancel).await {
            Ok((reply, attempts)) => {
                self.store.record_attempts(&task.id, attempts).await?;
                match reply {
                    SubmitReply::Finished(result) => {
                        let result = self.decorate(task, result);
                        apply_transition(&self.store, &self.notifier, &task.id, StatusUpdate::completed(result))
                            .await?;
                    }
                    SubmitReply::Accepted => {
                        tracing::info!("Worker accepted {}, polling for status", task.id);
                        self.reconciler.watch(&task.id, &cancel).await?;
                    }
                    SubmitReply::Failed(error) => {
                        tracing::warn!("Worker reported failure for {}: {}", task.id, error);
                        apply_transition(&self.store, &self.notifier, &task.id, StatusUpdate::failed(error))
                            .await?;
                    }
                }
            }
            Err(OrchestratorError::Cancelled) => return Err(OrchestratorError::Cancelled),
            Err(e) => {
                if let OrchestratorError::WorkerUnavailable { attempts, .. } = &e {
                    self.store.record_attempts(&task.id, *attempts).await?;
                }
                let unavailable = matches!(e, OrchestratorError::WorkerUnavailable { .. });
                if unavailable && task.kind.supports_fallback() {
                    self.fallback
                        .apply(&self.store, &self.notifier, &task.id, question_of(task), &e.to_string())
                        .await?;
                } else {
                    tracing::warn!("Task {} failed: {}", task.id, e);
                    apply_transition(&self.store, &self.notifier, &task.id, StatusUpdate::failed(e.to_string()))
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// 上传成功的结果附带签名下载令牌
    fn decorate(&self, task: &Task, mut result: Value) -> Value {
        if task.kind == TaskKind::AttachmentUpload {
            if let Value::Object(map) = &mut result {
                map.insert(
                    "downloadToken".to_string(),
                    Value::String(self.signer.issue(&task.id, &task.owner_id)),
                );
            }
        }
        result
    }
}
