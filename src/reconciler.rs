//! 状态对账
//!
//! 查询 Worker 上报的作业状态，按单调迁移规则写回 TaskStore。
//! 终态先写者胜：降级结果已落盘后到达的真实结果会被丢弃（反之亦然）。
//!
//! `watch` 是带截止时间与取消令牌的轮询循环：超时仍未终态的任务被强制置为 Failed，
//! 关闭信号触发时退出且保持任务非终态，留给下次启动的 `resume_in_flight` 接管。
//! 支持降级的任务（会议问答）在轮询重试耗尽或超时时改写降级回答。

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ReconcileSection;
use crate::core::{OrchestratorError, Task, TaskStatus};
use crate::fallback::{question_of, FallbackSynthesizer};
use crate::notify::NotificationEmitter;
use crate::store::{StatusUpdate, TaskStore, Transition};
use crate::worker::{JobReport, WorkerClient};

/// 写入一次状态迁移；首次进入终态时发通知，过期写入只记 debug 日志
pub async fn apply_transition(
    store: &Arc<dyn TaskStore>,
    notifier: &NotificationEmitter,
    task_id: &str,
    update: StatusUpdate,
) -> Result<Transition, OrchestratorError> {
    let target = update.status;
    let transition = store
        .transition(task_id, update)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("task {task_id}")))?;

    match &transition {
        Transition::Applied(task) => {
            tracing::info!("Task {} -> {}", task_id, task.status);
            if transition.entered_terminal() {
                notifier.on_terminal(task).await;
            }
        }
        Transition::Unchanged(_) => {}
        Transition::Rejected(task) => {
            tracing::debug!(
                "{}",
                OrchestratorError::StaleWriteRejected {
                    task_id: task_id.to_string(),
                    from: task.status,
                    to: target,
                }
            );
        }
    }
    Ok(transition)
}

fn update_from_report(report: JobReport) -> StatusUpdate {
    match report.state.task_status() {
        TaskStatus::Completed => StatusUpdate::completed(report.result.unwrap_or(Value::Null)),
        TaskStatus::Failed => StatusUpdate::failed(
            report
                .error
                .unwrap_or_else(|| "worker reported an error".to_string()),
        ),
        _ => StatusUpdate::processing(),
    }
}

/// 状态对账器
pub struct StatusReconciler {
    store: Arc<dyn TaskStore>,
    worker: WorkerClient,
    notifier: NotificationEmitter,
    fallback: Arc<FallbackSynthesizer>,
    config: ReconcileSection,
    shutdown: CancellationToken,
}

impl StatusReconciler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        worker: WorkerClient,
        notifier: NotificationEmitter,
        fallback: Arc<FallbackSynthesizer>,
        config: ReconcileSection,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            worker,
            notifier,
            fallback,
            config,
            shutdown,
        }
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms.max(1))
    }

    fn stuck_timeout(&self) -> Duration {
        Duration::from_secs(self.config.stuck_timeout_secs)
    }

    /// 查询一次 Worker 并写回；本地或 Worker 端都不认识该任务时返回 NotFound
    ///
    /// 已终态的任务直接返回存储中的状态，不再访问 Worker。
    pub async fn reconcile(&self, task_id: &str) -> Result<TaskStatus, OrchestratorError> {
        let task = self
            .store
            .get(task_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("task {task_id}")))?;
        if task.is_finished() {
            return Ok(task.status);
        }

        let report = self.worker.job_status(task_id, &self.shutdown).await?;
        let transition =
            apply_transition(&self.store, &self.notifier, task_id, update_from_report(report)).await?;
        Ok(transition.task().status)
    }

    /// 轮询直到终态、截止时间或取消
    ///
    /// - Worker 返回 404：置为 Failed（"job unknown to worker"）
    /// - 重试耗尽：会议问答写入降级回答，其余类型继续轮询
    /// - 其他瞬时错误：继续轮询
    /// - 截止时间到：强制置为 Failed（会议问答同样改写降级回答）
    pub async fn watch(
        &self,
        task_id: &str,
        cancel: &CancellationToken,
    ) -> Result<TaskStatus, OrchestratorError> {
        let deadline = Instant::now() + self.stuck_timeout();

        loop {
            let task = self
                .store
                .get(task_id)
                .await?
                .ok_or_else(|| OrchestratorError::NotFound(format!("task {task_id}")))?;
            if task.is_finished() {
                return Ok(task.status);
            }

            match self.worker.job_status(task_id, cancel).await {
                Ok(report) => {
                    let t = apply_transition(
                        &self.store,
                        &self.notifier,
                        task_id,
                        update_from_report(report),
                    )
                    .await?;
                    if t.task().status.is_terminal() {
                        return Ok(t.task().status);
                    }
                }
                Err(OrchestratorError::NotFound(_)) => {
                    tracing::warn!("Worker has no record of {}, marking failed", task_id);
                    let t = apply_transition(
                        &self.store,
                        &self.notifier,
                        task_id,
                        StatusUpdate::failed("job unknown to worker"),
                    )
                    .await?;
                    return Ok(t.task().status);
                }
                Err(OrchestratorError::Cancelled) => return Err(OrchestratorError::Cancelled),
                Err(e @ OrchestratorError::WorkerUnavailable { .. })
                    if task.kind.supports_fallback() =>
                {
                    return self.degrade(&task, &e.to_string()).await;
                }
                Err(e) => tracing::warn!("Polling {} failed, will retry: {}", task_id, e),
            }

            let now = Instant::now();
            if now >= deadline {
                return self.force_fail(&task).await;
            }
            let wait = self.poll_interval().min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Stopped watching {} (shutdown)", task_id);
                    return Err(OrchestratorError::Cancelled);
                }
                _ = tokio::time::sleep(wait) => {}
            }
            if Instant::now() >= deadline {
                return self.force_fail(&task).await;
            }
        }
    }

    async fn force_fail(&self, task: &Task) -> Result<TaskStatus, OrchestratorError> {
        let secs = self.config.stuck_timeout_secs;
        let reason = format!("no terminal status from worker within {secs}s");
        tracing::warn!("Task {} still not terminal after {}s, forcing failure", task.id, secs);
        if task.kind.supports_fallback() {
            return self.degrade(task, &reason).await;
        }
        let t = apply_transition(&self.store, &self.notifier, &task.id, StatusUpdate::failed(reason))
            .await?;
        Ok(t.task().status)
    }

    /// 写入降级回答；任务已被其他写者置为终态时返回其当前状态
    async fn degrade(&self, task: &Task, reason: &str) -> Result<TaskStatus, OrchestratorError> {
        self.fallback
            .apply(&self.store, &self.notifier, &task.id, question_of(task), reason)
            .await?;
        let current = self
            .store
            .get(&task.id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("task {}", task.id)))?;
        Ok(current.status)
    }

    /// 在后台轮询某任务，随关闭信号停止
    pub fn spawn_watch(self: &Arc<Self>, task_id: String) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let cancel = self.shutdown.child_token();
        tokio::spawn(async move {
            match this.watch(&task_id, &cancel).await {
                Ok(status) => tracing::debug!("Watch of {} ended with {}", task_id, status),
                Err(OrchestratorError::Cancelled) => {}
                Err(e) => tracing::warn!("Watch of {} ended with error: {}", task_id, e),
            }
        })
    }

    /// 重启后为所有非终态任务重新挂上轮询
    ///
    /// 从未送达 Worker 的 Pending 任务会收到 404 而被置为 Failed，调用方可重新提交。
    pub async fn resume_in_flight(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>, OrchestratorError> {
        let tasks = self.store.list_in_flight().await?;
        if !tasks.is_empty() {
            tracing::info!("Resuming reconciliation for {} in-flight task(s)", tasks.len());
        }
        Ok(tasks
            .into_iter()
            .map(|t| self.spawn_watch(t.id))
            .collect())
    }
}
