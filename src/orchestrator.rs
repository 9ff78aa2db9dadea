//! 编排器装配
//!
//! `HiveBuilder` 把配置、存储、传输、通知投递端组装成一个 `Hive`：
//! 对外暴露提交、查询、对账、下载令牌校验与关闭。所有组件共享同一个 TaskStore 与关闭令牌。

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::core::{OrchestratorError, ShutdownManager, ShutdownReason, Task, TaskKind, TaskStatus};
use crate::dispatcher::{SubmitOutcome, TaskDispatcher};
use crate::fallback::FallbackSynthesizer;
use crate::notify::{MemoryNotificationSink, NotificationEmitter, NotificationSink};
use crate::reconciler::StatusReconciler;
use crate::store::{create_task_store, TaskStore};
use crate::token::{DownloadClaim, DownloadTokenSigner, TokenError};
use crate::transport::{HttpTransport, RetryPolicy, RetryableTransport, Transport};
use crate::worker::WorkerClient;

/// 编排器构建器
pub struct HiveBuilder {
    config: AppConfig,
    store: Option<Arc<dyn TaskStore>>,
    transport: Option<Arc<dyn Transport>>,
    sink: Option<Arc<dyn NotificationSink>>,
}

impl HiveBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            store: None,
            transport: None,
            sink: None,
        }
    }

    /// 指定存储；未指定时按 `[store]` 配置创建
    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// 指定底层传输；未指定时使用 reqwest
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// 指定通知投递端；未指定时使用内存通知箱
    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// 未指定传输时创建 reqwest 客户端，失败返回 Config 错误
    pub async fn build(self) -> Result<Hive, OrchestratorError> {
        let config = self.config;
        let store = match self.store {
            Some(s) => s,
            None => create_task_store(config.store.db_path.as_deref()).await,
        };
        let transport: Arc<dyn Transport> = match self.transport {
            Some(t) => t,
            None => Arc::new(HttpTransport::new()?),
        };
        let inbox = Arc::new(MemoryNotificationSink::new());
        let sink: Arc<dyn NotificationSink> = match self.sink {
            Some(s) => s,
            None => inbox.clone(),
        };

        let shutdown = Arc::new(ShutdownManager::new());
        let retrying = RetryableTransport::new(transport, RetryPolicy::from_config(&config.retry));
        let worker = WorkerClient::new(retrying, config.worker.clone());
        let notifier = NotificationEmitter::new(sink, config.notifications.clone());
        let signer = Arc::new(DownloadTokenSigner::from_config(&config.tokens));
        let fallback = Arc::new(FallbackSynthesizer::new(config.fallback.clone()));
        let reconciler = Arc::new(StatusReconciler::new(
            store.clone(),
            worker.clone(),
            notifier.clone(),
            fallback.clone(),
            config.reconcile.clone(),
            shutdown.token(),
        ));
        let dispatcher = TaskDispatcher::new(
            store.clone(),
            worker,
            reconciler.clone(),
            fallback,
            notifier,
            signer.clone(),
            shutdown.token(),
        );

        tracing::info!(
            "Orchestrator ready (worker {}, {} attempts, {}ms initial backoff)",
            config.worker.base_url,
            config.retry.max_attempts,
            config.retry.initial_backoff_ms
        );

        Ok(Hive {
            config,
            store,
            dispatcher,
            reconciler,
            signer,
            inbox,
            shutdown,
        })
    }
}

/// 组装完成的编排器
#[derive(Clone)]
pub struct Hive {
    config: AppConfig,
    store: Arc<dyn TaskStore>,
    dispatcher: TaskDispatcher,
    reconciler: Arc<StatusReconciler>,
    signer: Arc<DownloadTokenSigner>,
    inbox: Arc<MemoryNotificationSink>,
    shutdown: Arc<ShutdownManager>,
}

impl Hive {
    pub fn builder(config: AppConfig) -> HiveBuilder {
        HiveBuilder::new(config)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// 默认内存通知箱（使用自定义投递端时为空）
    pub fn inbox(&self) -> &Arc<MemoryNotificationSink> {
        &self.inbox
    }

    pub fn shutdown_manager(&self) -> &Arc<ShutdownManager> {
        &self.shutdown
    }

    pub async fn submit(
        &self,
        kind: TaskKind,
        owner_id: &str,
        owner_entity_id: &str,
        payload: Value,
    ) -> Result<SubmitOutcome, OrchestratorError> {
        self.dispatcher
            .submit(kind, owner_id, owner_entity_id, payload)
            .await
    }

    /// 提交并返回后台句柄（测试与 CLI 用于等待分发结束）
    pub async fn submit_tracked(
        &self,
        kind: TaskKind,
        owner_id: &str,
        owner_entity_id: &str,
        payload: Value,
    ) -> Result<(SubmitOutcome, Option<JoinHandle<()>>), OrchestratorError> {
        self.dispatcher
            .submit_inner(kind, owner_id, owner_entity_id, payload)
            .await
    }

    pub async fn get(&self, task_id: &str) -> Result<Task, OrchestratorError> {
        self.dispatcher.get(task_id).await
    }

    pub async fn list_for_owner(&self, owner_id: &str) -> Result<Vec<Task>, OrchestratorError> {
        self.dispatcher.list_for_owner(owner_id).await
    }

    pub async fn reconcile(&self, task_id: &str) -> Result<TaskStatus, OrchestratorError> {
        self.reconciler.reconcile(task_id).await
    }

    /// 为存储中的非终态任务重新挂上轮询
    pub async fn resume_in_flight(&self) -> Result<Vec<JoinHandle<()>>, OrchestratorError> {
        self.reconciler.resume_in_flight().await
    }

    /// 轮询存储直到任务终态（不访问 Worker）
    pub async fn wait_for_terminal(
        &self,
        task_id: &str,
        poll: Duration,
        timeout: Duration,
    ) -> Result<Task, OrchestratorError> {
        let wait = async {
            loop {
                let task = self.get(task_id).await?;
                if task.is_finished() {
                    return Ok(task);
                }
                tokio::select! {
                    _ = self.shutdown.wait() => return Err(OrchestratorError::Cancelled),
                    _ = tokio::time::sleep(poll) => {}
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .unwrap_or(Err(OrchestratorError::Timeout))
    }

    pub fn issue_download_token(&self, attachment_id: &str, user_id: &str) -> String {
        self.signer.issue(attachment_id, user_id)
    }

    pub fn verify_download_token(&self, token: &str) -> Result<DownloadClaim, TokenError> {
        self.signer.verify(token)
    }

    pub fn shutdown(&self) {
        self.shutdown.shutdown(ShutdownReason::Requested);
    }
}
