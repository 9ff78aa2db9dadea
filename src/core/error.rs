//! 编排层错误类型
//!
//! 传播策略：校验错误与 Worker 终止性错误立即返回调用方；瞬时网络错误 / 503 由
//! RetryableTransport 吸收；重试耗尽后才以 WorkerUnavailable 暴露。
//! StaleWriteRejected 只记录日志，不返回给调用方。

use thiserror::Error;

use crate::core::TaskStatus;
use crate::store::StoreError;

/// 编排过程中可能出现的错误
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// 提交负载不合法，不创建任务
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// Worker 返回 503
    #[error("Service busy (503)")]
    ServiceBusy,

    /// 重试耗尽
    #[error("Worker unavailable after {attempts} attempts: {last_error}")]
    WorkerUnavailable { attempts: u32, last_error: String },

    /// Worker 返回非 503 的错误状态码，不重试
    #[error("Worker rejected request with HTTP {status}: {body}")]
    WorkerRejected { status: u16, body: String },

    #[error("Not found: {0}")]
    NotFound(String),

    /// 试图让终态任务回退，或重复写入终态
    #[error("Stale write rejected for {task_id}: {from} -> {to}")]
    StaleWriteRejected {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Worker call timed out")]
    Timeout,

    #[error("Cancelled")]
    Cancelled,

    /// Worker 返回了无法解析的响应
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Config error: {0}")]
    Config(String),
}

impl OrchestratorError {
    /// 是否属于可由 RetryableTransport 重试的瞬时错误
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::TransientNetwork(_)
                | OrchestratorError::ServiceBusy
                | OrchestratorError::Timeout
        )
    }
}

impl From<config::ConfigError> for OrchestratorError {
    fn from(e: config::ConfigError) -> Self {
        OrchestratorError::Config(e.to_string())
    }
}
