//! 可重试传输：有界指数退避
//!
//! 瞬时错误（网络失败、超时、HTTP 503）按 1, 2, 4 ... 个时间单位退避后原样重发；
//! 其他非 2xx 状态立即返回 WorkerRejected。重试耗尽返回 WorkerUnavailable。
//! 调用方会被阻塞整个累计退避时长，不能阻塞的调用方应在后台任务中调用。

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{Transport, WorkerRequest, WorkerResponse};
use crate::config::RetrySection;
use crate::core::OrchestratorError;

/// 重试策略
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 总尝试次数（含首次）
    pub max_attempts: u32,
    /// 首次退避时长（一个时间单位）
    pub initial_backoff: Duration,
    /// 单次退避上限
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetrySection::default())
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &RetrySection) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            initial_backoff: Duration::from_millis(cfg.initial_backoff_ms),
            max_backoff: Duration::from_millis(cfg.max_backoff_ms.max(cfg.initial_backoff_ms)),
        }
    }

    /// 第 `attempt` 次（从 1 开始）失败后的等待时长
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// 成功送达的响应及所用尝试次数
#[derive(Debug, Clone)]
pub struct Delivered {
    pub response: WorkerResponse,
    pub attempts: u32,
}

/// 带退避重试的传输包装
#[derive(Clone)]
pub struct RetryableTransport {
    inner: Arc<dyn Transport>,
    policy: RetryPolicy,
}

impl RetryableTransport {
    pub fn new(inner: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn call(&self, request: &WorkerRequest) -> Result<Delivered, OrchestratorError> {
        self.call_with_cancel(request, &CancellationToken::new()).await
    }

    /// 发送请求；`cancel` 触发时立即返回 Cancelled（包括退避等待期间）
    pub async fn call_with_cancel(
        &self,
        request: &WorkerRequest,
        cancel: &CancellationToken,
    ) -> Result<Delivered, OrchestratorError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
                r = tokio::time::timeout(request.timeout, self.inner.send(request)) => {
                    r.unwrap_or(Err(OrchestratorError::Timeout))
                }
            };

            let err = match outcome {
                Ok(resp) if resp.status == 503 => OrchestratorError::ServiceBusy,
                Ok(resp) if resp.is_success() => {
                    if attempt > 1 {
                        tracing::info!("{} succeeded on attempt {}", request.url, attempt);
                    }
                    return Ok(Delivered {
                        response: resp,
                        attempts: attempt,
                    });
                }
                Ok(resp) => {
                    return Err(OrchestratorError::WorkerRejected {
                        status: resp.status,
                        body: resp.text(),
                    })
                }
                Err(e) if e.is_retryable() => e,
                Err(e) => return Err(e),
            };

            last_error = err.to_string();
            if attempt < max_attempts {
                let delay = self.policy.delay_for(attempt);
                tracing::warn!(
                    "{} attempt {}/{} failed ({}), retrying in {:?}",
                    request.url,
                    attempt,
                    max_attempts,
                    last_error,
                    delay
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        tracing::warn!("{} exhausted {} attempts: {}", request.url, max_attempts, last_error);
        Err(OrchestratorError::WorkerUnavailable {
            attempts: max_attempts,
            last_error,
        })
    }
}
