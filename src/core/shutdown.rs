//! 优雅关闭
//!
//! 所有后台分发与轮询都挂在同一个根 CancellationToken 下。关闭时取消根令牌：
//! 进行中的 Worker 调用与退避等待立即返回 Cancelled，任务保持非终态，
//! 下次启动由 `resume_in_flight` 接管。

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
    /// 调用方主动关闭
    Requested,
}

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason_tx: broadcast::Sender<ShutdownReason>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(1);
        Self {
            token: CancellationToken::new(),
            reason_tx,
        }
    }

    /// 根令牌；组件各自派生 child_token
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        if self.token.is_cancelled() {
            return;
        }
        tracing::info!("Shutting down orchestrator ({:?})", reason);
        let _ = self.reason_tx.send(reason);
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    pub async fn wait(&self) {
        self.token.cancelled().await;
    }

    /// 安装 Ctrl+C / SIGTERM 处理器
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                manager.shutdown(ShutdownReason::Interrupt);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    manager.shutdown(ShutdownReason::Terminate);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 等待后台任务退出，超时则放弃；返回按时退出的数量
pub async fn drain(handles: Vec<JoinHandle<()>>, timeout: Duration) -> usize {
    let total = handles.len();
    match tokio::time::timeout(timeout, join_all(handles)).await {
        Ok(results) => results.iter().filter(|r| r.is_ok()).count(),
        Err(_) => {
            tracing::warn!("Timed out waiting for {} background task(s) to stop", total);
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_cancels_children_once() {
        let manager = ShutdownManager::new();
        let child = manager.token().child_token();
        let mut rx = manager.subscribe();

        manager.shutdown(ShutdownReason::Requested);
        manager.shutdown(ShutdownReason::Interrupt);

        assert!(manager.is_shutdown());
        assert!(child.is_cancelled());
        assert_eq!(rx.recv().await.unwrap(), ShutdownReason::Requested);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_times_out() {
        let quick = tokio::spawn(async {});
        let stuck = tokio::spawn(std::future::pending::<()>());
        assert_eq!(drain(vec![quick], Duration::from_secs(1)).await, 1);
        assert_eq!(drain(vec![stuck], Duration::from_secs(1)).await, 0);
    }
}
