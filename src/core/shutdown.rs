//! 优雅关闭
//!
//! 关闭信号统一落到一个 CancellationToken 上：正在执行的研究会话在下一个阶段边界停下，
//! 已完成的阶段都已写入检查点，下次启动可用同一 thread_id 继续。

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason_tx: broadcast::Sender<ShutdownReason>,
}

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    FatalError(String),
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(4);
        Self {
            token: CancellationToken::new(),
            reason_tx,
        }
    }

    /// 交给 ResearchBuilder::with_cancel 的 token
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        if self.token.is_cancelled() {
            return;
        }
        tracing::info!(reason = ?reason, "shutdown requested");
        let _ = self.reason_tx.send(reason);
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// 安装 Ctrl+C 与 SIGTERM 处理
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl+C, stopping at the next stage boundary");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, stopping at the next stage boundary");
                    manager.shutdown(ShutdownReason::Signal);
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_cancels_token_and_broadcasts_reason() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        let child = token.child_token();
        let mut rx = manager.subscribe();

        assert!(!manager.is_shutdown());
        manager.shutdown(ShutdownReason::FatalError("disk full".into()));

        assert!(manager.is_shutdown());
        assert!(token.is_cancelled());
        assert!(child.is_cancelled());
        assert_eq!(rx.recv().await.unwrap(), ShutdownReason::FatalError("disk full".into()));
        manager.wait_for_shutdown().await;
    }

    #[tokio::test]
    async fn test_second_shutdown_is_ignored() {
        let manager = ShutdownManager::new();
        let mut rx = manager.subscribe();
        manager.shutdown(ShutdownReason::UserInitiated);
        manager.shutdown(ShutdownReason::Signal);

        assert_eq!(rx.recv().await.unwrap(), ShutdownReason::UserInitiated);
        assert!(rx.try_recv().is_err());
    }
}
