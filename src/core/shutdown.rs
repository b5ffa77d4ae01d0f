//! 优雅关闭
//!
//! 统一的关闭信号与清理逻辑：
//! - 取消 token 停止健康探测循环与记忆清扫循环
//! - 记忆库在退出前做最后一次淘汰并写快照
//! - 正在进行的步骤有机会跑完（取消只在步骤之间生效）

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::memory::MemoryStore;

/// 关闭信号管理器：取消 token + 第一次触发的原因
#[derive(Clone, Default)]
pub struct ShutdownManager {
    shutdown_token: CancellationToken,
    reason: Arc<Mutex<Option<ShutdownReason>>>,
}

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    /// 任务执行完毕，正常退出
    Finished,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取关闭 token（后台循环与工作流运行监听它）
    pub fn token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// 只记录第一次的原因，重复调用无副作用
    pub fn shutdown(&self, reason: ShutdownReason) {
        let mut slot = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            tracing::info!(reason = ?reason, "Shutdown requested");
            *slot = Some(reason);
        }
        self.shutdown_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
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
                    tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

/// 关闭时执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 清理任务名称（用于日志）
    fn name(&self) -> &'static str;
}

/// 单个清理任务的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupStatus {
    Completed,
    Failed,
    TimedOut,
}

/// 关闭协调器：按注册顺序执行清理，每个任务有独立超时
pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    cleanup_tasks: Vec<Arc<dyn ShutdownCleanup>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            cleanup_tasks: Vec::new(),
            timeout: Duration::from_secs(5),
        }
    }

    /// 零超时按 1ms 处理
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout.max(Duration::from_millis(1));
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.cleanup_tasks.push(Arc::new(task));
    }

    /// 先触发关闭（尚未触发时原因记为 Finished），再依次执行清理；
    /// 单个任务失败或超时不影响后续任务
    pub async fn run_cleanup(&self) -> Vec<(&'static str, CleanupStatus)> {
        self.manager.shutdown(ShutdownReason::Finished);
        tracing::info!(
            tasks = self.cleanup_tasks.len(),
            reason = ?self.manager.reason(),
            "Running shutdown cleanup"
        );

        let mut report = Vec::with_capacity(self.cleanup_tasks.len());
        for task in &self.cleanup_tasks {
            let name = task.name();
            let status = match tokio::time::timeout(self.timeout, task.cleanup()).await {
                Ok(Ok(())) => {
                    tracing::info!(task = name, "Cleanup completed");
                    CleanupStatus::Completed
                }
                Ok(Err(e)) => {
                    tracing::warn!(task = name, error = %e, "Cleanup failed");
                    CleanupStatus::Failed
                }
                Err(_) => {
                    tracing::warn!(
                        task = name,
                        timeout_ms = self.timeout.as_millis() as u64,
                        "Cleanup timed out"
                    );
                    CleanupStatus::TimedOut
                }
            };
            report.push((name, status));
        }
        report
    }
}

/// 记忆库清理：最后一次淘汰 + 写快照
pub struct MemoryStoreCleanup {
    store: Arc<MemoryStore>,
}

impl MemoryStoreCleanup {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for MemoryStoreCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.store.close().await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "MemoryStore"
    }
}

/// 后台循环清理：等待探测 / 清扫任务在 token 取消后退出
pub struct BackgroundTaskCleanup {
    name: &'static str,
    handle: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BackgroundTaskCleanup {
    pub fn new(name: &'static str, handle: tokio::task::JoinHandle<()>) -> Self {
        Self {
            name,
            handle: tokio::sync::Mutex::new(Some(handle)),
        }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for BackgroundTaskCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.await?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        self.name
    }
}
