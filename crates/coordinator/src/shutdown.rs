use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, RwLock};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use gridsched_core::config::ShutdownConfig;
use gridsched_core::traits::SchedulerStateRepository;
use gridsched_core::SchedulerResult;

use crate::registry::WorkerConnectionRegistry;

/// 关闭信号管理器,广播信号给所有后台循环
pub struct ShutdownManager {
    shutdown_tx: Arc<RwLock<Option<broadcast::Sender<()>>>>,
    is_shutdown: Arc<RwLock<bool>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_tx: Arc::new(RwLock::new(Some(shutdown_tx))),
            is_shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// 订阅关闭信号
    pub async fn subscribe(&self) -> broadcast::Receiver<()> {
        let shutdown_tx = self.shutdown_tx.read().await;
        if let Some(ref tx) = *shutdown_tx {
            tx.subscribe()
        } else {
            // 已经关闭,返回立即触发的接收器
            let (tx, rx) = broadcast::channel(1);
            let _ = tx.send(());
            rx
        }
    }

    /// 触发关闭,重复调用是无操作
    pub async fn shutdown(&self) {
        let mut is_shutdown = self.is_shutdown.write().await;
        if *is_shutdown {
            debug!("关闭信号已经触发过");
            return;
        }
        *is_shutdown = true;

        let shutdown_tx = self.shutdown_tx.read().await;
        if let Some(ref tx) = *shutdown_tx {
            debug!("发送关闭信号给 {} 个订阅者", tx.receiver_count());
            let _ = tx.send(());
        }
        drop(shutdown_tx);

        let mut shutdown_tx = self.shutdown_tx.write().await;
        *shutdown_tx = None;
        info!("关闭信号已发送");
    }

    pub async fn is_shutdown(&self) -> bool {
        *self.is_shutdown.read().await
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for ShutdownManager {
    fn clone(&self) -> Self {
        Self {
            shutdown_tx: Arc::clone(&self.shutdown_tx),
            is_shutdown: Arc::clone(&self.is_shutdown),
        }
    }
}

/// 能停止接收新工作的组件
pub trait WorkIntake: Send + Sync {
    fn stop_accepting(&self);
}

/// 可排水的后台组件
///
/// flush落盘进度标记,drain等待在途工作结束。
/// 两者都必须可重入,超时后流程会继续。
#[async_trait]
pub trait DrainTask: Send + Sync {
    fn name(&self) -> &str;

    /// 把当前进度写进持久化存储
    async fn flush(&self) -> SchedulerResult<()> {
        Ok(())
    }

    /// 等待在途工作结束
    async fn drain(&self) -> SchedulerResult<()>;
}

struct DrainTarget {
    task: Arc<dyn DrainTask>,
    budget: Duration,
}

/// 优雅关闭协调器
///
/// 固定顺序的分阶段关闭,整体受master超时约束。
/// 任何阶段失败或超时都记录后继续,绝不中断:
/// 干净关闭标记必须尽一切可能写下去。
pub struct ShutdownCoordinator {
    state_repo: Arc<dyn SchedulerStateRepository>,
    shutdown_manager: ShutdownManager,
    intakes: Vec<Arc<dyn WorkIntake>>,
    drains: Vec<DrainTarget>,
    registry: Option<Arc<WorkerConnectionRegistry>>,
    instance_id: String,
    config: ShutdownConfig,
}

impl ShutdownCoordinator {
    pub fn new(
        state_repo: Arc<dyn SchedulerStateRepository>,
        shutdown_manager: ShutdownManager,
        instance_id: String,
        config: ShutdownConfig,
    ) -> Self {
        Self {
            state_repo,
            shutdown_manager,
            intakes: Vec::new(),
            drains: Vec::new(),
            registry: None,
            instance_id,
            config,
        }
    }

    /// 登记需要停止进水的组件
    pub fn register_intake(mut self, intake: Arc<dyn WorkIntake>) -> Self {
        self.intakes.push(intake);
        self
    }

    /// 登记排水目标及其时间预算
    pub fn register_drain(mut self, task: Arc<dyn DrainTask>, budget: Duration) -> Self {
        self.drains.push(DrainTarget { task, budget });
        self
    }

    /// 登记连接注册表,最终清理阶段清空
    pub fn with_registry(mut self, registry: Arc<WorkerConnectionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// 执行优雅关闭
    ///
    /// 阶段1-3受master超时约束;无论前面发生什么,
    /// 阶段4(写干净关闭标记)和阶段5(清理)都会执行。
    pub async fn run(&self) -> SchedulerResult<()> {
        info!(
            master_timeout_seconds = self.config.master_timeout_seconds,
            "开始优雅关闭"
        );

        let master = Duration::from_secs(self.config.master_timeout_seconds);
        if timeout(master, self.run_drain_phases()).await.is_err() {
            warn!("优雅关闭超过master超时,跳过剩余排水直接收尾");
        }

        self.mark_clean_stop().await;
        self.final_cleanup().await;

        info!("优雅关闭完成");
        Ok(())
    }

    /// 强制关闭:跳过排水,直接写关闭标记并清理
    pub async fn force_shutdown(&self) {
        warn!("执行强制关闭,跳过排水阶段");
        for intake in &self.intakes {
            intake.stop_accepting();
        }
        self.shutdown_manager.shutdown().await;
        self.mark_clean_stop().await;
        self.final_cleanup().await;
    }

    async fn run_drain_phases(&self) {
        // 阶段1: 停止进水
        for intake in &self.intakes {
            intake.stop_accepting();
        }
        self.shutdown_manager.shutdown().await;
        info!("阶段1完成: 新工作进水已停止");

        // 阶段2: 落盘进度标记
        if let Err(e) = self
            .state_repo
            .mark_shutting_down(&self.instance_id, Utc::now())
            .await
        {
            error!(error = %e, "写入SHUTTING_DOWN状态失败");
        }
        for target in &self.drains {
            if let Err(e) = target.task.flush().await {
                warn!(drain = target.task.name(), error = %e, "进度落盘失败");
            }
        }
        info!("阶段2完成: 进度标记已落盘");

        // 阶段3: 按预算逐个排水
        for target in &self.drains {
            match timeout(target.budget, target.task.drain()).await {
                Ok(Ok(())) => {
                    debug!(drain = target.task.name(), "排水完成");
                }
                Ok(Err(e)) => {
                    warn!(drain = target.task.name(), error = %e, "排水失败,继续");
                }
                Err(_) => {
                    warn!(
                        drain = target.task.name(),
                        budget_seconds = target.budget.as_secs(),
                        "排水超时,继续"
                    );
                }
            }
        }
        info!("阶段3完成: 排水阶段结束");
    }

    /// 阶段4: 写干净关闭标记,下一次启动据此跳过恢复
    async fn mark_clean_stop(&self) {
        match self
            .state_repo
            .mark_stopped(&self.instance_id, true, Utc::now())
            .await
        {
            Ok(()) => info!("阶段4完成: 干净关闭标记已写入"),
            Err(e) => error!(error = %e, "写入干净关闭标记失败,下次启动将执行恢复"),
        }
    }

    /// 阶段5: 尽力而为的资源清理
    async fn final_cleanup(&self) {
        if let Some(registry) = &self.registry {
            let cleared = registry.clear().await;
            if cleared > 0 {
                info!(count = cleared, "阶段5: 剩余Worker连接已清空");
            }
        }
    }
}
