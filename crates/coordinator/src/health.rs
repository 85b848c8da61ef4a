use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use gridsched_core::config::HealthMonitorConfig;
use gridsched_core::models::{ConnectionState, EventQueueEntry, WorkerStatus};
use gridsched_core::traits::{EventPublisher, TaskScheduler, WorkerRepository};
use gridsched_core::SchedulerResult;

use crate::registry::WorkerConnectionRegistry;

/// Worker健康监控
///
/// 周期性扫描连接注册表,心跳超时的Worker按失联处理:
/// 在途任务判失(由调度策略决定重试),Worker回收,连接摘除。
pub struct HealthMonitor {
    registry: Arc<WorkerConnectionRegistry>,
    worker_repo: Arc<dyn WorkerRepository>,
    scheduler: Arc<dyn TaskScheduler>,
    events: Arc<dyn EventPublisher>,
    config: HealthMonitorConfig,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<WorkerConnectionRegistry>,
        worker_repo: Arc<dyn WorkerRepository>,
        scheduler: Arc<dyn TaskScheduler>,
        events: Arc<dyn EventPublisher>,
        config: HealthMonitorConfig,
    ) -> Self {
        Self {
            registry,
            worker_repo,
            scheduler,
            events,
            config,
        }
    }

    /// 监控主循环,收到关闭信号后退出
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.check_interval_seconds));
        info!(
            interval_seconds = self.config.check_interval_seconds,
            timeout_seconds = self.config.heartbeat_timeout_seconds,
            "健康监控已启动"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "健康检查扫描失败");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("健康监控收到关闭信号,退出");
                    break;
                }
            }
        }
    }

    /// 单轮扫描,返回本轮判定失联的Worker ID列表
    pub async fn sweep(&self) -> SchedulerResult<Vec<String>> {
        let now = Utc::now();
        let threshold = now - chrono::Duration::seconds(self.config.heartbeat_timeout_seconds);
        let connections = self.registry.snapshot().await;

        let mut timed_out = Vec::new();
        for connection in connections {
            let last_heartbeat = connection.last_heartbeat().await;
            if last_heartbeat >= threshold {
                continue;
            }

            warn!(
                worker_id = %connection.worker_id,
                last_heartbeat = %last_heartbeat,
                "Worker心跳超时,判定失联"
            );
            // 单个Worker处理失败不影响同一轮的其他Worker
            if let Err(e) = self.handle_worker_timeout(&connection.worker_id).await {
                error!(worker_id = %connection.worker_id, error = %e, "失联Worker处理失败");
                continue;
            }
            timed_out.push(connection.worker_id.clone());
        }

        if !timed_out.is_empty() {
            info!(count = timed_out.len(), "本轮健康检查摘除失联Worker");
        }
        Ok(timed_out)
    }

    /// 失联处理:在途任务判失,Worker回收,连接摘除
    async fn handle_worker_timeout(&self, worker_id: &str) -> SchedulerResult<()> {
        if let Some(worker) = self.worker_repo.get_by_id(worker_id).await? {
            if let Some(task_id) = &worker.current_task_id {
                debug!(worker_id = %worker_id, task_id = %task_id, "失联Worker持有任务,判失");
                self.scheduler
                    .fail_task(task_id, worker_id, "Worker connection timeout")
                    .await?;
            }

            self.worker_repo
                .update_status(worker_id, WorkerStatus::Idle)
                .await?;
            self.worker_repo.set_current_task(worker_id, None).await?;
            self.worker_repo
                .update_connection_state(worker_id, ConnectionState::Disconnected)
                .await?;
        }

        self.registry.remove(worker_id).await;

        let entry = EventQueueEntry::audit("health-monitor", "worker.timeout", "worker", worker_id);
        if let Err(e) = self.events.publish(entry).await {
            warn!(worker_id = %worker_id, error = %e, "失联审计事件发布失败");
        }
        Ok(())
    }
}
