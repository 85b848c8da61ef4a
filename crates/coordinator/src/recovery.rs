use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use gridsched_core::config::RecoveryConfig;
use gridsched_core::traits::{
    EventReplay, SchedulerStateRepository, StagingOperationRepository, TaskRepository,
    WorkerRepository,
};
use gridsched_core::SchedulerResult;

/// 一次启动恢复的结果汇总
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// 是否检测到上一实例未干净关闭
    pub unclean_shutdown: bool,
    pub resumed_staging_operations: usize,
    pub requeued_tasks: u64,
    pub disconnected_workers: u64,
    pub released_leases: u64,
    pub replayed_events: usize,
    /// 非致命错误,恢复继续
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

/// 启动恢复管理器
///
/// 以scheduler_state单行为判定依据:上一实例崩溃(clean_shutdown=false
/// 且状态停留在运行期)时执行五个相互独立的恢复动作。每个动作幂等,
/// 失败只记录不中断,恢复后系统允许损失进度但不允许状态不一致。
pub struct RecoveryManager {
    state_repo: Arc<dyn SchedulerStateRepository>,
    task_repo: Arc<dyn TaskRepository>,
    worker_repo: Arc<dyn WorkerRepository>,
    staging_repo: Arc<dyn StagingOperationRepository>,
    event_replay: Arc<dyn EventReplay>,
    instance_id: String,
    config: RecoveryConfig,
}

impl RecoveryManager {
    pub fn new(
        state_repo: Arc<dyn SchedulerStateRepository>,
        task_repo: Arc<dyn TaskRepository>,
        worker_repo: Arc<dyn WorkerRepository>,
        staging_repo: Arc<dyn StagingOperationRepository>,
        event_replay: Arc<dyn EventReplay>,
        instance_id: String,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            state_repo,
            task_repo,
            worker_repo,
            staging_repo,
            event_replay,
            instance_id,
            config,
        }
    }

    /// 生成本次启动的实例标识:主机名+随机后缀
    pub fn generate_instance_id() -> String {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        format!("{host}-{}", uuid::Uuid::new_v4())
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// 启动恢复入口
    ///
    /// 先读取上一实例的状态做崩溃判定,再以本实例身份写入STARTING,
    /// 需要时执行恢复动作,最后置为RUNNING。
    pub async fn start_recovery(&self) -> SchedulerResult<RecoveryReport> {
        let started = Instant::now();
        let mut report = RecoveryReport::default();

        let previous = self.state_repo.get().await?;
        report.unclean_shutdown = previous
            .as_ref()
            .map(|s| s.requires_recovery())
            .unwrap_or(false);

        match &previous {
            Some(state) if report.unclean_shutdown => {
                warn!(
                    previous_instance = %state.instance_id,
                    previous_status = %state.status,
                    "检测到上一实例未干净关闭,执行崩溃恢复"
                );
            }
            Some(state) => {
                info!(previous_instance = %state.instance_id, "上一实例干净关闭,无需恢复");
            }
            None => {
                info!("首次启动,无历史状态");
            }
        }

        self.state_repo
            .upsert_starting(&self.instance_id, Utc::now())
            .await?;

        if report.unclean_shutdown {
            self.run_recovery_actions(&mut report).await;
        }

        self.state_repo
            .mark_running(&self.instance_id, Utc::now())
            .await?;

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            unclean = report.unclean_shutdown,
            requeued_tasks = report.requeued_tasks,
            disconnected_workers = report.disconnected_workers,
            resumed_staging = report.resumed_staging_operations,
            released_leases = report.released_leases,
            replayed_events = report.replayed_events,
            errors = report.errors.len(),
            duration_ms = report.duration_ms,
            "启动恢复完成"
        );
        Ok(report)
    }

    /// 五个恢复动作,彼此独立,任何一个失败都不阻止其余执行
    async fn run_recovery_actions(&self, report: &mut RecoveryReport) {
        match self.resume_staging_operations().await {
            Ok(count) => report.resumed_staging_operations = count,
            Err(e) => {
                error!(error = %e, "恢复暂存操作失败");
                report.errors.push(format!("resume staging: {e}"));
            }
        }

        match self.task_repo.requeue_assigned_tasks().await {
            Ok(count) => {
                if count > 0 {
                    info!(count, "已分配未运行的任务退回队列");
                }
                report.requeued_tasks = count;
            }
            Err(e) => {
                error!(error = %e, "任务重新入队失败");
                report.errors.push(format!("requeue tasks: {e}"));
            }
        }

        match self.worker_repo.mark_all_disconnected().await {
            Ok(count) => {
                if count > 0 {
                    info!(count, "Worker连接状态已全部重置为断开");
                }
                report.disconnected_workers = count;
            }
            Err(e) => {
                error!(error = %e, "重置Worker连接状态失败");
                report.errors.push(format!("disconnect workers: {e}"));
            }
        }

        match self.task_repo.release_expired_leases(Utc::now()).await {
            Ok(count) => {
                if count > 0 {
                    info!(count, "过期任务租约已释放");
                }
                report.released_leases = count;
            }
            Err(e) => {
                error!(error = %e, "释放过期租约失败");
                report.errors.push(format!("release leases: {e}"));
            }
        }

        match self.event_replay.resume_pending().await {
            Ok(count) => {
                if count > 0 {
                    info!(count, "未投递事件已重新入队");
                }
                report.replayed_events = count;
            }
            Err(e) => {
                error!(error = %e, "事件重放失败");
                report.errors.push(format!("replay events: {e}"));
            }
        }
    }

    /// 未完成的暂存操作重新置为RUNNING,保留completed_files断点续传
    async fn resume_staging_operations(&self) -> SchedulerResult<usize> {
        let incomplete = self.staging_repo.list_incomplete().await?;
        let mut resumed = 0;

        for op in &incomplete {
            info!(
                staging_id = %op.id,
                task_id = %op.task_id,
                completed_files = op.completed_files,
                total_files = op.total_files,
                "恢复未完成的暂存操作"
            );
            match self.staging_repo.mark_running(&op.id).await {
                Ok(()) => resumed += 1,
                Err(e) => {
                    warn!(staging_id = %op.id, error = %e, "暂存操作恢复失败");
                }
            }
        }
        Ok(resumed)
    }

    /// scheduler_state存活心跳循环,收到关闭信号后退出
    pub async fn run_state_heartbeat(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(Duration::from_secs(
            self.config.state_heartbeat_interval_seconds,
        ));

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self
                        .state_repo
                        .touch_heartbeat(&self.instance_id, Utc::now())
                        .await
                    {
                        warn!(error = %e, "调度器存活心跳写入失败");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("存活心跳循环收到关闭信号,退出");
                    break;
                }
            }
        }
    }
}
