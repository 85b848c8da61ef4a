//! 应用装配:建池、迁移、组装各组件并启动后台循环

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tracing::{info, warn};

use gridsched_coordinator::shutdown::DrainTask;
use gridsched_coordinator::{
    HealthMonitor, RecoveryManager, ShutdownCoordinator, ShutdownManager, WorkerConnectionRegistry,
    WorkerCoordinator,
};
use gridsched_core::models::{ServerMessage, WorkerMessage};
use gridsched_core::traits::{
    DataMover, EventPublisher, EventQueueRepository, EventReplay, SchedulerStateRepository,
    StagingOperationRepository, StateManager, TaskRepository, TaskScheduler, WorkerRepository,
};
use gridsched_core::{AppConfig, SchedulerError, SchedulerResult};
use gridsched_infrastructure::{
    create_pool, PersistentEventQueue, PostgresEventQueueRepository,
    PostgresSchedulerStateRepository, PostgresStagingRepository, PostgresTaskRepository,
    PostgresWorkerRepository,
};

use crate::collaborators::{FifoTaskScheduler, PassiveDataMover, SqlStateManager};

/// 调度器应用
pub struct Application {
    config: AppConfig,
    coordinator: Arc<WorkerCoordinator>,
    health_monitor: Arc<HealthMonitor>,
    recovery_manager: Arc<RecoveryManager>,
    event_queue: Arc<PersistentEventQueue>,
    shutdown_manager: ShutdownManager,
    shutdown_coordinator: ShutdownCoordinator,
}

impl Application {
    pub async fn new(config: AppConfig) -> SchedulerResult<Self> {
        let pool = create_pool(&config.database).await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| SchedulerError::DatabaseOperation(format!("数据库迁移失败: {e}")))?;
        info!("数据库连接池就绪,迁移已应用");

        let worker_repo: Arc<dyn WorkerRepository> =
            Arc::new(PostgresWorkerRepository::new(pool.clone()));
        let task_repo: Arc<dyn TaskRepository> =
            Arc::new(PostgresTaskRepository::new(pool.clone()));
        let staging_repo: Arc<dyn StagingOperationRepository> =
            Arc::new(PostgresStagingRepository::new(pool.clone()));
        let state_repo: Arc<dyn SchedulerStateRepository> =
            Arc::new(PostgresSchedulerStateRepository::new(pool.clone()));
        let event_repo: Arc<dyn EventQueueRepository> =
            Arc::new(PostgresEventQueueRepository::new(pool.clone()));

        let event_queue = Arc::new(PersistentEventQueue::new(
            event_repo,
            config.event_queue.clone(),
        ));

        let scheduler: Arc<dyn TaskScheduler> = Arc::new(FifoTaskScheduler::new(
            pool.clone(),
            task_repo.clone(),
            config.coordinator.default_task_timeout_seconds as i64,
        ));
        let state_manager: Arc<dyn StateManager> = Arc::new(SqlStateManager::new(pool.clone()));
        let data_mover: Arc<dyn DataMover> = Arc::new(PassiveDataMover::new());

        let registry = Arc::new(WorkerConnectionRegistry::new());
        let coordinator = Arc::new(WorkerCoordinator::new(
            registry.clone(),
            worker_repo.clone(),
            task_repo.clone(),
            staging_repo.clone(),
            scheduler.clone(),
            state_manager,
            data_mover,
            event_queue.clone() as Arc<dyn EventPublisher>,
            config.coordinator.clone(),
        ));

        let health_monitor = Arc::new(HealthMonitor::new(
            registry.clone(),
            worker_repo.clone(),
            scheduler,
            event_queue.clone() as Arc<dyn EventPublisher>,
            config.health.clone(),
        ));

        let instance_id = RecoveryManager::generate_instance_id();
        let recovery_manager = Arc::new(RecoveryManager::new(
            state_repo.clone(),
            task_repo,
            worker_repo,
            staging_repo,
            event_queue.clone() as Arc<dyn EventReplay>,
            instance_id.clone(),
            config.recovery.clone(),
        ));

        let shutdown_manager = ShutdownManager::new();
        let shutdown_coordinator = ShutdownCoordinator::new(
            state_repo,
            shutdown_manager.clone(),
            instance_id,
            config.shutdown.clone(),
        )
        .register_intake(coordinator.clone())
        .register_drain(
            event_queue.clone(),
            Duration::from_secs(config.shutdown.background_jobs_timeout_seconds),
        )
        .register_drain(
            coordinator.clone(),
            Duration::from_secs(config.shutdown.staging_timeout_seconds),
        )
        .register_drain(
            Arc::new(DatabasePoolDrain::new(pool)),
            Duration::from_secs(config.shutdown.transactions_timeout_seconds),
        )
        .with_registry(registry);

        Ok(Self {
            config,
            coordinator,
            health_monitor,
            recovery_manager,
            event_queue,
            shutdown_manager,
            shutdown_coordinator,
        })
    }

    /// 启动顺序:事件队列先就绪,再跑启动恢复(恢复会重放事件),
    /// 最后拉起健康监控与存活心跳循环。
    pub async fn run(&self) -> SchedulerResult<()> {
        self.event_queue.start(&self.shutdown_manager).await?;

        let report = self.recovery_manager.start_recovery().await?;
        if !report.errors.is_empty() {
            warn!(errors = report.errors.len(), "启动恢复存在非致命错误");
        }

        // 上次干净停机不走恢复重放,库里若仍有PENDING事件在这里补投
        if !report.unclean_shutdown {
            match self.event_queue.resume_pending().await {
                Ok(count) if count > 0 => info!(count, "启动补投遗留PENDING事件"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "启动补投PENDING事件失败"),
            }
        }

        tokio::spawn(
            self.health_monitor
                .clone()
                .run(self.shutdown_manager.subscribe().await),
        );
        tokio::spawn(
            self.recovery_manager
                .clone()
                .run_state_heartbeat(self.shutdown_manager.subscribe().await),
        );

        info!(
            instance_id = %self.recovery_manager.instance_id(),
            "调度器已就绪,等待Worker连接"
        );
        Ok(())
    }

    /// 为传输适配层开一条Worker双工通道
    ///
    /// 返回入站发送端与出站接收端,连接的读循环由协调器托管,
    /// 入站端被丢弃即视为断连。
    pub fn open_worker_channel(
        &self,
    ) -> (mpsc::Sender<WorkerMessage>, mpsc::Receiver<ServerMessage>) {
        let buffer = self.config.coordinator.channel_buffer_size;
        let (inbound_tx, inbound_rx) = mpsc::channel(buffer);
        let (outbound_tx, outbound_rx) = mpsc::channel(buffer);
        tokio::spawn(self.coordinator.clone().serve_connection(inbound_rx, outbound_tx));
        (inbound_tx, outbound_rx)
    }

    pub fn coordinator(&self) -> Arc<WorkerCoordinator> {
        self.coordinator.clone()
    }

    pub fn shutdown_manager(&self) -> ShutdownManager {
        self.shutdown_manager.clone()
    }

    /// 优雅关闭入口,内部分阶段执行并受master超时约束
    pub async fn shutdown(&self) -> SchedulerResult<()> {
        self.shutdown_coordinator.run().await
    }
}

/// 等待连接池中在途查询归还,关闭阶段的事务排水目标
struct DatabasePoolDrain {
    pool: PgPool,
}

impl DatabasePoolDrain {
    fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DrainTask for DatabasePoolDrain {
    fn name(&self) -> &str {
        "database-pool"
    }

    async fn drain(&self) -> SchedulerResult<()> {
        while (self.pool.size() as usize) > self.pool.num_idle() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(())
    }
}
