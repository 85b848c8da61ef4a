use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use gridsched_core::config::CoordinatorConfig;
use gridsched_core::models::{
    ConnectionState, EventQueueEntry, Heartbeat, OutputKind, OutputUploadRequest, ServerMessage,
    StagingProgress, StagingStatus, Task, TaskAssignment, TaskCancellation, TaskRequest,
    TaskStatusUpdate, Worker, WorkerMessage, WorkerMetricsReport, WorkerRegistration,
    WorkerRunConfig, WorkerShutdownDirective, WorkerStatus,
};
use gridsched_core::traits::{
    DataMover, EventPublisher, StagingOperationRepository, StateManager, TaskRepository,
    TaskScheduler, WorkerRepository,
};
use gridsched_core::{SchedulerError, SchedulerResult};

use crate::registry::{WorkerConnection, WorkerConnectionRegistry};
use crate::shutdown::{DrainTask, WorkIntake};

/// Worker协调器
///
/// 实现拉取式任务分配协议:注册校验、双工通道消息分发、
/// 任务状态上报的事务化处理。心跳只承载存活信号。
pub struct WorkerCoordinator {
    registry: Arc<WorkerConnectionRegistry>,
    worker_repo: Arc<dyn WorkerRepository>,
    task_repo: Arc<dyn TaskRepository>,
    staging_repo: Arc<dyn StagingOperationRepository>,
    scheduler: Arc<dyn TaskScheduler>,
    state_manager: Arc<dyn StateManager>,
    data_mover: Arc<dyn DataMover>,
    events: Arc<dyn EventPublisher>,
    config: CoordinatorConfig,
    /// 关闭流程第一阶段置位,之后不再分配任务
    draining: AtomicBool,
    /// 在途的输出归档收尾任务数,排水依据
    staging_in_flight: Arc<AtomicUsize>,
}

impl WorkerCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<WorkerConnectionRegistry>,
        worker_repo: Arc<dyn WorkerRepository>,
        task_repo: Arc<dyn TaskRepository>,
        staging_repo: Arc<dyn StagingOperationRepository>,
        scheduler: Arc<dyn TaskScheduler>,
        state_manager: Arc<dyn StateManager>,
        data_mover: Arc<dyn DataMover>,
        events: Arc<dyn EventPublisher>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            registry,
            worker_repo,
            task_repo,
            staging_repo,
            scheduler,
            state_manager,
            data_mover,
            events,
            config,
            draining: AtomicBool::new(false),
            staging_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn registry(&self) -> Arc<WorkerConnectionRegistry> {
        self.registry.clone()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Worker注册
    ///
    /// Worker行由实验提交流程预先创建,这里对worker_id/experiment_id/
    /// compute_resource_id三元组做精确校验,任何不一致都拒绝。
    pub async fn register_worker(
        &self,
        registration: &WorkerRegistration,
    ) -> SchedulerResult<WorkerRunConfig> {
        let worker = self
            .worker_repo
            .get_by_id(&registration.worker_id)
            .await?
            .ok_or_else(|| SchedulerError::WorkerNotFound {
                id: registration.worker_id.clone(),
            })?;

        if worker.experiment_id != registration.experiment_id {
            return Err(SchedulerError::RegistrationMismatch(format!(
                "worker {} 属于实验 {},注册请求声明 {}",
                worker.id, worker.experiment_id, registration.experiment_id
            )));
        }
        if worker.compute_resource_id != registration.compute_resource_id {
            return Err(SchedulerError::RegistrationMismatch(format!(
                "worker {} 属于计算资源 {},注册请求声明 {}",
                worker.id, worker.compute_resource_id, registration.compute_resource_id
            )));
        }

        self.worker_repo
            .mark_registered(&worker.id, Utc::now())
            .await?;

        self.publish_audit("worker.registered", "worker", &worker.id).await;
        info!(
            worker_id = %worker.id,
            experiment_id = %worker.experiment_id,
            "Worker注册成功"
        );

        Ok(self.build_run_config(&worker))
    }

    fn build_run_config(&self, worker: &Worker) -> WorkerRunConfig {
        // 任务超时取Worker的walltime,未知时退回配置默认值
        let task_timeout_seconds = if worker.walltime_seconds > 0 {
            worker.walltime_seconds as u64
        } else {
            self.config.default_task_timeout_seconds
        };

        let mut environment = HashMap::new();
        environment.insert("WORKER_ID".to_string(), worker.id.clone());
        environment.insert("EXPERIMENT_ID".to_string(), worker.experiment_id.clone());
        environment.insert(
            "COMPUTE_RESOURCE_ID".to_string(),
            worker.compute_resource_id.clone(),
        );

        WorkerRunConfig {
            heartbeat_interval_seconds: self.config.heartbeat_interval_seconds,
            task_timeout_seconds,
            working_directory: self.config.working_directory.clone(),
            environment,
        }
    }

    /// 服务一条Worker双工连接
    ///
    /// 每条连接一个读循环,按消息类型分发;入站端关闭即视为断连,
    /// 摘除连接并更新持久化状态。
    pub async fn serve_connection(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<WorkerMessage>,
        outbound: mpsc::Sender<ServerMessage>,
    ) {
        let mut connected_worker: Option<String> = None;

        while let Some(message) = inbound.recv().await {
            let worker_id = message.worker_id().to_string();

            let result = match message {
                WorkerMessage::Heartbeat(hb) => {
                    let r = self.handle_heartbeat(&hb, &outbound).await;
                    if r.is_ok() {
                        connected_worker = Some(worker_id.clone());
                    }
                    r
                }
                WorkerMessage::TaskRequest(req) => self.handle_task_request(&req).await,
                WorkerMessage::TaskStatusUpdate(update) => {
                    self.report_task_status(&update).await
                }
                WorkerMessage::TaskOutput(output) => self.handle_task_output(&output),
                WorkerMessage::WorkerMetrics(metrics) => {
                    self.handle_worker_metrics(&metrics).await
                }
                WorkerMessage::StagingProgress(progress) => {
                    self.handle_staging_status(&progress).await
                }
            };

            // 单条消息处理失败不断开连接,记录后继续
            if let Err(e) = result {
                warn!(worker_id = %worker_id, error = %e, "处理Worker消息失败");
            }
        }

        if let Some(worker_id) = connected_worker {
            self.handle_disconnect(&worker_id, &outbound).await;
        }
    }

    /// 心跳处理:首次接触建连,之后仅刷新存活信息
    ///
    /// 心跳从不触发任务分配,分配只走TaskRequest。
    pub async fn handle_heartbeat(
        &self,
        heartbeat: &Heartbeat,
        outbound: &mpsc::Sender<ServerMessage>,
    ) -> SchedulerResult<()> {
        let worker = self
            .worker_repo
            .get_by_id(&heartbeat.worker_id)
            .await?
            .ok_or_else(|| SchedulerError::WorkerNotFound {
                id: heartbeat.worker_id.clone(),
            })?;

        // 心跳走了新通道说明Worker重连了,登记新连接替换旧的
        let connection = match self.registry.get(&worker.id).await {
            Some(conn) if conn.uses_channel(outbound) => conn,
            existing => {
                let reconnect = existing.is_some();
                let conn = Arc::new(WorkerConnection::new(
                    worker.id.clone(),
                    worker.experiment_id.clone(),
                    worker.compute_resource_id.clone(),
                    outbound.clone(),
                ));
                self.registry.insert(conn.clone()).await;
                self.worker_repo
                    .update_connection_state(&worker.id, ConnectionState::Connected)
                    .await?;
                if reconnect {
                    info!(worker_id = %worker.id, "Worker心跳来自新通道,已切换出站连接");
                } else {
                    info!(worker_id = %worker.id, "Worker首次心跳,连接已建立");
                }
                conn
            }
        };

        connection.record_heartbeat(heartbeat).await;
        self.worker_repo
            .update_heartbeat(&worker.id, heartbeat.timestamp)
            .await?;

        // 只在折叠后的状态真正变化时回写,避免每次心跳都写状态列
        let mirrored = heartbeat.status.to_worker_status();
        if worker.status != mirrored {
            debug!(
                worker_id = %worker.id,
                from = %worker.status,
                to = %mirrored,
                "心跳状态与持久化状态不一致,回写"
            );
            self.worker_repo.update_status(&worker.id, mirrored).await?;
        }

        Ok(())
    }

    /// 空闲Worker拉取任务
    pub async fn handle_task_request(&self, request: &TaskRequest) -> SchedulerResult<()> {
        let worker_id = &request.worker_id;

        if self.is_draining() {
            debug!(worker_id = %worker_id, "调度器正在关闭,拒绝任务请求");
            return Ok(());
        }

        let connection = self
            .registry
            .get(worker_id)
            .await
            .ok_or_else(|| SchedulerError::WorkerNotFound {
                id: worker_id.clone(),
            })?;

        let worker = self
            .worker_repo
            .get_by_id(worker_id)
            .await?
            .ok_or_else(|| SchedulerError::WorkerNotFound {
                id: worker_id.clone(),
            })?;

        // 持久化状态必须是空闲且未持有任务,否则不触碰调度器
        if !worker.is_available() {
            debug!(
                worker_id = %worker_id,
                status = %worker.status,
                current_task = ?worker.current_task_id,
                "Worker不可用,忽略任务请求"
            );
            return Ok(());
        }

        let task = match self.scheduler.assign_task(worker_id).await {
            Ok(task) => task,
            Err(e) => {
                // 调度失败等同于暂无任务,Worker保持空闲等待下一轮拉取
                error!(worker_id = %worker_id, error = %e, "任务分配失败");
                return Ok(());
            }
        };

        match task {
            Some(task) => self.dispatch_assignment(&connection, &worker, task).await,
            None => {
                // 队列已空,下发自毁指令让Worker释放计算资源
                info!(worker_id = %worker_id, "队列无任务,下发Worker自毁指令");
                connection
                    .send(ServerMessage::WorkerShutdown(WorkerShutdownDirective {
                        worker_id: worker_id.clone(),
                        reason: "No tasks available".to_string(),
                        graceful: true,
                        timeout_seconds: self.config.shutdown_grace_seconds,
                    }))
                    .await
            }
        }
    }

    async fn dispatch_assignment(
        &self,
        connection: &WorkerConnection,
        worker: &Worker,
        task: Task,
    ) -> SchedulerResult<()> {
        let run_config = self.build_run_config(worker);
        let assignment = TaskAssignment {
            task_id: task.id.clone(),
            experiment_id: task.experiment_id.clone(),
            command: task.command.clone(),
            execution_script: task.execution_script.clone(),
            input_files: task.input_files.clone(),
            output_files: task.output_files.clone(),
            environment: run_config.environment,
            working_directory: run_config.working_directory,
            timeout_seconds: run_config.task_timeout_seconds,
        };

        connection
            .send(ServerMessage::TaskAssignment(assignment))
            .await?;
        connection.set_current_task(Some(task.id.clone())).await;

        self.publish_audit("task.assigned", "task", &task.id).await;
        info!(worker_id = %worker.id, task_id = %task.id, "任务已下发");
        Ok(())
    }

    /// 任务状态上报
    ///
    /// 所有权校验通过后,状态变更作为一次状态机转换提交;
    /// 终态附带Worker回收,FAILED附带诊断输出回传。
    pub async fn report_task_status(&self, update: &TaskStatusUpdate) -> SchedulerResult<()> {
        let task = self
            .task_repo
            .get_by_id(&update.task_id)
            .await?
            .ok_or_else(|| SchedulerError::TaskNotFound {
                id: update.task_id.clone(),
            })?;

        if !task.is_owned_by(&update.worker_id) {
            return Err(SchedulerError::NotTaskOwner {
                worker_id: update.worker_id.clone(),
                task_id: update.task_id.clone(),
            });
        }

        let mut metadata = match &update.metadata {
            serde_json::Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        metadata.insert(
            "worker_id".to_string(),
            serde_json::Value::String(update.worker_id.clone()),
        );
        if let Some(message) = &update.message {
            metadata.insert(
                "message".to_string(),
                serde_json::Value::String(message.clone()),
            );
        }

        self.state_manager
            .transition_task_state(
                &task.id,
                task.status,
                update.status,
                serde_json::Value::Object(metadata.clone()),
            )
            .await?;

        self.publish_event(
            EventQueueEntry::new(
                "task.status.updated",
                serde_json::json!({
                    "task_id": task.id,
                    "worker_id": update.worker_id,
                    "from": task.status,
                    "to": update.status,
                }),
            ),
        )
        .await;

        if update.status == gridsched_core::models::TaskStatus::Failed {
            self.push_upload_urls(&task.id, &update.worker_id).await;
        }

        if update.status.is_terminal() {
            self.release_worker(&update.worker_id, &task.id).await?;

            match update.status {
                gridsched_core::models::TaskStatus::Completed => {
                    self.publish_audit("task.completed", "task", &task.id).await;
                    self.finalize_completed_task(&task.id, &update.worker_id, &metadata);
                }
                gridsched_core::models::TaskStatus::Failed => {
                    self.publish_audit("task.failed", "task", &task.id).await;
                }
                _ => {}
            }
        }

        info!(
            task_id = %task.id,
            worker_id = %update.worker_id,
            from = %task.status,
            to = %update.status,
            "任务状态已更新"
        );
        Ok(())
    }

    /// 任务失败后尽力推送预签名上传URL,失败只记日志
    async fn push_upload_urls(&self, task_id: &str, worker_id: &str) {
        let urls = match self.data_mover.generate_upload_urls(task_id).await {
            Ok(urls) => urls,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "生成上传URL失败");
                return;
            }
        };
        if urls.is_empty() {
            return;
        }

        if let Some(conn) = self.registry.get(worker_id).await {
            let request = OutputUploadRequest {
                task_id: task_id.to_string(),
                upload_urls: urls,
            };
            if let Err(e) = conn.send(ServerMessage::OutputUploadRequest(request)).await {
                warn!(task_id = %task_id, worker_id = %worker_id, error = %e, "推送上传URL失败");
            }
        }
    }

    /// 终态任务释放Worker:持久化回空闲,连接侧清除当前任务
    async fn release_worker(&self, worker_id: &str, task_id: &str) -> SchedulerResult<()> {
        if let Some(worker) = self.worker_repo.get_by_id(worker_id).await? {
            if worker.status != WorkerStatus::Idle {
                self.state_manager
                    .transition_worker_state(
                        worker_id,
                        worker.status,
                        WorkerStatus::Idle,
                        serde_json::json!({"task_id": task_id, "reason": "task_terminal"}),
                    )
                    .await?;
            }
            self.worker_repo.set_current_task(worker_id, None).await?;
        }

        if let Some(conn) = self.registry.get(worker_id).await {
            conn.set_current_task(None).await;
        }
        Ok(())
    }

    /// 完成任务的异步收尾:归档输出,触发实验级完成检查
    fn finalize_completed_task(
        &self,
        task_id: &str,
        worker_id: &str,
        metadata: &serde_json::Map<String, serde_json::Value>,
    ) {
        let data_mover = self.data_mover.clone();
        let scheduler = self.scheduler.clone();
        let task_id = task_id.to_string();
        let worker_id = worker_id.to_string();
        let result = Some(serde_json::Value::Object(metadata.clone()));

        let in_flight = Arc::clone(&self.staging_in_flight);
        in_flight.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            if let Err(e) = data_mover.stage_task_output(&task_id, &worker_id).await {
                warn!(task_id = %task_id, error = %e, "任务输出归档失败");
            }
            if let Err(e) = scheduler.complete_task(&task_id, &worker_id, result).await {
                warn!(task_id = %task_id, error = %e, "任务完成收尾失败");
            }
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// 任务输出片段只做日志路由,不落库
    pub fn handle_task_output(
        &self,
        output: &gridsched_core::models::TaskOutput,
    ) -> SchedulerResult<()> {
        match output.kind {
            OutputKind::Stderr => {
                warn!(task_id = %output.task_id, worker_id = %output.worker_id, "{}", output.data)
            }
            OutputKind::Stdout | OutputKind::Log => {
                debug!(task_id = %output.task_id, worker_id = %output.worker_id, "{}", output.data)
            }
        }
        Ok(())
    }

    /// 资源占用上报,记入连接元数据
    pub async fn handle_worker_metrics(
        &self,
        metrics: &WorkerMetricsReport,
    ) -> SchedulerResult<()> {
        if let Some(connection) = self.registry.get(&metrics.worker_id).await {
            connection
                .record_metrics(metrics.cpu_usage_percent, metrics.memory_usage_percent)
                .await;
        }
        debug!(
            worker_id = %metrics.worker_id,
            cpu = metrics.cpu_usage_percent,
            memory = metrics.memory_usage_percent,
            "Worker资源上报"
        );
        Ok(())
    }

    /// 数据暂存进度上报
    pub async fn handle_staging_status(&self, progress: &StagingProgress) -> SchedulerResult<()> {
        self.staging_repo
            .update_progress(
                &progress.staging_id,
                progress.completed_files,
                progress.failed_files,
            )
            .await?;

        match progress.status {
            StagingStatus::Completed => {
                self.staging_repo.mark_completed(&progress.staging_id).await?;
                debug!(staging_id = %progress.staging_id, task_id = %progress.task_id, "暂存完成");
            }
            StagingStatus::Failed => {
                let error = progress.error.as_deref().unwrap_or("staging failed");
                self.staging_repo
                    .mark_failed(&progress.staging_id, error)
                    .await?;
                warn!(staging_id = %progress.staging_id, task_id = %progress.task_id, error = %error, "暂存失败");
            }
            StagingStatus::Pending | StagingStatus::Running => {}
        }
        Ok(())
    }

    /// 向指定Worker下发任务取消指令
    pub async fn cancel_task_for_worker(
        &self,
        worker_id: &str,
        task_id: &str,
        reason: &str,
        force: bool,
    ) -> SchedulerResult<()> {
        let connection = self
            .registry
            .get(worker_id)
            .await
            .ok_or_else(|| SchedulerError::WorkerNotFound {
                id: worker_id.to_string(),
            })?;

        connection
            .send(ServerMessage::TaskCancellation(TaskCancellation {
                task_id: task_id.to_string(),
                reason: reason.to_string(),
                force,
                grace_period_seconds: self.config.shutdown_grace_seconds,
            }))
            .await?;
        self.publish_audit("task.cancel.requested", "task", task_id).await;
        Ok(())
    }

    /// 向指定Worker下发自毁指令
    pub async fn shutdown_worker(&self, worker_id: &str, reason: &str) -> SchedulerResult<()> {
        let connection = self
            .registry
            .get(worker_id)
            .await
            .ok_or_else(|| SchedulerError::WorkerNotFound {
                id: worker_id.to_string(),
            })?;

        connection
            .send(ServerMessage::WorkerShutdown(WorkerShutdownDirective {
                worker_id: worker_id.to_string(),
                reason: reason.to_string(),
                graceful: true,
                timeout_seconds: self.config.shutdown_grace_seconds,
            }))
            .await?;
        self.publish_audit("worker.shutdown.requested", "worker", worker_id).await;
        Ok(())
    }

    /// 连接断开处理:摘除注册表条目并回写连接状态
    ///
    /// 只处理仍挂在本通道上的连接;Worker已重连到新通道时,
    /// 旧通道的EOF不摘除也不回写断连状态。
    pub async fn handle_disconnect(
        &self,
        worker_id: &str,
        outbound: &mpsc::Sender<ServerMessage>,
    ) {
        if self
            .registry
            .remove_if_channel(worker_id, outbound)
            .await
            .is_none()
        {
            debug!(worker_id = %worker_id, "旧通道关闭时Worker已在新通道上,跳过断连处理");
            return;
        }
        info!(worker_id = %worker_id, "Worker连接断开");
        if let Err(e) = self
            .worker_repo
            .update_connection_state(worker_id, ConnectionState::Disconnected)
            .await
        {
            warn!(worker_id = %worker_id, error = %e, "回写断连状态失败");
        }
    }

    async fn publish_audit(&self, action: &str, resource_kind: &str, resource_id: &str) {
        self.publish_event(EventQueueEntry::audit(
            "scheduler",
            action,
            resource_kind,
            resource_id,
        ))
        .await;
    }

    /// 事件发布失败不影响主流程
    async fn publish_event(&self, entry: EventQueueEntry) {
        let event_type = entry.event_type.clone();
        if let Err(e) = self.events.publish(entry).await {
            warn!(event_type = %event_type, error = %e, "事件发布失败");
        }
    }
}

impl WorkIntake for WorkerCoordinator {
    /// 进入排水模式,之后的TaskRequest一律不分配
    fn stop_accepting(&self) {
        self.draining.store(true, Ordering::SeqCst);
        info!("协调器进入排水模式,停止接收新任务请求");
    }
}

#[async_trait]
impl DrainTask for WorkerCoordinator {
    fn name(&self) -> &str {
        "output-staging"
    }

    /// 等待在途的输出归档收尾任务结束,外层有超时预算兜底
    async fn drain(&self) -> SchedulerResult<()> {
        while self.staging_in_flight.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(())
    }
}
