//! Worker协调协议的集成测试:注册校验、拉取式分配、状态上报

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;

use gridsched_core::config::CoordinatorConfig;
use gridsched_core::models::{
    Heartbeat, ReportedWorkerStatus, ServerMessage, SignedUploadUrl, StagingOperation,
    StagingProgress, StagingStatus, TaskRequest, TaskStatus, TaskStatusUpdate, WorkerMessage,
    WorkerMetricsReport, WorkerRegistration, WorkerStatus,
};
use gridsched_core::SchedulerError;
use gridsched_coordinator::test_utils::{
    make_task, make_worker, MockDataMover, MockEventPublisher, MockStagingRepository,
    MockStateManager, MockTaskRepository, MockTaskScheduler, MockWorkerRepository,
};
use gridsched_coordinator::{
    WorkIntake, WorkerConnection, WorkerConnectionRegistry, WorkerCoordinator,
};

struct Harness {
    coordinator: Arc<WorkerCoordinator>,
    registry: Arc<WorkerConnectionRegistry>,
    worker_repo: MockWorkerRepository,
    task_repo: MockTaskRepository,
    scheduler: MockTaskScheduler,
    data_mover: MockDataMover,
    events: MockEventPublisher,
}

fn build_harness(
    worker_repo: MockWorkerRepository,
    task_repo: MockTaskRepository,
    scheduler: MockTaskScheduler,
    data_mover: MockDataMover,
) -> Harness {
    let registry = Arc::new(WorkerConnectionRegistry::new());
    let state_manager = MockStateManager::mirroring(task_repo.clone(), worker_repo.clone());
    let events = MockEventPublisher::new();

    let coordinator = Arc::new(WorkerCoordinator::new(
        registry.clone(),
        Arc::new(worker_repo.clone()),
        Arc::new(task_repo.clone()),
        Arc::new(MockStagingRepository::new()),
        Arc::new(scheduler.clone()),
        Arc::new(state_manager),
        Arc::new(data_mover.clone()),
        Arc::new(events.clone()),
        CoordinatorConfig::default(),
    ));

    Harness {
        coordinator,
        registry,
        worker_repo,
        task_repo,
        scheduler,
        data_mover,
        events,
    }
}

fn heartbeat(worker_id: &str) -> Heartbeat {
    Heartbeat {
        worker_id: worker_id.to_string(),
        status: ReportedWorkerStatus::Idle,
        current_task_id: None,
        capabilities: None,
        metadata: HashMap::new(),
        timestamp: Utc::now(),
    }
}

/// 建立连接:先心跳,拿到出站接收端
async fn connect(harness: &Harness, worker_id: &str) -> mpsc::Receiver<ServerMessage> {
    let (tx, rx) = mpsc::channel(8);
    harness
        .coordinator
        .handle_heartbeat(&heartbeat(worker_id), &tx)
        .await
        .unwrap();
    rx
}

#[tokio::test]
async fn test_register_unknown_worker_rejected() {
    let harness = build_harness(
        MockWorkerRepository::new(),
        MockTaskRepository::new(),
        MockTaskScheduler::new(),
        MockDataMover::new(),
    );

    let result = harness
        .coordinator
        .register_worker(&WorkerRegistration {
            worker_id: "ghost".to_string(),
            experiment_id: "exp-1".to_string(),
            compute_resource_id: "cluster-a".to_string(),
        })
        .await;

    assert!(matches!(result, Err(SchedulerError::WorkerNotFound { .. })));
}

#[tokio::test]
async fn test_register_mismatched_triple_rejected() {
    let worker_repo =
        MockWorkerRepository::with_workers(vec![make_worker("worker-1", "exp-1", "cluster-a")]);
    let harness = build_harness(
        worker_repo,
        MockTaskRepository::new(),
        MockTaskScheduler::new(),
        MockDataMover::new(),
    );

    let wrong_experiment = harness
        .coordinator
        .register_worker(&WorkerRegistration {
            worker_id: "worker-1".to_string(),
            experiment_id: "exp-2".to_string(),
            compute_resource_id: "cluster-a".to_string(),
        })
        .await;
    assert!(matches!(
        wrong_experiment,
        Err(SchedulerError::RegistrationMismatch(_))
    ));

    let wrong_resource = harness
        .coordinator
        .register_worker(&WorkerRegistration {
            worker_id: "worker-1".to_string(),
            experiment_id: "exp-1".to_string(),
            compute_resource_id: "cluster-b".to_string(),
        })
        .await;
    assert!(matches!(
        wrong_resource,
        Err(SchedulerError::RegistrationMismatch(_))
    ));
}

#[tokio::test]
async fn test_register_returns_run_config_and_marks_connected() {
    let mut worker = make_worker("worker-1", "exp-1", "cluster-a");
    worker.walltime_seconds = 7200;
    let worker_repo = MockWorkerRepository::with_workers(vec![worker]);
    let harness = build_harness(
        worker_repo,
        MockTaskRepository::new(),
        MockTaskScheduler::new(),
        MockDataMover::new(),
    );

    let run_config = harness
        .coordinator
        .register_worker(&WorkerRegistration {
            worker_id: "worker-1".to_string(),
            experiment_id: "exp-1".to_string(),
            compute_resource_id: "cluster-a".to_string(),
        })
        .await
        .unwrap();

    // walltime已知时任务超时取walltime
    assert_eq!(run_config.task_timeout_seconds, 7200);
    assert_eq!(
        run_config.environment.get("WORKER_ID"),
        Some(&"worker-1".to_string())
    );
    assert_eq!(
        run_config.environment.get("EXPERIMENT_ID"),
        Some(&"exp-1".to_string())
    );

    let stored = harness.worker_repo.get("worker-1").unwrap();
    assert!(stored.registered_at.is_some());
    assert!(harness
        .events
        .published_types()
        .contains(&"audit.worker.registered".to_string()));
}

#[tokio::test]
async fn test_register_falls_back_to_default_timeout() {
    let worker_repo =
        MockWorkerRepository::with_workers(vec![make_worker("worker-1", "exp-1", "cluster-a")]);
    let harness = build_harness(
        worker_repo,
        MockTaskRepository::new(),
        MockTaskScheduler::new(),
        MockDataMover::new(),
    );

    let run_config = harness
        .coordinator
        .register_worker(&WorkerRegistration {
            worker_id: "worker-1".to_string(),
            experiment_id: "exp-1".to_string(),
            compute_resource_id: "cluster-a".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(
        run_config.task_timeout_seconds,
        CoordinatorConfig::default().default_task_timeout_seconds
    );
}

#[tokio::test]
async fn test_heartbeat_unknown_worker_rejected() {
    let harness = build_harness(
        MockWorkerRepository::new(),
        MockTaskRepository::new(),
        MockTaskScheduler::new(),
        MockDataMover::new(),
    );
    let (tx, _rx) = mpsc::channel(8);

    let result = harness
        .coordinator
        .handle_heartbeat(&heartbeat("ghost"), &tx)
        .await;
    assert!(matches!(result, Err(SchedulerError::WorkerNotFound { .. })));
    assert!(harness.registry.is_empty().await);
}

#[tokio::test]
async fn test_heartbeat_establishes_connection_and_never_assigns() {
    let worker_repo =
        MockWorkerRepository::with_workers(vec![make_worker("worker-1", "exp-1", "cluster-a")]);
    let task_repo = MockTaskRepository::new();
    let scheduler =
        MockTaskScheduler::with_queue(vec![make_task("task-1", "exp-1", TaskStatus::Queued)]);
    let harness = build_harness(worker_repo, task_repo, scheduler, MockDataMover::new());

    let mut rx = connect(&harness, "worker-1").await;

    // 队列里有任务,但心跳绝不触发分配
    assert!(rx.try_recv().is_err());
    assert!(harness.registry.contains("worker-1").await);
    let stored = harness.worker_repo.get("worker-1").unwrap();
    assert!(stored.last_heartbeat.is_some());
}

#[tokio::test]
async fn test_heartbeat_folds_reported_status_into_store() {
    let worker_repo =
        MockWorkerRepository::with_workers(vec![make_worker("worker-1", "exp-1", "cluster-a")]);
    let harness = build_harness(
        worker_repo,
        MockTaskRepository::new(),
        MockTaskScheduler::new(),
        MockDataMover::new(),
    );

    let (tx, _rx) = mpsc::channel(8);
    let mut hb = heartbeat("worker-1");
    hb.status = ReportedWorkerStatus::Staging;
    harness.coordinator.handle_heartbeat(&hb, &tx).await.unwrap();

    // Staging折叠为BUSY后回写
    assert_eq!(
        harness.worker_repo.get("worker-1").unwrap().status,
        WorkerStatus::Busy
    );
}

#[tokio::test]
async fn test_task_request_dispatches_assignment() {
    let worker_repo =
        MockWorkerRepository::with_workers(vec![make_worker("worker-1", "exp-1", "cluster-a")]);
    let scheduler =
        MockTaskScheduler::with_queue(vec![make_task("task-1", "exp-1", TaskStatus::Queued)]);
    let harness = build_harness(
        worker_repo,
        MockTaskRepository::new(),
        scheduler,
        MockDataMover::new(),
    );

    let mut rx = connect(&harness, "worker-1").await;
    harness
        .coordinator
        .handle_task_request(&TaskRequest {
            worker_id: "worker-1".to_string(),
            experiment_id: "exp-1".to_string(),
        })
        .await
        .unwrap();

    match rx.recv().await.unwrap() {
        ServerMessage::TaskAssignment(assignment) => {
            assert_eq!(assignment.task_id, "task-1");
            assert_eq!(assignment.experiment_id, "exp-1");
            assert_eq!(
                assignment.environment.get("WORKER_ID"),
                Some(&"worker-1".to_string())
            );
        }
        other => panic!("期望TaskAssignment,收到 {other:?}"),
    }

    let connection = harness.registry.get("worker-1").await.unwrap();
    assert_eq!(connection.current_task_id().await, Some("task-1".to_string()));
    assert!(harness
        .events
        .published_types()
        .contains(&"audit.task.assigned".to_string()));
}

#[tokio::test]
async fn test_task_request_empty_queue_sends_shutdown_directive() {
    let worker_repo =
        MockWorkerRepository::with_workers(vec![make_worker("worker-1", "exp-1", "cluster-a")]);
    let harness = build_harness(
        worker_repo,
        MockTaskRepository::new(),
        MockTaskScheduler::new(),
        MockDataMover::new(),
    );

    let mut rx = connect(&harness, "worker-1").await;
    harness
        .coordinator
        .handle_task_request(&TaskRequest {
            worker_id: "worker-1".to_string(),
            experiment_id: "exp-1".to_string(),
        })
        .await
        .unwrap();

    match rx.recv().await.unwrap() {
        ServerMessage::WorkerShutdown(directive) => {
            assert_eq!(directive.reason, "No tasks available");
            assert!(directive.graceful);
        }
        other => panic!("期望WorkerShutdown,收到 {other:?}"),
    }
}

#[tokio::test]
async fn test_task_request_rejected_while_draining() {
    let worker_repo =
        MockWorkerRepository::with_workers(vec![make_worker("worker-1", "exp-1", "cluster-a")]);
    let scheduler =
        MockTaskScheduler::with_queue(vec![make_task("task-1", "exp-1", TaskStatus::Queued)]);
    let harness = build_harness(
        worker_repo,
        MockTaskRepository::new(),
        scheduler,
        MockDataMover::new(),
    );

    let mut rx = connect(&harness, "worker-1").await;
    harness.coordinator.stop_accepting();

    harness
        .coordinator
        .handle_task_request(&TaskRequest {
            worker_id: "worker-1".to_string(),
            experiment_id: "exp-1".to_string(),
        })
        .await
        .unwrap();

    // 排水中既不分配也不下发自毁指令
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_task_request_ignored_for_busy_worker() {
    let mut worker = make_worker("worker-1", "exp-1", "cluster-a");
    worker.status = WorkerStatus::Busy;
    worker.current_task_id = Some("task-0".to_string());
    let worker_repo = MockWorkerRepository::with_workers(vec![worker]);
    let scheduler =
        MockTaskScheduler::with_queue(vec![make_task("task-1", "exp-1", TaskStatus::Queued)]);
    let harness = build_harness(
        worker_repo,
        MockTaskRepository::new(),
        scheduler,
        MockDataMover::new(),
    );

    // 直接登记连接,避免心跳把上报状态折叠回存储
    let (tx, mut rx) = mpsc::channel(8);
    harness
        .registry
        .insert(Arc::new(WorkerConnection::new(
            "worker-1",
            "exp-1",
            "cluster-a",
            tx,
        )))
        .await;

    harness
        .coordinator
        .handle_task_request(&TaskRequest {
            worker_id: "worker-1".to_string(),
            experiment_id: "exp-1".to_string(),
        })
        .await
        .unwrap();

    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_task_request_scheduler_error_keeps_worker_idle() {
    let worker_repo =
        MockWorkerRepository::with_workers(vec![make_worker("worker-1", "exp-1", "cluster-a")]);
    let scheduler = MockTaskScheduler::new();
    scheduler.fail_assignments();
    let harness = build_harness(
        worker_repo,
        MockTaskRepository::new(),
        scheduler,
        MockDataMover::new(),
    );

    let mut rx = connect(&harness, "worker-1").await;
    let result = harness
        .coordinator
        .handle_task_request(&TaskRequest {
            worker_id: "worker-1".to_string(),
            experiment_id: "exp-1".to_string(),
        })
        .await;

    // 调度失败吞掉,连接不断开,也不下发自毁指令
    assert!(result.is_ok());
    assert!(rx.try_recv().is_err());
    assert_eq!(
        harness.worker_repo.get("worker-1").unwrap().status,
        WorkerStatus::Idle
    );
}

#[tokio::test]
async fn test_report_status_requires_ownership() {
    let mut task = make_task("task-1", "exp-1", TaskStatus::Running);
    task.worker_id = Some("worker-1".to_string());
    let task_repo = MockTaskRepository::with_tasks(vec![task]);
    let harness = build_harness(
        MockWorkerRepository::new(),
        task_repo,
        MockTaskScheduler::new(),
        MockDataMover::new(),
    );

    let result = harness
        .coordinator
        .report_task_status(&TaskStatusUpdate {
            task_id: "task-1".to_string(),
            worker_id: "worker-2".to_string(),
            status: TaskStatus::Completed,
            message: None,
            metadata: serde_json::json!({}),
            timestamp: Utc::now(),
        })
        .await;

    assert!(matches!(result, Err(SchedulerError::NotTaskOwner { .. })));
    // 状态未被触碰
    assert_eq!(
        harness.task_repo.get("task-1").unwrap().status,
        TaskStatus::Running
    );
}

#[tokio::test]
async fn test_report_status_unknown_task_rejected() {
    let harness = build_harness(
        MockWorkerRepository::new(),
        MockTaskRepository::new(),
        MockTaskScheduler::new(),
        MockDataMover::new(),
    );

    let result = harness
        .coordinator
        .report_task_status(&TaskStatusUpdate {
            task_id: "ghost".to_string(),
            worker_id: "worker-1".to_string(),
            status: TaskStatus::Running,
            message: None,
            metadata: serde_json::json!({}),
            timestamp: Utc::now(),
        })
        .await;

    assert!(matches!(result, Err(SchedulerError::TaskNotFound { .. })));
}

#[tokio::test]
async fn test_completed_report_releases_worker_and_finalizes() {
    let mut worker = make_worker("worker-1", "exp-1", "cluster-a");
    worker.status = WorkerStatus::Busy;
    worker.current_task_id = Some("task-1".to_string());
    let worker_repo = MockWorkerRepository::with_workers(vec![worker]);

    let mut task = make_task("task-1", "exp-1", TaskStatus::Running);
    task.worker_id = Some("worker-1".to_string());
    let task_repo = MockTaskRepository::with_tasks(vec![task]);

    let scheduler = MockTaskScheduler::new();
    let harness = build_harness(worker_repo, task_repo, scheduler, MockDataMover::new());

    harness
        .coordinator
        .report_task_status(&TaskStatusUpdate {
            task_id: "task-1".to_string(),
            worker_id: "worker-1".to_string(),
            status: TaskStatus::Completed,
            message: Some("exit 0".to_string()),
            metadata: serde_json::json!({"exit_code": 0}),
            timestamp: Utc::now(),
        })
        .await
        .unwrap();

    assert_eq!(
        harness.task_repo.get("task-1").unwrap().status,
        TaskStatus::Completed
    );
    let released = harness.worker_repo.get("worker-1").unwrap();
    assert_eq!(released.status, WorkerStatus::Idle);
    assert!(released.current_task_id.is_none());

    let types = harness.events.published_types();
    assert!(types.contains(&"task.status.updated".to_string()));
    assert!(types.contains(&"audit.task.completed".to_string()));

    // 收尾在后台任务里执行:归档输出并调用complete_task
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        harness.data_mover.staged_calls(),
        vec![("task-1".to_string(), "worker-1".to_string())]
    );
    assert_eq!(
        harness.scheduler.completed_calls(),
        vec![("task-1".to_string(), "worker-1".to_string())]
    );
}

#[tokio::test]
async fn test_failed_report_pushes_upload_urls() {
    let mut worker = make_worker("worker-1", "exp-1", "cluster-a");
    worker.status = WorkerStatus::Busy;
    worker.current_task_id = Some("task-1".to_string());
    let worker_repo = MockWorkerRepository::with_workers(vec![worker]);

    let mut task = make_task("task-1", "exp-1", TaskStatus::Running);
    task.worker_id = Some("worker-1".to_string());
    let task_repo = MockTaskRepository::with_tasks(vec![task]);

    let data_mover = MockDataMover::with_urls(vec![SignedUploadUrl {
        local_path: "stdout.log".to_string(),
        url: "https://storage.example/upload/task-1/stdout.log".to_string(),
        expires_at: Utc::now() + chrono::Duration::hours(1),
    }]);
    let harness = build_harness(worker_repo, task_repo, MockTaskScheduler::new(), data_mover);

    let mut rx = connect(&harness, "worker-1").await;
    harness
        .coordinator
        .report_task_status(&TaskStatusUpdate {
            task_id: "task-1".to_string(),
            worker_id: "worker-1".to_string(),
            status: TaskStatus::Failed,
            message: Some("segfault".to_string()),
            metadata: serde_json::json!({}),
            timestamp: Utc::now(),
        })
        .await
        .unwrap();

    match rx.recv().await.unwrap() {
        ServerMessage::OutputUploadRequest(request) => {
            assert_eq!(request.task_id, "task-1");
            assert_eq!(request.upload_urls.len(), 1);
        }
        other => panic!("期望OutputUploadRequest,收到 {other:?}"),
    }

    assert_eq!(
        harness.task_repo.get("task-1").unwrap().status,
        TaskStatus::Failed
    );
    assert!(harness
        .events
        .published_types()
        .contains(&"audit.task.failed".to_string()));

    // 失败不触发完成收尾
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(harness.scheduler.completed_calls().is_empty());
}

#[tokio::test]
async fn test_staging_progress_marks_completed() {
    let now = Utc::now();
    let staging_repo = MockStagingRepository::with_operations(vec![StagingOperation {
        id: "stg-1".to_string(),
        task_id: "task-1".to_string(),
        worker_id: Some("worker-1".to_string()),
        status: StagingStatus::Running,
        total_files: 3,
        completed_files: 1,
        failed_files: 0,
        error: None,
        started_at: Some(now),
        completed_at: None,
        created_at: now,
        updated_at: now,
    }]);

    let registry = Arc::new(WorkerConnectionRegistry::new());
    let coordinator = WorkerCoordinator::new(
        registry,
        Arc::new(MockWorkerRepository::new()),
        Arc::new(MockTaskRepository::new()),
        Arc::new(staging_repo.clone()),
        Arc::new(MockTaskScheduler::new()),
        Arc::new(MockStateManager::new()),
        Arc::new(MockDataMover::new()),
        Arc::new(MockEventPublisher::new()),
        CoordinatorConfig::default(),
    );

    coordinator
        .handle_staging_status(&StagingProgress {
            staging_id: "stg-1".to_string(),
            task_id: "task-1".to_string(),
            worker_id: "worker-1".to_string(),
            status: StagingStatus::Completed,
            completed_files: 3,
            failed_files: 0,
            total_files: 3,
            error: None,
        })
        .await
        .unwrap();

    let op = staging_repo.get("stg-1").unwrap();
    assert_eq!(op.status, StagingStatus::Completed);
    assert_eq!(op.completed_files, 3);
    assert!(op.completed_at.is_some());
}

#[tokio::test]
async fn test_worker_metrics_recorded_in_connection() {
    let worker_repo =
        MockWorkerRepository::with_workers(vec![make_worker("worker-1", "exp-1", "cluster-a")]);
    let harness = build_harness(
        worker_repo,
        MockTaskRepository::new(),
        MockTaskScheduler::new(),
        MockDataMover::new(),
    );

    let _rx = connect(&harness, "worker-1").await;
    harness
        .coordinator
        .handle_worker_metrics(&WorkerMetricsReport {
            worker_id: "worker-1".to_string(),
            cpu_usage_percent: 87.5,
            memory_usage_percent: 42.0,
            timestamp: Utc::now(),
        })
        .await
        .unwrap();

    let info = harness
        .registry
        .get("worker-1")
        .await
        .unwrap()
        .info_snapshot()
        .await;
    assert_eq!(
        info.metadata.get("cpu_usage_percent"),
        Some(&"87.5".to_string())
    );
    assert_eq!(
        info.metadata.get("memory_usage_percent"),
        Some(&"42".to_string())
    );
}

#[tokio::test]
async fn test_reconnect_switches_channel_and_survives_old_eof() {
    let worker_repo =
        MockWorkerRepository::with_workers(vec![make_worker("worker-1", "exp-1", "cluster-a")]);
    let scheduler =
        MockTaskScheduler::with_queue(vec![make_task("task-1", "exp-1", TaskStatus::Queued)]);
    let harness = build_harness(
        worker_repo,
        MockTaskRepository::new(),
        scheduler,
        MockDataMover::new(),
    );

    // 第一条连接走serve_connection
    let (inbound_tx, inbound_rx) = mpsc::channel::<WorkerMessage>(8);
    let (outbound_tx, mut old_rx) = mpsc::channel::<ServerMessage>(8);
    let handle = tokio::spawn(
        harness
            .coordinator
            .clone()
            .serve_connection(inbound_rx, outbound_tx),
    );
    inbound_tx
        .send(WorkerMessage::Heartbeat(heartbeat("worker-1")))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(harness.registry.contains("worker-1").await);

    // Worker重连,心跳改走新通道
    let mut new_rx = connect(&harness, "worker-1").await;
    assert_eq!(harness.registry.len().await, 1);

    // 出站消息必须走新通道
    harness
        .coordinator
        .handle_task_request(&TaskRequest {
            worker_id: "worker-1".to_string(),
            experiment_id: "exp-1".to_string(),
        })
        .await
        .unwrap();
    match new_rx.recv().await.unwrap() {
        ServerMessage::TaskAssignment(assignment) => assert_eq!(assignment.task_id, "task-1"),
        other => panic!("期望TaskAssignment,收到 {other:?}"),
    }
    assert!(old_rx.try_recv().is_err());

    // 旧通道EOF不得摘除重连后的连接,也不回写断连状态
    drop(inbound_tx);
    handle.await.unwrap();
    assert!(harness.registry.contains("worker-1").await);
    assert_eq!(
        harness.worker_repo.get("worker-1").unwrap().connection_state,
        gridsched_core::models::ConnectionState::Connected
    );
}

#[tokio::test]
async fn test_connection_drop_evicts_worker() {
    let worker_repo =
        MockWorkerRepository::with_workers(vec![make_worker("worker-1", "exp-1", "cluster-a")]);
    let harness = build_harness(
        worker_repo,
        MockTaskRepository::new(),
        MockTaskScheduler::new(),
        MockDataMover::new(),
    );

    let (inbound_tx, inbound_rx) = mpsc::channel::<WorkerMessage>(8);
    let (outbound_tx, _outbound_rx) = mpsc::channel::<ServerMessage>(8);
    let handle = tokio::spawn(
        harness
            .coordinator
            .clone()
            .serve_connection(inbound_rx, outbound_tx),
    );

    inbound_tx
        .send(WorkerMessage::Heartbeat(heartbeat("worker-1")))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(harness.registry.contains("worker-1").await);

    // 入站端关闭即断连
    drop(inbound_tx);
    handle.await.unwrap();

    assert!(!harness.registry.contains("worker-1").await);
    assert_eq!(
        harness.worker_repo.get("worker-1").unwrap().connection_state,
        gridsched_core::models::ConnectionState::Disconnected
    );
}
