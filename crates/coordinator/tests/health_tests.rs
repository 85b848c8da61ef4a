//! 健康监控的集成测试:心跳超时判定与失联Worker回收

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;

use gridsched_core::config::HealthMonitorConfig;
use gridsched_core::models::{
    ConnectionState, Heartbeat, ReportedWorkerStatus, ServerMessage, WorkerStatus,
};
use gridsched_coordinator::test_utils::{
    make_worker, MockEventPublisher, MockTaskScheduler, MockWorkerRepository,
};
use gridsched_coordinator::{HealthMonitor, WorkerConnection, WorkerConnectionRegistry};

fn build_monitor(
    registry: Arc<WorkerConnectionRegistry>,
    worker_repo: MockWorkerRepository,
    scheduler: MockTaskScheduler,
    events: MockEventPublisher,
) -> HealthMonitor {
    HealthMonitor::new(
        registry,
        Arc::new(worker_repo),
        Arc::new(scheduler),
        Arc::new(events),
        HealthMonitorConfig {
            check_interval_seconds: 30,
            heartbeat_timeout_seconds: 120,
        },
    )
}

/// 登记一条连接并把最近心跳设置为指定秒数之前
async fn connect_with_age(
    registry: &WorkerConnectionRegistry,
    worker_id: &str,
    age_seconds: i64,
) -> mpsc::Receiver<ServerMessage> {
    let (tx, rx) = mpsc::channel(8);
    let connection = Arc::new(WorkerConnection::new(worker_id, "exp-1", "cluster-a", tx));
    connection
        .record_heartbeat(&Heartbeat {
            worker_id: worker_id.to_string(),
            status: ReportedWorkerStatus::Idle,
            current_task_id: None,
            capabilities: None,
            metadata: HashMap::new(),
            timestamp: Utc::now() - chrono::Duration::seconds(age_seconds),
        })
        .await;
    registry.insert(connection).await;
    rx
}

#[tokio::test]
async fn test_sweep_keeps_fresh_workers() {
    let registry = Arc::new(WorkerConnectionRegistry::new());
    let worker_repo =
        MockWorkerRepository::with_workers(vec![make_worker("worker-1", "exp-1", "cluster-a")]);
    let scheduler = MockTaskScheduler::new();
    let monitor = build_monitor(
        registry.clone(),
        worker_repo,
        scheduler.clone(),
        MockEventPublisher::new(),
    );

    let _rx = connect_with_age(&registry, "worker-1", 10).await;

    let timed_out = monitor.sweep().await.unwrap();
    assert!(timed_out.is_empty());
    assert!(registry.contains("worker-1").await);
    assert!(scheduler.failed_calls().is_empty());
}

#[tokio::test]
async fn test_sweep_evicts_stale_worker_and_fails_task() {
    let registry = Arc::new(WorkerConnectionRegistry::new());
    let mut worker = make_worker("worker-1", "exp-1", "cluster-a");
    worker.status = WorkerStatus::Busy;
    worker.connection_state = ConnectionState::Connected;
    worker.current_task_id = Some("task-1".to_string());
    let worker_repo = MockWorkerRepository::with_workers(vec![worker]);
    let scheduler = MockTaskScheduler::new();
    let events = MockEventPublisher::new();
    let monitor = build_monitor(
        registry.clone(),
        worker_repo.clone(),
        scheduler.clone(),
        events.clone(),
    );

    let _rx = connect_with_age(&registry, "worker-1", 300).await;

    let timed_out = monitor.sweep().await.unwrap();
    assert_eq!(timed_out, vec!["worker-1".to_string()]);

    // 在途任务以固定原因判失,重试与否由调度策略决定
    assert_eq!(
        scheduler.failed_calls(),
        vec![(
            "task-1".to_string(),
            "worker-1".to_string(),
            "Worker connection timeout".to_string()
        )]
    );

    let recovered = worker_repo.get("worker-1").unwrap();
    assert_eq!(recovered.status, WorkerStatus::Idle);
    assert!(recovered.current_task_id.is_none());
    assert_eq!(recovered.connection_state, ConnectionState::Disconnected);
    assert!(!registry.contains("worker-1").await);
    assert!(events
        .published_types()
        .contains(&"audit.worker.timeout".to_string()));
}

#[tokio::test]
async fn test_sweep_evicts_idle_stale_worker_without_failing_tasks() {
    let registry = Arc::new(WorkerConnectionRegistry::new());
    let mut worker = make_worker("worker-1", "exp-1", "cluster-a");
    worker.connection_state = ConnectionState::Connected;
    let worker_repo = MockWorkerRepository::with_workers(vec![worker]);
    let scheduler = MockTaskScheduler::new();
    let monitor = build_monitor(
        registry.clone(),
        worker_repo.clone(),
        scheduler.clone(),
        MockEventPublisher::new(),
    );

    let _rx = connect_with_age(&registry, "worker-1", 300).await;

    let timed_out = monitor.sweep().await.unwrap();
    assert_eq!(timed_out, vec!["worker-1".to_string()]);
    assert!(scheduler.failed_calls().is_empty());
    assert!(!registry.contains("worker-1").await);
}

#[tokio::test]
async fn test_sweep_continues_past_single_worker_failure() {
    let registry = Arc::new(WorkerConnectionRegistry::new());
    // worker-1没有持久化行,处理仍然成功(仅摘除连接);worker-2正常回收
    let mut worker2 = make_worker("worker-2", "exp-1", "cluster-a");
    worker2.connection_state = ConnectionState::Connected;
    let worker_repo = MockWorkerRepository::with_workers(vec![worker2]);
    let monitor = build_monitor(
        registry.clone(),
        worker_repo,
        MockTaskScheduler::new(),
        MockEventPublisher::new(),
    );

    let _rx1 = connect_with_age(&registry, "worker-1", 300).await;
    let _rx2 = connect_with_age(&registry, "worker-2", 300).await;

    let mut timed_out = monitor.sweep().await.unwrap();
    timed_out.sort();
    assert_eq!(
        timed_out,
        vec!["worker-1".to_string(), "worker-2".to_string()]
    );
    assert!(registry.is_empty().await);
}
