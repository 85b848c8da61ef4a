//! In-memory mock implementations for the repository and collaborator traits.
//!
//! Used by the coordinator's unit and integration tests; no database or
//! external service required.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use gridsched_core::models::{
    ConnectionState, EventQueueEntry, SchedulerLifecycle, SchedulerState, SignedUploadUrl,
    StagingOperation, StagingStatus, Task, TaskLease, TaskStatus, Worker, WorkerStatus,
    SCHEDULER_STATE_ID,
};
use gridsched_core::traits::{
    DataMover, EventPublisher, EventReplay, SchedulerStateRepository, StagingOperationRepository,
    StateManager, TaskRepository, TaskScheduler, WorkerRepository,
};
use gridsched_core::{SchedulerError, SchedulerResult};

/// Builds a worker row the way the experiment-submission flow would.
pub fn make_worker(id: &str, experiment_id: &str, compute_resource_id: &str) -> Worker {
    let now = Utc::now();
    Worker {
        id: id.to_string(),
        experiment_id: experiment_id.to_string(),
        compute_resource_id: compute_resource_id.to_string(),
        status: WorkerStatus::Idle,
        connection_state: ConnectionState::Disconnected,
        current_task_id: None,
        walltime_seconds: 0,
        registered_at: None,
        last_heartbeat: None,
        last_seen_at: None,
        created_at: now,
        updated_at: now,
    }
}

pub fn make_task(id: &str, experiment_id: &str, status: TaskStatus) -> Task {
    let mut task = Task::new(experiment_id, "echo test");
    task.id = id.to_string();
    task.status = status;
    task
}

#[derive(Clone, Default)]
pub struct MockWorkerRepository {
    workers: Arc<Mutex<HashMap<String, Worker>>>,
}

impl MockWorkerRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workers(workers: Vec<Worker>) -> Self {
        let map = workers.into_iter().map(|w| (w.id.clone(), w)).collect();
        Self {
            workers: Arc::new(Mutex::new(map)),
        }
    }

    pub fn insert(&self, worker: Worker) {
        self.workers.lock().unwrap().insert(worker.id.clone(), worker);
    }

    pub fn get(&self, worker_id: &str) -> Option<Worker> {
        self.workers.lock().unwrap().get(worker_id).cloned()
    }

    pub fn all(&self) -> Vec<Worker> {
        self.workers.lock().unwrap().values().cloned().collect()
    }
}

#[async_trait]
impl WorkerRepository for MockWorkerRepository {
    async fn get_by_id(&self, worker_id: &str) -> SchedulerResult<Option<Worker>> {
        Ok(self.workers.lock().unwrap().get(worker_id).cloned())
    }

    async fn mark_registered(&self, worker_id: &str, now: DateTime<Utc>) -> SchedulerResult<()> {
        let mut workers = self.workers.lock().unwrap();
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| SchedulerError::WorkerNotFound {
                id: worker_id.to_string(),
            })?;
        worker.connection_state = ConnectionState::Connected;
        worker.status = WorkerStatus::Idle;
        worker.registered_at = Some(now);
        worker.last_heartbeat = Some(now);
        worker.last_seen_at = Some(now);
        worker.updated_at = now;
        Ok(())
    }

    async fn update_heartbeat(&self, worker_id: &str, now: DateTime<Utc>) -> SchedulerResult<()> {
        let mut workers = self.workers.lock().unwrap();
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| SchedulerError::WorkerNotFound {
                id: worker_id.to_string(),
            })?;
        worker.last_heartbeat = Some(now);
        worker.last_seen_at = Some(now);
        Ok(())
    }

    async fn update_status(&self, worker_id: &str, status: WorkerStatus) -> SchedulerResult<()> {
        let mut workers = self.workers.lock().unwrap();
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| SchedulerError::WorkerNotFound {
                id: worker_id.to_string(),
            })?;
        worker.status = status;
        worker.updated_at = Utc::now();
        Ok(())
    }

    async fn update_connection_state(
        &self,
        worker_id: &str,
        state: ConnectionState,
    ) -> SchedulerResult<()> {
        let mut workers = self.workers.lock().unwrap();
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| SchedulerError::WorkerNotFound {
                id: worker_id.to_string(),
            })?;
        worker.connection_state = state;
        worker.last_seen_at = Some(Utc::now());
        Ok(())
    }

    async fn set_current_task(
        &self,
        worker_id: &str,
        task_id: Option<&str>,
    ) -> SchedulerResult<()> {
        let mut workers = self.workers.lock().unwrap();
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| SchedulerError::WorkerNotFound {
                id: worker_id.to_string(),
            })?;
        worker.current_task_id = task_id.map(|s| s.to_string());
        Ok(())
    }

    async fn mark_all_disconnected(&self) -> SchedulerResult<u64> {
        let mut workers = self.workers.lock().unwrap();
        let mut count = 0;
        for worker in workers.values_mut() {
            if worker.connection_state == ConnectionState::Connected {
                worker.connection_state = ConnectionState::Disconnected;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn get_connected(&self) -> SchedulerResult<Vec<Worker>> {
        Ok(self
            .workers
            .lock()
            .unwrap()
            .values()
            .filter(|w| w.connection_state == ConnectionState::Connected)
            .cloned()
            .collect())
    }
}

#[derive(Clone, Default)]
pub struct MockTaskRepository {
    tasks: Arc<Mutex<HashMap<String, Task>>>,
    leases: Arc<Mutex<Vec<TaskLease>>>,
}

impl MockTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tasks(tasks: Vec<Task>) -> Self {
        let map = tasks.into_iter().map(|t| (t.id.clone(), t)).collect();
        Self {
            tasks: Arc::new(Mutex::new(map)),
            leases: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn insert(&self, task: Task) {
        self.tasks.lock().unwrap().insert(task.id.clone(), task);
    }

    pub fn insert_lease(&self, lease: TaskLease) {
        self.leases.lock().unwrap().push(lease);
    }

    pub fn get(&self, task_id: &str) -> Option<Task> {
        self.tasks.lock().unwrap().get(task_id).cloned()
    }

    pub fn all(&self) -> Vec<Task> {
        self.tasks.lock().unwrap().values().cloned().collect()
    }

    pub fn lease_count(&self) -> usize {
        self.leases.lock().unwrap().len()
    }
}

#[async_trait]
impl TaskRepository for MockTaskRepository {
    async fn get_by_id(&self, task_id: &str) -> SchedulerResult<Option<Task>> {
        Ok(self.tasks.lock().unwrap().get(task_id).cloned())
    }

    async fn get_by_status(&self, status: TaskStatus) -> SchedulerResult<Vec<Task>> {
        Ok(self
            .tasks
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect())
    }

    async fn requeue_assigned_tasks(&self) -> SchedulerResult<u64> {
        let mut tasks = self.tasks.lock().unwrap();
        let mut count = 0;
        for task in tasks.values_mut() {
            let assigned_queued =
                task.status == TaskStatus::Queued && task.worker_id.is_some();
            if task.status.is_assigned_pre_run() || assigned_queued {
                task.status = TaskStatus::Queued;
                task.worker_id = None;
                task.compute_resource_id = None;
                task.updated_at = Utc::now();
                count += 1;
            }
        }
        Ok(count)
    }

    async fn release_expired_leases(&self, now: DateTime<Utc>) -> SchedulerResult<u64> {
        let mut leases = self.leases.lock().unwrap();
        let before = leases.len();
        leases.retain(|lease| !lease.is_expired(now));
        Ok((before - leases.len()) as u64)
    }
}

#[derive(Clone, Default)]
pub struct MockStagingRepository {
    operations: Arc<Mutex<HashMap<String, StagingOperation>>>,
}

impl MockStagingRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_operations(ops: Vec<StagingOperation>) -> Self {
        let map = ops.into_iter().map(|o| (o.id.clone(), o)).collect();
        Self {
            operations: Arc::new(Mutex::new(map)),
        }
    }

    pub fn get(&self, staging_id: &str) -> Option<StagingOperation> {
        self.operations.lock().unwrap().get(staging_id).cloned()
    }
}

#[async_trait]
impl StagingOperationRepository for MockStagingRepository {
    async fn get_by_id(&self, staging_id: &str) -> SchedulerResult<Option<StagingOperation>> {
        Ok(self.operations.lock().unwrap().get(staging_id).cloned())
    }

    async fn get_by_task_id(&self, task_id: &str) -> SchedulerResult<Vec<StagingOperation>> {
        Ok(self
            .operations
            .lock()
            .unwrap()
            .values()
            .filter(|o| o.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn list_incomplete(&self) -> SchedulerResult<Vec<StagingOperation>> {
        Ok(self
            .operations
            .lock()
            .unwrap()
            .values()
            .filter(|o| o.is_incomplete())
            .cloned()
            .collect())
    }

    async fn mark_running(&self, staging_id: &str) -> SchedulerResult<()> {
        let mut ops = self.operations.lock().unwrap();
        let op = ops
            .get_mut(staging_id)
            .ok_or_else(|| SchedulerError::StagingOperationNotFound {
                id: staging_id.to_string(),
            })?;
        op.status = StagingStatus::Running;
        op.started_at.get_or_insert_with(Utc::now);
        op.updated_at = Utc::now();
        Ok(())
    }

    async fn update_progress(
        &self,
        staging_id: &str,
        completed_files: i32,
        failed_files: i32,
    ) -> SchedulerResult<()> {
        let mut ops = self.operations.lock().unwrap();
        let op = ops
            .get_mut(staging_id)
            .ok_or_else(|| SchedulerError::StagingOperationNotFound {
                id: staging_id.to_string(),
            })?;
        op.completed_files = completed_files;
        op.failed_files = failed_files;
        op.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_completed(&self, staging_id: &str) -> SchedulerResult<()> {
        let mut ops = self.operations.lock().unwrap();
        let op = ops
            .get_mut(staging_id)
            .ok_or_else(|| SchedulerError::StagingOperationNotFound {
                id: staging_id.to_string(),
            })?;
        op.status = StagingStatus::Completed;
        op.completed_at = Some(Utc::now());
        op.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_failed(&self, staging_id: &str, error: &str) -> SchedulerResult<()> {
        let mut ops = self.operations.lock().unwrap();
        let op = ops
            .get_mut(staging_id)
            .ok_or_else(|| SchedulerError::StagingOperationNotFound {
                id: staging_id.to_string(),
            })?;
        op.status = StagingStatus::Failed;
        op.error = Some(error.to_string());
        op.updated_at = Utc::now();
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MockSchedulerStateRepository {
    state: Arc<Mutex<Option<SchedulerState>>>,
}

impl MockSchedulerStateRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: SchedulerState) -> Self {
        Self {
            state: Arc::new(Mutex::new(Some(state))),
        }
    }

    pub fn current(&self) -> Option<SchedulerState> {
        self.state.lock().unwrap().clone()
    }
}

#[async_trait]
impl SchedulerStateRepository for MockSchedulerStateRepository {
    async fn get(&self) -> SchedulerResult<Option<SchedulerState>> {
        Ok(self.state.lock().unwrap().clone())
    }

    async fn upsert_starting(
        &self,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        let mut state = self.state.lock().unwrap();
        *state = Some(SchedulerState {
            id: SCHEDULER_STATE_ID.to_string(),
            instance_id: instance_id.to_string(),
            status: SchedulerLifecycle::Starting,
            clean_shutdown: false,
            startup_time: now,
            shutdown_time: None,
            last_heartbeat: now,
        });
        Ok(())
    }

    async fn mark_running(&self, instance_id: &str, now: DateTime<Utc>) -> SchedulerResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(s) = state.as_mut() {
            if s.instance_id == instance_id {
                s.status = SchedulerLifecycle::Running;
                s.last_heartbeat = now;
            }
        }
        Ok(())
    }

    async fn mark_shutting_down(
        &self,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(s) = state.as_mut() {
            if s.instance_id == instance_id {
                s.status = SchedulerLifecycle::ShuttingDown;
                s.shutdown_time = Some(now);
                s.last_heartbeat = now;
            }
        }
        Ok(())
    }

    async fn mark_stopped(
        &self,
        instance_id: &str,
        clean: bool,
        now: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(s) = state.as_mut() {
            if s.instance_id == instance_id {
                s.status = SchedulerLifecycle::Stopped;
                s.clean_shutdown = clean;
                s.shutdown_time = Some(now);
                s.last_heartbeat = now;
            }
        }
        Ok(())
    }

    async fn touch_heartbeat(
        &self,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(s) = state.as_mut() {
            if s.instance_id == instance_id {
                s.last_heartbeat = now;
            }
        }
        Ok(())
    }
}

/// Scripted task scheduler: hands out queued tasks in insertion order and
/// records fail/complete calls.
#[derive(Clone, Default)]
pub struct MockTaskScheduler {
    queue: Arc<Mutex<Vec<Task>>>,
    pub failed: Arc<Mutex<Vec<(String, String, String)>>>,
    pub completed: Arc<Mutex<Vec<(String, String)>>>,
    fail_with_error: Arc<Mutex<bool>>,
}

impl MockTaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_queue(tasks: Vec<Task>) -> Self {
        Self {
            queue: Arc::new(Mutex::new(tasks)),
            ..Self::default()
        }
    }

    /// Make assign_task return an error on every call.
    pub fn fail_assignments(&self) {
        *self.fail_with_error.lock().unwrap() = true;
    }

    pub fn failed_calls(&self) -> Vec<(String, String, String)> {
        self.failed.lock().unwrap().clone()
    }

    pub fn completed_calls(&self) -> Vec<(String, String)> {
        self.completed.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskScheduler for MockTaskScheduler {
    async fn assign_task(&self, worker_id: &str) -> SchedulerResult<Option<Task>> {
        if *self.fail_with_error.lock().unwrap() {
            return Err(SchedulerError::Internal("scheduler unavailable".to_string()));
        }
        let mut queue = self.queue.lock().unwrap();
        if queue.is_empty() {
            return Ok(None);
        }
        let mut task = queue.remove(0);
        task.worker_id = Some(worker_id.to_string());
        task.status = TaskStatus::DataStaging;
        Ok(Some(task))
    }

    async fn fail_task(
        &self,
        task_id: &str,
        worker_id: &str,
        reason: &str,
    ) -> SchedulerResult<()> {
        self.failed.lock().unwrap().push((
            task_id.to_string(),
            worker_id.to_string(),
            reason.to_string(),
        ));
        Ok(())
    }

    async fn complete_task(
        &self,
        task_id: &str,
        worker_id: &str,
        _result: Option<serde_json::Value>,
    ) -> SchedulerResult<()> {
        self.completed
            .lock()
            .unwrap()
            .push((task_id.to_string(), worker_id.to_string()));
        Ok(())
    }
}

/// Records every transition; optionally mirrors them into the mock repos so
/// protocol tests observe consistent state.
#[derive(Clone, Default)]
pub struct MockStateManager {
    pub task_transitions: Arc<Mutex<Vec<(String, TaskStatus, TaskStatus)>>>,
    pub worker_transitions: Arc<Mutex<Vec<(String, WorkerStatus, WorkerStatus)>>>,
    task_repo: Arc<Mutex<Option<MockTaskRepository>>>,
    worker_repo: Arc<Mutex<Option<MockWorkerRepository>>>,
}

impl MockStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mirroring(task_repo: MockTaskRepository, worker_repo: MockWorkerRepository) -> Self {
        Self {
            task_repo: Arc::new(Mutex::new(Some(task_repo))),
            worker_repo: Arc::new(Mutex::new(Some(worker_repo))),
            ..Self::default()
        }
    }

    pub fn task_transition_count(&self) -> usize {
        self.task_transitions.lock().unwrap().len()
    }
}

#[async_trait]
impl StateManager for MockStateManager {
    async fn transition_task_state(
        &self,
        task_id: &str,
        from: TaskStatus,
        to: TaskStatus,
        _metadata: serde_json::Value,
    ) -> SchedulerResult<()> {
        self.task_transitions
            .lock()
            .unwrap()
            .push((task_id.to_string(), from, to));

        let repo = self.task_repo.lock().unwrap().clone();
        if let Some(repo) = repo {
            let mut tasks = repo.tasks.lock().unwrap();
            let task = tasks
                .get_mut(task_id)
                .ok_or_else(|| SchedulerError::TaskNotFound {
                    id: task_id.to_string(),
                })?;
            if task.status != from {
                return Err(SchedulerError::InvalidStateTransition {
                    from: task.status.to_string(),
                    to: to.to_string(),
                });
            }
            task.status = to;
            task.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn transition_worker_state(
        &self,
        worker_id: &str,
        from: WorkerStatus,
        to: WorkerStatus,
        _metadata: serde_json::Value,
    ) -> SchedulerResult<()> {
        self.worker_transitions
            .lock()
            .unwrap()
            .push((worker_id.to_string(), from, to));

        let repo = self.worker_repo.lock().unwrap().clone();
        if let Some(repo) = repo {
            let mut workers = repo.workers.lock().unwrap();
            if let Some(worker) = workers.get_mut(worker_id) {
                worker.status = to;
            }
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MockDataMover {
    urls: Arc<Mutex<Vec<SignedUploadUrl>>>,
    pub staged: Arc<Mutex<Vec<(String, String)>>>,
}

impl MockDataMover {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_urls(urls: Vec<SignedUploadUrl>) -> Self {
        Self {
            urls: Arc::new(Mutex::new(urls)),
            staged: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn staged_calls(&self) -> Vec<(String, String)> {
        self.staged.lock().unwrap().clone()
    }
}

#[async_trait]
impl DataMover for MockDataMover {
    async fn generate_upload_urls(&self, _task_id: &str) -> SchedulerResult<Vec<SignedUploadUrl>> {
        Ok(self.urls.lock().unwrap().clone())
    }

    async fn stage_task_output(&self, task_id: &str, worker_id: &str) -> SchedulerResult<()> {
        self.staged
            .lock()
            .unwrap()
            .push((task_id.to_string(), worker_id.to_string()));
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MockEventPublisher {
    pub published: Arc<Mutex<Vec<EventQueueEntry>>>,
}

impl MockEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published_types(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.event_type.clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.published.lock().unwrap().len()
    }
}

#[async_trait]
impl EventPublisher for MockEventPublisher {
    async fn publish(&self, entry: EventQueueEntry) -> SchedulerResult<()> {
        self.published.lock().unwrap().push(entry);
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MockEventReplay {
    pending: Arc<Mutex<usize>>,
    pub calls: Arc<Mutex<usize>>,
}

impl MockEventReplay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pending(count: usize) -> Self {
        Self {
            pending: Arc::new(Mutex::new(count)),
            calls: Arc::new(Mutex::new(0)),
        }
    }

    pub fn call_count(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl EventReplay for MockEventReplay {
    async fn resume_pending(&self) -> SchedulerResult<usize> {
        *self.calls.lock().unwrap() += 1;
        // 重放把PENDING清空,再次调用返回0,与幂等语义一致
        let mut pending = self.pending.lock().unwrap();
        let count = *pending;
        *pending = 0;
        Ok(count)
    }
}
