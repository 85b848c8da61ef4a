use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::SchedulerResult;
use crate::models::{
    ConnectionState, EventQueueEntry, SchedulerState, StagingOperation, Task, TaskStatus, Worker,
    WorkerStatus,
};

/// Worker仓储接口
///
/// Worker行由实验提交流程预先创建,这里只负责注册校验之后的
/// 状态维护,不提供创建接口。
#[async_trait]
pub trait WorkerRepository: Send + Sync {
    /// 根据ID查询Worker
    async fn get_by_id(&self, worker_id: &str) -> SchedulerResult<Option<Worker>>;

    /// 注册成功后落库:置为CONNECTED并记录注册时间
    async fn mark_registered(&self, worker_id: &str, now: DateTime<Utc>) -> SchedulerResult<()>;

    /// 刷新持久化的心跳时间
    async fn update_heartbeat(&self, worker_id: &str, now: DateTime<Utc>) -> SchedulerResult<()>;

    /// 更新调度状态
    async fn update_status(&self, worker_id: &str, status: WorkerStatus) -> SchedulerResult<()>;

    /// 更新连接状态
    async fn update_connection_state(
        &self,
        worker_id: &str,
        state: ConnectionState,
    ) -> SchedulerResult<()>;

    /// 设置或清除当前持有的任务
    async fn set_current_task(
        &self,
        worker_id: &str,
        task_id: Option<&str>,
    ) -> SchedulerResult<()>;

    /// 将所有Worker标记为DISCONNECTED,返回影响行数
    ///
    /// 崩溃恢复用:重启后不存在任何残留的活跃连接。
    async fn mark_all_disconnected(&self) -> SchedulerResult<u64>;

    /// 查询所有CONNECTED状态的Worker
    async fn get_connected(&self) -> SchedulerResult<Vec<Worker>>;
}

/// 任务仓储接口
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn get_by_id(&self, task_id: &str) -> SchedulerResult<Option<Task>>;

    async fn get_by_status(&self, status: TaskStatus) -> SchedulerResult<Vec<Task>>;

    /// 将已分配但未运行的任务退回队列,清除Worker关联,返回影响行数
    async fn requeue_assigned_tasks(&self) -> SchedulerResult<u64>;

    /// 释放已过期的任务租约,返回影响行数
    async fn release_expired_leases(&self, now: DateTime<Utc>) -> SchedulerResult<u64>;
}

/// 数据暂存操作仓储接口
#[async_trait]
pub trait StagingOperationRepository: Send + Sync {
    async fn get_by_id(&self, staging_id: &str) -> SchedulerResult<Option<StagingOperation>>;

    async fn get_by_task_id(&self, task_id: &str) -> SchedulerResult<Vec<StagingOperation>>;

    /// 查询所有未完成(PENDING/RUNNING)的暂存操作
    async fn list_incomplete(&self) -> SchedulerResult<Vec<StagingOperation>>;

    /// 置为RUNNING,保留completed_files以支持断点续传
    async fn mark_running(&self, staging_id: &str) -> SchedulerResult<()>;

    async fn update_progress(
        &self,
        staging_id: &str,
        completed_files: i32,
        failed_files: i32,
    ) -> SchedulerResult<()>;

    async fn mark_completed(&self, staging_id: &str) -> SchedulerResult<()>;

    async fn mark_failed(&self, staging_id: &str, error: &str) -> SchedulerResult<()>;
}

/// 调度器状态仓储接口,操作scheduler_state单行
#[async_trait]
pub trait SchedulerStateRepository: Send + Sync {
    async fn get(&self) -> SchedulerResult<Option<SchedulerState>>;

    /// 启动时写入STARTING状态,clean_shutdown置false
    async fn upsert_starting(
        &self,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<()>;

    async fn mark_running(&self, instance_id: &str, now: DateTime<Utc>) -> SchedulerResult<()>;

    async fn mark_shutting_down(
        &self,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<()>;

    /// 关闭完成,clean标记本次是否走完了优雅关闭
    async fn mark_stopped(
        &self,
        instance_id: &str,
        clean: bool,
        now: DateTime<Utc>,
    ) -> SchedulerResult<()>;

    /// 刷新存活心跳
    async fn touch_heartbeat(&self, instance_id: &str, now: DateTime<Utc>) -> SchedulerResult<()>;
}

/// 持久化事件队列仓储接口
#[async_trait]
pub trait EventQueueRepository: Send + Sync {
    async fn insert(&self, entry: &EventQueueEntry) -> SchedulerResult<()>;

    /// 按创建时间取一批PENDING事件
    async fn fetch_pending(&self, limit: i64) -> SchedulerResult<Vec<EventQueueEntry>>;

    async fn mark_processing(&self, event_id: &str) -> SchedulerResult<()>;

    async fn mark_completed(&self, event_id: &str) -> SchedulerResult<()>;

    async fn mark_failed(&self, event_id: &str) -> SchedulerResult<()>;

    /// 处理失败后退回PENDING并记录重试次数
    async fn requeue(&self, event_id: &str, retry_count: i32) -> SchedulerResult<()>;
}
