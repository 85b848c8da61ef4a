use async_trait::async_trait;

use crate::errors::SchedulerResult;
use crate::models::{EventQueueEntry, SignedUploadUrl, Task, TaskStatus, WorkerStatus};

/// 任务调度策略接口
///
/// 协调器只负责协议,挑选哪个任务给哪个Worker属于策略,
/// 由外部实现注入。
#[async_trait]
pub trait TaskScheduler: Send + Sync {
    /// 为指定Worker挑选并锁定一个任务,无任务可派时返回None
    async fn assign_task(&self, worker_id: &str) -> SchedulerResult<Option<Task>>;

    /// 任务失败处理,内部决定重试或终结
    async fn fail_task(&self, task_id: &str, worker_id: &str, reason: &str)
        -> SchedulerResult<()>;

    /// 任务成功完成后的收尾,result为Worker上报的结果元数据
    async fn complete_task(
        &self,
        task_id: &str,
        worker_id: &str,
        result: Option<serde_json::Value>,
    ) -> SchedulerResult<()>;
}

/// 状态机接口,所有任务/Worker状态变更必须经过这里
#[async_trait]
pub trait StateManager: Send + Sync {
    /// 任务状态转换,from不匹配时返回InvalidStateTransition
    async fn transition_task_state(
        &self,
        task_id: &str,
        from: TaskStatus,
        to: TaskStatus,
        metadata: serde_json::Value,
    ) -> SchedulerResult<()>;

    /// Worker调度状态转换
    async fn transition_worker_state(
        &self,
        worker_id: &str,
        from: WorkerStatus,
        to: WorkerStatus,
        metadata: serde_json::Value,
    ) -> SchedulerResult<()>;
}

/// 数据搬运接口,产出上传URL并归档任务输出
#[async_trait]
pub trait DataMover: Send + Sync {
    /// 为任务的诊断输出生成预签名上传URL
    async fn generate_upload_urls(&self, task_id: &str) -> SchedulerResult<Vec<SignedUploadUrl>>;

    /// 将任务输出从Worker侧归档到中央存储
    async fn stage_task_output(&self, task_id: &str, worker_id: &str) -> SchedulerResult<()>;
}

/// 事件发布接口,先落库再投递
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, entry: EventQueueEntry) -> SchedulerResult<()>;
}

/// 事件重放接口,恢复流程把库中PENDING事件重新入队
#[async_trait]
pub trait EventReplay: Send + Sync {
    /// 返回重新入队的事件数
    async fn resume_pending(&self) -> SchedulerResult<usize>;
}
