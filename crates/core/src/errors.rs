use thiserror::Error;

/// 调度器错误类型定义
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),

    #[error("任务未找到: {id}")]
    TaskNotFound { id: String },

    #[error("Worker未找到: {id}")]
    WorkerNotFound { id: String },

    #[error("暂存操作未找到: {id}")]
    StagingOperationNotFound { id: String },

    #[error("Worker注册信息不匹配: {0}")]
    RegistrationMismatch(String),

    #[error("Worker {worker_id} 无权操作任务 {task_id}")]
    NotTaskOwner { worker_id: String, task_id: String },

    #[error("无效的状态转换: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("连接通道已关闭: {0}")]
    ChannelClosed(String),

    #[error("事件队列错误: {0}")]
    EventQueue(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("操作超时: {0}")]
    Timeout(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 统一的Result类型
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
