use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::staging::{SignedUploadUrl, StagingStatus};
use super::task::{TaskAssignment, TaskStatus};
use super::worker::{WorkerCapabilities, WorkerStatus};

/// Worker在心跳中自报的状态
///
/// 比调度器侧的两态模型更细,入库前折叠:
/// STAGING归入BUSY,ERROR归入IDLE(出错的Worker不持有任务)。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReportedWorkerStatus {
    #[serde(rename = "IDLE")]
    Idle,
    #[serde(rename = "BUSY")]
    Busy,
    #[serde(rename = "STAGING")]
    Staging,
    #[serde(rename = "ERROR")]
    Error,
}

impl ReportedWorkerStatus {
    pub fn to_worker_status(self) -> WorkerStatus {
        match self {
            ReportedWorkerStatus::Idle | ReportedWorkerStatus::Error => WorkerStatus::Idle,
            ReportedWorkerStatus::Busy | ReportedWorkerStatus::Staging => WorkerStatus::Busy,
        }
    }
}

/// Worker到调度器的入站消息,封闭集合
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerMessage {
    Heartbeat(Heartbeat),
    TaskRequest(TaskRequest),
    TaskStatusUpdate(TaskStatusUpdate),
    TaskOutput(TaskOutput),
    WorkerMetrics(WorkerMetricsReport),
    StagingProgress(StagingProgress),
}

impl WorkerMessage {
    /// 消息所属的Worker ID
    pub fn worker_id(&self) -> &str {
        match self {
            WorkerMessage::Heartbeat(m) => &m.worker_id,
            WorkerMessage::TaskRequest(m) => &m.worker_id,
            WorkerMessage::TaskStatusUpdate(m) => &m.worker_id,
            WorkerMessage::TaskOutput(m) => &m.worker_id,
            WorkerMessage::WorkerMetrics(m) => &m.worker_id,
            WorkerMessage::StagingProgress(m) => &m.worker_id,
        }
    }
}

/// 心跳,仅承载存活信号和状态,从不触发任务分配
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub worker_id: String,
    pub status: ReportedWorkerStatus,
    pub current_task_id: Option<String>,
    pub capabilities: Option<WorkerCapabilities>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

/// 空闲Worker主动拉取任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub worker_id: String,
    pub experiment_id: String,
}

/// 任务状态上报
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusUpdate {
    pub task_id: String,
    pub worker_id: String,
    pub status: TaskStatus,
    pub message: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OutputKind {
    #[serde(rename = "STDOUT")]
    Stdout,
    #[serde(rename = "STDERR")]
    Stderr,
    #[serde(rename = "LOG")]
    Log,
}

/// 任务输出片段,仅透传记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutput {
    pub task_id: String,
    pub worker_id: String,
    pub kind: OutputKind,
    pub data: String,
}

/// Worker资源占用上报
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerMetricsReport {
    pub worker_id: String,
    pub cpu_usage_percent: f64,
    pub memory_usage_percent: f64,
    pub timestamp: DateTime<Utc>,
}

/// 数据暂存进度上报
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingProgress {
    pub staging_id: String,
    pub task_id: String,
    pub worker_id: String,
    pub status: StagingStatus,
    pub completed_files: i32,
    pub failed_files: i32,
    pub total_files: i32,
    pub error: Option<String>,
}

/// 调度器到Worker的出站消息,封闭集合
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    TaskAssignment(TaskAssignment),
    TaskCancellation(TaskCancellation),
    WorkerShutdown(WorkerShutdownDirective),
    OutputUploadRequest(OutputUploadRequest),
}

/// 任务取消指令
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCancellation {
    pub task_id: String,
    pub reason: String,
    pub force: bool,
    pub grace_period_seconds: u64,
}

/// Worker自毁指令,队列为空时下发
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerShutdownDirective {
    pub worker_id: String,
    pub reason: String,
    pub graceful: bool,
    pub timeout_seconds: u64,
}

/// 任务失败后请求Worker回传诊断输出
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputUploadRequest {
    pub task_id: String,
    pub upload_urls: Vec<SignedUploadUrl>,
}
