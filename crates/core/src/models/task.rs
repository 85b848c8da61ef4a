use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 任务生命周期状态
///
/// CREATED -> QUEUED -> DATA_STAGING -> ENV_SETUP -> RUNNING
/// -> OUTPUT_STAGING -> COMPLETED,任意非终态可进入 FAILED / CANCELED。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    #[serde(rename = "CREATED")]
    Created,
    #[serde(rename = "QUEUED")]
    Queued,
    #[serde(rename = "DATA_STAGING")]
    DataStaging,
    #[serde(rename = "ENV_SETUP")]
    EnvSetup,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "OUTPUT_STAGING")]
    OutputStaging,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "CANCELED")]
    Canceled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Created => "CREATED",
            TaskStatus::Queued => "QUEUED",
            TaskStatus::DataStaging => "DATA_STAGING",
            TaskStatus::EnvSetup => "ENV_SETUP",
            TaskStatus::Running => "RUNNING",
            TaskStatus::OutputStaging => "OUTPUT_STAGING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Canceled => "CANCELED",
        }
    }

    /// 终态任务不再被分配或改写
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Canceled
        )
    }

    /// 已分配给Worker但尚未开始执行的中间状态
    pub fn is_assigned_pre_run(&self) -> bool {
        matches!(self, TaskStatus::DataStaging | TaskStatus::EnvSetup)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl sqlx::Type<sqlx::Postgres> for TaskStatus {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("VARCHAR")
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for TaskStatus {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        match s {
            "CREATED" => Ok(TaskStatus::Created),
            "QUEUED" => Ok(TaskStatus::Queued),
            "DATA_STAGING" => Ok(TaskStatus::DataStaging),
            "ENV_SETUP" => Ok(TaskStatus::EnvSetup),
            "RUNNING" => Ok(TaskStatus::Running),
            "OUTPUT_STAGING" => Ok(TaskStatus::OutputStaging),
            "COMPLETED" => Ok(TaskStatus::Completed),
            "FAILED" => Ok(TaskStatus::Failed),
            "CANCELED" => Ok(TaskStatus::Canceled),
            _ => Err(format!("Invalid task status: {s}").into()),
        }
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for TaskStatus {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Postgres>>::encode(self.as_str(), buf)
    }
}

/// 任务输入/输出文件元数据
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileMetadata {
    pub path: String,
    pub size_bytes: i64,
    pub checksum: Option<String>,
}

/// 任务实体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub experiment_id: String,
    pub status: TaskStatus,
    pub command: String,
    pub execution_script: Option<String>,
    pub input_files: Vec<FileMetadata>,
    pub output_files: Vec<FileMetadata>,
    /// 持有该任务的Worker,仅在已分配状态下非空
    pub worker_id: Option<String>,
    pub compute_resource_id: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub error: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(experiment_id: impl Into<String>, command: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            experiment_id: experiment_id.into(),
            status: TaskStatus::Created,
            command: command.into(),
            execution_script: None,
            input_files: Vec::new(),
            output_files: Vec::new(),
            worker_id: None,
            compute_resource_id: None,
            retry_count: 0,
            max_retries: 3,
            error: None,
            metadata: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_owned_by(&self, worker_id: &str) -> bool {
        self.worker_id.as_deref() == Some(worker_id)
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// 任务租约,分配时写入,恢复流程删除过期行
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLease {
    pub id: String,
    pub task_id: String,
    pub worker_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TaskLease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// 下发给Worker的任务分配载荷
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task_id: String,
    pub experiment_id: String,
    pub command: String,
    pub execution_script: Option<String>,
    pub input_files: Vec<FileMetadata>,
    pub output_files: Vec<FileMetadata>,
    pub environment: HashMap<String, String>,
    pub working_directory: String,
    pub timeout_seconds: u64,
}
