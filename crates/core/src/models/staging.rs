use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 数据暂存操作状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StagingStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
}

impl StagingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StagingStatus::Pending => "PENDING",
            StagingStatus::Running => "RUNNING",
            StagingStatus::Completed => "COMPLETED",
            StagingStatus::Failed => "FAILED",
        }
    }
}

impl sqlx::Type<sqlx::Postgres> for StagingStatus {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("VARCHAR")
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for StagingStatus {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        match s {
            "PENDING" => Ok(StagingStatus::Pending),
            "RUNNING" => Ok(StagingStatus::Running),
            "COMPLETED" => Ok(StagingStatus::Completed),
            "FAILED" => Ok(StagingStatus::Failed),
            _ => Err(format!("Invalid staging status: {s}").into()),
        }
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for StagingStatus {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Postgres>>::encode(self.as_str(), buf)
    }
}

/// 数据暂存操作,按文件记录进度,崩溃后可从completed_files续传
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingOperation {
    pub id: String,
    pub task_id: String,
    pub worker_id: Option<String>,
    pub status: StagingStatus,
    pub total_files: i32,
    pub completed_files: i32,
    pub failed_files: i32,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StagingOperation {
    pub fn is_incomplete(&self) -> bool {
        matches!(self.status, StagingStatus::Pending | StagingStatus::Running)
    }

    pub fn remaining_files(&self) -> i32 {
        (self.total_files - self.completed_files - self.failed_files).max(0)
    }
}

/// 预签名上传URL,任务失败时下发给Worker用于回收诊断输出
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedUploadUrl {
    pub local_path: String,
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staging_incomplete() {
        let now = Utc::now();
        let mut op = StagingOperation {
            id: "stg-1".to_string(),
            task_id: "task-1".to_string(),
            worker_id: Some("worker-1".to_string()),
            status: StagingStatus::Running,
            total_files: 10,
            completed_files: 4,
            failed_files: 1,
            error: None,
            started_at: Some(now),
            completed_at: None,
            created_at: now,
            updated_at: now,
        };

        assert!(op.is_incomplete());
        assert_eq!(op.remaining_files(), 5);

        op.status = StagingStatus::Completed;
        assert!(!op.is_incomplete());
    }
}
