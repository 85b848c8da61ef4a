use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::debug;

use gridsched_core::models::{FileMetadata, Task, TaskStatus};
use gridsched_core::traits::TaskRepository;
use gridsched_core::{SchedulerError, SchedulerResult};

/// PostgreSQL 任务仓储实现
pub struct PostgresTaskRepository {
    pool: PgPool,
}

const TASK_COLUMNS: &str = "id, experiment_id, status, command, execution_script, input_files, \
     output_files, worker_id, compute_resource_id, retry_count, max_retries, error, metadata, \
     created_at, updated_at, started_at, completed_at";

impl PostgresTaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn decode_files(value: serde_json::Value) -> SchedulerResult<Vec<FileMetadata>> {
        if value.is_null() {
            return Ok(Vec::new());
        }
        serde_json::from_value(value).map_err(|e| SchedulerError::Serialization(e.to_string()))
    }

    /// 将数据库行转换为Task模型
    fn row_to_task(row: &sqlx::postgres::PgRow) -> SchedulerResult<Task> {
        let input_files: serde_json::Value = row.try_get("input_files")?;
        let output_files: serde_json::Value = row.try_get("output_files")?;

        Ok(Task {
            id: row.try_get("id")?,
            experiment_id: row.try_get("experiment_id")?,
            status: row.try_get("status")?,
            command: row.try_get("command")?,
            execution_script: row.try_get("execution_script")?,
            input_files: Self::decode_files(input_files)?,
            output_files: Self::decode_files(output_files)?,
            worker_id: row.try_get("worker_id")?,
            compute_resource_id: row.try_get("compute_resource_id")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            error: row.try_get("error")?,
            metadata: row.try_get("metadata")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

#[async_trait]
impl TaskRepository for PostgresTaskRepository {
    async fn get_by_id(&self, task_id: &str) -> SchedulerResult<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn get_by_status(&self, status: TaskStatus) -> SchedulerResult<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = $1 ORDER BY created_at ASC"
        ))
        .bind(status)
        .fetch_all(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        rows.iter().map(Self::row_to_task).collect()
    }

    async fn requeue_assigned_tasks(&self) -> SchedulerResult<u64> {
        // 已分配但尚未RUNNING的任务:暂存/环境准备中的,
        // 以及已绑定Worker却还停留在QUEUED的
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'QUEUED', worker_id = NULL, compute_resource_id = NULL,
                updated_at = NOW()
            WHERE status IN ('DATA_STAGING', 'ENV_SETUP')
               OR (status = 'QUEUED' AND worker_id IS NOT NULL)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        debug!("任务重新入队: {} 行", result.rows_affected());
        Ok(result.rows_affected())
    }

    async fn release_expired_leases(&self, now: DateTime<Utc>) -> SchedulerResult<u64> {
        let result = sqlx::query("DELETE FROM task_leases WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        debug!("过期租约已删除: {} 行", result.rows_affected());
        Ok(result.rows_affected())
    }
}
