use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::debug;

use gridsched_core::models::StagingOperation;
use gridsched_core::traits::StagingOperationRepository;
use gridsched_core::{SchedulerError, SchedulerResult};

/// PostgreSQL 数据暂存操作仓储实现
pub struct PostgresStagingRepository {
    pool: PgPool,
}

const STAGING_COLUMNS: &str = "id, task_id, worker_id, status, total_files, completed_files, \
     failed_files, error, started_at, completed_at, created_at, updated_at";

impl PostgresStagingRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_operation(row: &sqlx::postgres::PgRow) -> SchedulerResult<StagingOperation> {
        Ok(StagingOperation {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            worker_id: row.try_get("worker_id")?,
            status: row.try_get("status")?,
            total_files: row.try_get("total_files")?,
            completed_files: row.try_get("completed_files")?,
            failed_files: row.try_get("failed_files")?,
            error: row.try_get("error")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn not_found(staging_id: &str) -> SchedulerError {
        SchedulerError::StagingOperationNotFound {
            id: staging_id.to_string(),
        }
    }
}

#[async_trait]
impl StagingOperationRepository for PostgresStagingRepository {
    async fn get_by_id(&self, staging_id: &str) -> SchedulerResult<Option<StagingOperation>> {
        let row = sqlx::query(&format!(
            "SELECT {STAGING_COLUMNS} FROM staging_operations WHERE id = $1"
        ))
        .bind(staging_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        row.as_ref().map(Self::row_to_operation).transpose()
    }

    async fn get_by_task_id(&self, task_id: &str) -> SchedulerResult<Vec<StagingOperation>> {
        let rows = sqlx::query(&format!(
            "SELECT {STAGING_COLUMNS} FROM staging_operations WHERE task_id = $1 ORDER BY created_at ASC"
        ))
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        rows.iter().map(Self::row_to_operation).collect()
    }

    async fn list_incomplete(&self) -> SchedulerResult<Vec<StagingOperation>> {
        let rows = sqlx::query(&format!(
            "SELECT {STAGING_COLUMNS} FROM staging_operations WHERE status IN ('PENDING', 'RUNNING') ORDER BY created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        rows.iter().map(Self::row_to_operation).collect()
    }

    async fn mark_running(&self, staging_id: &str) -> SchedulerResult<()> {
        // completed_files保持原值,重启后从断点继续
        let result = sqlx::query(
            r#"
            UPDATE staging_operations
            SET status = 'RUNNING', started_at = COALESCE(started_at, NOW()), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(staging_id)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        if result.rows_affected() == 0 {
            return Err(Self::not_found(staging_id));
        }

        debug!("暂存操作已置为RUNNING: {}", staging_id);
        Ok(())
    }

    async fn update_progress(
        &self,
        staging_id: &str,
        completed_files: i32,
        failed_files: i32,
    ) -> SchedulerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE staging_operations
            SET completed_files = $2, failed_files = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(staging_id)
        .bind(completed_files)
        .bind(failed_files)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        if result.rows_affected() == 0 {
            return Err(Self::not_found(staging_id));
        }
        Ok(())
    }

    async fn mark_completed(&self, staging_id: &str) -> SchedulerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE staging_operations
            SET status = 'COMPLETED', completed_at = NOW(), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(staging_id)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        if result.rows_affected() == 0 {
            return Err(Self::not_found(staging_id));
        }
        Ok(())
    }

    async fn mark_failed(&self, staging_id: &str, error: &str) -> SchedulerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE staging_operations
            SET status = 'FAILED', error = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(staging_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        if result.rows_affected() == 0 {
            return Err(Self::not_found(staging_id));
        }
        Ok(())
    }
}
