use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::debug;

use gridsched_core::models::{ConnectionState, Worker, WorkerStatus};
use gridsched_core::traits::WorkerRepository;
use gridsched_core::{SchedulerError, SchedulerResult};

/// PostgreSQL Worker仓储实现
pub struct PostgresWorkerRepository {
    pool: PgPool,
}

const WORKER_COLUMNS: &str = "id, experiment_id, compute_resource_id, status, connection_state, \
     current_task_id, walltime_seconds, registered_at, last_heartbeat, last_seen_at, \
     created_at, updated_at";

impl PostgresWorkerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 将数据库行转换为Worker模型
    fn row_to_worker(row: &sqlx::postgres::PgRow) -> SchedulerResult<Worker> {
        Ok(Worker {
            id: row.try_get("id")?,
            experiment_id: row.try_get("experiment_id")?,
            compute_resource_id: row.try_get("compute_resource_id")?,
            status: row.try_get("status")?,
            connection_state: row.try_get("connection_state")?,
            current_task_id: row.try_get("current_task_id")?,
            walltime_seconds: row.try_get("walltime_seconds")?,
            registered_at: row.try_get("registered_at")?,
            last_heartbeat: row.try_get("last_heartbeat")?,
            last_seen_at: row.try_get("last_seen_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn not_found(worker_id: &str) -> SchedulerError {
        SchedulerError::WorkerNotFound {
            id: worker_id.to_string(),
        }
    }
}

#[async_trait]
impl WorkerRepository for PostgresWorkerRepository {
    async fn get_by_id(&self, worker_id: &str) -> SchedulerResult<Option<Worker>> {
        let row = sqlx::query(&format!(
            "SELECT {WORKER_COLUMNS} FROM workers WHERE id = $1"
        ))
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        row.as_ref().map(Self::row_to_worker).transpose()
    }

    async fn mark_registered(&self, worker_id: &str, now: DateTime<Utc>) -> SchedulerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE workers
            SET connection_state = 'CONNECTED', status = 'IDLE',
                registered_at = $2, last_heartbeat = $2, last_seen_at = $2, updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(worker_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        if result.rows_affected() == 0 {
            return Err(Self::not_found(worker_id));
        }

        debug!("Worker注册已落库: {}", worker_id);
        Ok(())
    }

    async fn update_heartbeat(&self, worker_id: &str, now: DateTime<Utc>) -> SchedulerResult<()> {
        let result = sqlx::query(
            "UPDATE workers SET last_heartbeat = $2, last_seen_at = $2 WHERE id = $1",
        )
        .bind(worker_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        if result.rows_affected() == 0 {
            return Err(Self::not_found(worker_id));
        }
        Ok(())
    }

    async fn update_status(&self, worker_id: &str, status: WorkerStatus) -> SchedulerResult<()> {
        let result = sqlx::query("UPDATE workers SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(worker_id)
            .bind(status)
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        if result.rows_affected() == 0 {
            return Err(Self::not_found(worker_id));
        }

        debug!("Worker状态已更新: {} -> {}", worker_id, status);
        Ok(())
    }

    async fn update_connection_state(
        &self,
        worker_id: &str,
        state: ConnectionState,
    ) -> SchedulerResult<()> {
        let result = sqlx::query(
            "UPDATE workers SET connection_state = $2, last_seen_at = NOW(), updated_at = NOW() WHERE id = $1",
        )
        .bind(worker_id)
        .bind(state)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        if result.rows_affected() == 0 {
            return Err(Self::not_found(worker_id));
        }
        Ok(())
    }

    async fn set_current_task(
        &self,
        worker_id: &str,
        task_id: Option<&str>,
    ) -> SchedulerResult<()> {
        let result = sqlx::query(
            "UPDATE workers SET current_task_id = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(worker_id)
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        if result.rows_affected() == 0 {
            return Err(Self::not_found(worker_id));
        }
        Ok(())
    }

    async fn mark_all_disconnected(&self) -> SchedulerResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE workers
            SET connection_state = 'DISCONNECTED', updated_at = NOW()
            WHERE connection_state = 'CONNECTED'
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        debug!("Worker连接状态批量重置: {} 行", result.rows_affected());
        Ok(result.rows_affected())
    }

    async fn get_connected(&self) -> SchedulerResult<Vec<Worker>> {
        let rows = sqlx::query(&format!(
            "SELECT {WORKER_COLUMNS} FROM workers WHERE connection_state = 'CONNECTED'"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        rows.iter().map(Self::row_to_worker).collect()
    }
}
