use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::debug;

use gridsched_core::models::{SchedulerState, SCHEDULER_STATE_ID};
use gridsched_core::traits::SchedulerStateRepository;
use gridsched_core::{SchedulerError, SchedulerResult};

/// PostgreSQL 调度器状态仓储实现,操作scheduler_state单行
pub struct PostgresSchedulerStateRepository {
    pool: PgPool,
}

impl PostgresSchedulerStateRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_state(row: &sqlx::postgres::PgRow) -> SchedulerResult<SchedulerState> {
        Ok(SchedulerState {
            id: row.try_get("id")?,
            instance_id: row.try_get("instance_id")?,
            status: row.try_get("status")?,
            clean_shutdown: row.try_get("clean_shutdown")?,
            startup_time: row.try_get("startup_time")?,
            shutdown_time: row.try_get("shutdown_time")?,
            last_heartbeat: row.try_get("last_heartbeat")?,
        })
    }

    fn stale_instance(instance_id: &str) -> SchedulerError {
        SchedulerError::DatabaseOperation(format!(
            "scheduler_state行不存在或已被其他实例接管: {instance_id}"
        ))
    }
}

#[async_trait]
impl SchedulerStateRepository for PostgresSchedulerStateRepository {
    async fn get(&self) -> SchedulerResult<Option<SchedulerState>> {
        let row = sqlx::query(
            "SELECT id, instance_id, status, clean_shutdown, startup_time, shutdown_time, last_heartbeat FROM scheduler_state WHERE id = $1",
        )
        .bind(SCHEDULER_STATE_ID)
        .fetch_optional(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        row.as_ref().map(Self::row_to_state).transpose()
    }

    async fn upsert_starting(
        &self,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO scheduler_state (id, instance_id, status, clean_shutdown, startup_time, shutdown_time, last_heartbeat)
            VALUES ($1, $2, 'STARTING', false, $3, NULL, $3)
            ON CONFLICT (id) DO UPDATE SET
                instance_id = EXCLUDED.instance_id,
                status = 'STARTING',
                clean_shutdown = false,
                startup_time = EXCLUDED.startup_time,
                shutdown_time = NULL,
                last_heartbeat = EXCLUDED.last_heartbeat
            "#,
        )
        .bind(SCHEDULER_STATE_ID)
        .bind(instance_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        debug!("scheduler_state已写入STARTING: {}", instance_id);
        Ok(())
    }

    async fn mark_running(&self, instance_id: &str, now: DateTime<Utc>) -> SchedulerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE scheduler_state
            SET status = 'RUNNING', last_heartbeat = $3
            WHERE id = $1 AND instance_id = $2
            "#,
        )
        .bind(SCHEDULER_STATE_ID)
        .bind(instance_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        if result.rows_affected() == 0 {
            return Err(Self::stale_instance(instance_id));
        }
        Ok(())
    }

    async fn mark_shutting_down(
        &self,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE scheduler_state
            SET status = 'SHUTTING_DOWN', shutdown_time = $3, last_heartbeat = $3
            WHERE id = $1 AND instance_id = $2
            "#,
        )
        .bind(SCHEDULER_STATE_ID)
        .bind(instance_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        if result.rows_affected() == 0 {
            return Err(Self::stale_instance(instance_id));
        }
        Ok(())
    }

    async fn mark_stopped(
        &self,
        instance_id: &str,
        clean: bool,
        now: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE scheduler_state
            SET status = 'STOPPED', clean_shutdown = $3, shutdown_time = $4, last_heartbeat = $4
            WHERE id = $1 AND instance_id = $2
            "#,
        )
        .bind(SCHEDULER_STATE_ID)
        .bind(instance_id)
        .bind(clean)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        if result.rows_affected() == 0 {
            return Err(Self::stale_instance(instance_id));
        }

        debug!("scheduler_state已写入STOPPED, clean={}", clean);
        Ok(())
    }

    async fn touch_heartbeat(
        &self,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        let result = sqlx::query(
            "UPDATE scheduler_state SET last_heartbeat = $3 WHERE id = $1 AND instance_id = $2",
        )
        .bind(SCHEDULER_STATE_ID)
        .bind(instance_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        if result.rows_affected() == 0 {
            return Err(Self::stale_instance(instance_id));
        }
        Ok(())
    }
}
