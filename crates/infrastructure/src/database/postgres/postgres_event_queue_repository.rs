use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::debug;

use gridsched_core::models::EventQueueEntry;
use gridsched_core::traits::EventQueueRepository;
use gridsched_core::{SchedulerError, SchedulerResult};

/// PostgreSQL 持久化事件队列仓储实现
pub struct PostgresEventQueueRepository {
    pool: PgPool,
}

const EVENT_COLUMNS: &str =
    "id, event_type, payload, status, priority, retry_count, max_retries, created_at, updated_at";

impl PostgresEventQueueRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_entry(row: &sqlx::postgres::PgRow) -> SchedulerResult<EventQueueEntry> {
        Ok(EventQueueEntry {
            id: row.try_get("id")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            priority: row.try_get("priority")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn not_found(event_id: &str) -> SchedulerError {
        SchedulerError::EventQueue(format!("事件不存在: {event_id}"))
    }
}

#[async_trait]
impl EventQueueRepository for PostgresEventQueueRepository {
    async fn insert(&self, entry: &EventQueueEntry) -> SchedulerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO event_queue (id, event_type, payload, status, priority, retry_count, max_retries, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.event_type)
        .bind(&entry.payload)
        .bind(entry.status)
        .bind(entry.priority)
        .bind(entry.retry_count)
        .bind(entry.max_retries)
        .bind(entry.created_at)
        .bind(entry.updated_at)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        debug!("事件已落库: {} ({})", entry.id, entry.event_type);
        Ok(())
    }

    async fn fetch_pending(&self, limit: i64) -> SchedulerResult<Vec<EventQueueEntry>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {EVENT_COLUMNS} FROM event_queue
            WHERE status = 'PENDING'
            ORDER BY priority DESC, created_at ASC
            LIMIT $1
            "#
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        rows.iter().map(Self::row_to_entry).collect()
    }

    async fn mark_processing(&self, event_id: &str) -> SchedulerResult<()> {
        let result = sqlx::query(
            "UPDATE event_queue SET status = 'PROCESSING', updated_at = NOW() WHERE id = $1",
        )
        .bind(event_id)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        if result.rows_affected() == 0 {
            return Err(Self::not_found(event_id));
        }
        Ok(())
    }

    async fn mark_completed(&self, event_id: &str) -> SchedulerResult<()> {
        let result = sqlx::query(
            "UPDATE event_queue SET status = 'COMPLETED', updated_at = NOW() WHERE id = $1",
        )
        .bind(event_id)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        if result.rows_affected() == 0 {
            return Err(Self::not_found(event_id));
        }
        Ok(())
    }

    async fn mark_failed(&self, event_id: &str) -> SchedulerResult<()> {
        let result = sqlx::query(
            "UPDATE event_queue SET status = 'FAILED', updated_at = NOW() WHERE id = $1",
        )
        .bind(event_id)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        if result.rows_affected() == 0 {
            return Err(Self::not_found(event_id));
        }
        Ok(())
    }

    async fn requeue(&self, event_id: &str, retry_count: i32) -> SchedulerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE event_queue
            SET status = 'PENDING', retry_count = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(event_id)
        .bind(retry_count)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        if result.rows_affected() == 0 {
            return Err(Self::not_found(event_id));
        }
        Ok(())
    }
}
