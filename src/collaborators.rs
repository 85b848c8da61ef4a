//! 协调器的策略协作者:FIFO调度策略、SQL状态机、数据搬运默认实现

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::{debug, info, warn};

use gridsched_core::models::{SignedUploadUrl, Task, TaskStatus, WorkerStatus};
use gridsched_core::traits::{DataMover, StateManager, TaskRepository, TaskScheduler};
use gridsched_core::{SchedulerError, SchedulerResult};

/// FIFO任务调度策略
///
/// 同一实验内按创建时间先到先得,行级锁加SKIP LOCKED保证
/// 多实例并发拉取时同一任务只会派给一个Worker。
pub struct FifoTaskScheduler {
    pool: PgPool,
    task_repo: Arc<dyn TaskRepository>,
    lease_seconds: i64,
}

impl FifoTaskScheduler {
    pub fn new(pool: PgPool, task_repo: Arc<dyn TaskRepository>, lease_seconds: i64) -> Self {
        Self {
            pool,
            task_repo,
            lease_seconds,
        }
    }
}

#[async_trait]
impl TaskScheduler for FifoTaskScheduler {
    /// 挑选并锁定一个任务:任务置DATA_STAGING并绑定Worker,
    /// Worker置BUSY,同时写入租约。全部在一个事务内提交。
    async fn assign_task(&self, worker_id: &str) -> SchedulerResult<Option<Task>> {
        let mut tx = self.pool.begin().await.map_err(SchedulerError::Database)?;

        let row = sqlx::query(
            r#"
            SELECT t.id FROM tasks t
            JOIN workers w ON w.id = $1
            WHERE t.status = 'QUEUED'
              AND t.worker_id IS NULL
              AND t.experiment_id = w.experiment_id
            ORDER BY t.created_at ASC
            LIMIT 1
            FOR UPDATE OF t SKIP LOCKED
            "#,
        )
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(SchedulerError::Database)?;

        let task_id: String = match row {
            Some(row) => row.try_get("id").map_err(SchedulerError::Database)?,
            None => {
                tx.rollback().await.map_err(SchedulerError::Database)?;
                return Ok(None);
            }
        };

        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'DATA_STAGING',
                worker_id = $2,
                compute_resource_id = (SELECT compute_resource_id FROM workers WHERE id = $2),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(&task_id)
        .bind(worker_id)
        .execute(&mut *tx)
        .await
        .map_err(SchedulerError::Database)?;

        sqlx::query(
            "UPDATE workers SET status = 'BUSY', current_task_id = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(worker_id)
        .bind(&task_id)
        .execute(&mut *tx)
        .await
        .map_err(SchedulerError::Database)?;

        sqlx::query(
            r#"
            INSERT INTO task_leases (id, task_id, worker_id, acquired_at, expires_at)
            VALUES ($1, $2, $3, NOW(), NOW() + make_interval(secs => $4::double precision))
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(&task_id)
        .bind(worker_id)
        .bind(self.lease_seconds)
        .execute(&mut *tx)
        .await
        .map_err(SchedulerError::Database)?;

        tx.commit().await.map_err(SchedulerError::Database)?;

        let task = self
            .task_repo
            .get_by_id(&task_id)
            .await?
            .ok_or_else(|| SchedulerError::TaskNotFound {
                id: task_id.clone(),
            })?;

        debug!(task_id = %task.id, worker_id = %worker_id, "FIFO调度选中任务");
        Ok(Some(task))
    }

    /// 基础设施性失败的处理:重试次数未耗尽退回队列,否则判终态
    async fn fail_task(
        &self,
        task_id: &str,
        worker_id: &str,
        reason: &str,
    ) -> SchedulerResult<()> {
        let task = self
            .task_repo
            .get_by_id(task_id)
            .await?
            .ok_or_else(|| SchedulerError::TaskNotFound {
                id: task_id.to_string(),
            })?;

        sqlx::query("DELETE FROM task_leases WHERE task_id = $1")
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        if task.can_retry() {
            sqlx::query(
                r#"
                UPDATE tasks
                SET status = 'QUEUED',
                    worker_id = NULL,
                    compute_resource_id = NULL,
                    retry_count = retry_count + 1,
                    error = $2,
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(task_id)
            .bind(reason)
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

            info!(
                task_id = %task_id,
                worker_id = %worker_id,
                retry = task.retry_count + 1,
                max_retries = task.max_retries,
                reason = %reason,
                "任务失败,退回队列等待重试"
            );
        } else {
            sqlx::query(
                r#"
                UPDATE tasks
                SET status = 'FAILED',
                    error = $2,
                    completed_at = NOW(),
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(task_id)
            .bind(reason)
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

            warn!(
                task_id = %task_id,
                worker_id = %worker_id,
                reason = %reason,
                "任务失败且重试次数耗尽,判为终态"
            );
        }
        Ok(())
    }

    /// 完成收尾:清理租约,合并结果元数据,检查实验是否全部结束
    async fn complete_task(
        &self,
        task_id: &str,
        worker_id: &str,
        result: Option<serde_json::Value>,
    ) -> SchedulerResult<()> {
        sqlx::query("DELETE FROM task_leases WHERE task_id = $1")
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        if let Some(result) = result {
            sqlx::query(
                r#"
                UPDATE tasks
                SET metadata = COALESCE(metadata, '{}'::jsonb) || $2,
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(task_id)
            .bind(&result)
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        }

        let remaining: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM tasks
            WHERE experiment_id = (SELECT experiment_id FROM tasks WHERE id = $1)
              AND status NOT IN ('COMPLETED', 'FAILED', 'CANCELED')
            "#,
        )
        .bind(task_id)
        .fetch_one(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        if remaining == 0 {
            info!(task_id = %task_id, "实验全部任务已结束");
        }
        debug!(task_id = %task_id, worker_id = %worker_id, remaining, "任务完成收尾结束");
        Ok(())
    }
}

/// SQL状态机
///
/// 所有状态变更都是带from前置条件的单条compare-and-set更新,
/// 并发冲突时更新落空并报InvalidStateTransition,绝不覆盖写。
pub struct SqlStateManager {
    pool: PgPool,
}

impl SqlStateManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StateManager for SqlStateManager {
    async fn transition_task_state(
        &self,
        task_id: &str,
        from: TaskStatus,
        to: TaskStatus,
        metadata: serde_json::Value,
    ) -> SchedulerResult<()> {
        let starts_running = to == TaskStatus::Running;
        let terminal = to.is_terminal();
        let error_message = if to == TaskStatus::Failed {
            metadata
                .get("message")
                .and_then(|v| v.as_str())
                .map(str::to_string)
        } else {
            None
        };
        let metadata = match metadata {
            serde_json::Value::Object(_) => metadata,
            _ => serde_json::json!({}),
        };

        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = $3,
                started_at = CASE WHEN $4 THEN COALESCE(started_at, NOW()) ELSE started_at END,
                completed_at = CASE WHEN $5 THEN NOW() ELSE completed_at END,
                error = COALESCE($6, error),
                metadata = COALESCE(metadata, '{}'::jsonb) || $7,
                updated_at = NOW()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(task_id)
        .bind(from)
        .bind(to)
        .bind(starts_running)
        .bind(terminal)
        .bind(error_message)
        .bind(&metadata)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        if result.rows_affected() == 0 {
            let actual: Option<String> = sqlx::query_scalar("SELECT status FROM tasks WHERE id = $1")
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(SchedulerError::Database)?;

            return match actual {
                Some(actual) => Err(SchedulerError::InvalidStateTransition {
                    from: actual,
                    to: to.to_string(),
                }),
                None => Err(SchedulerError::TaskNotFound {
                    id: task_id.to_string(),
                }),
            };
        }

        debug!(task_id = %task_id, from = %from, to = %to, "任务状态机转换提交");
        Ok(())
    }

    async fn transition_worker_state(
        &self,
        worker_id: &str,
        from: WorkerStatus,
        to: WorkerStatus,
        _metadata: serde_json::Value,
    ) -> SchedulerResult<()> {
        let result = sqlx::query(
            "UPDATE workers SET status = $3, updated_at = NOW() WHERE id = $1 AND status = $2",
        )
        .bind(worker_id)
        .bind(from)
        .bind(to)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        if result.rows_affected() == 0 {
            let actual: Option<String> =
                sqlx::query_scalar("SELECT status FROM workers WHERE id = $1")
                    .bind(worker_id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(SchedulerError::Database)?;

            return match actual {
                Some(actual) => Err(SchedulerError::InvalidStateTransition {
                    from: actual,
                    to: to.to_string(),
                }),
                None => Err(SchedulerError::WorkerNotFound {
                    id: worker_id.to_string(),
                }),
            };
        }

        debug!(worker_id = %worker_id, from = %from, to = %to, "Worker状态机转换提交");
        Ok(())
    }
}

/// 数据搬运默认实现
///
/// 字节搬运由部署环境的存储适配层承担,调度器侧不产生
/// 上传URL,归档调用只记录日志。
pub struct PassiveDataMover;

impl PassiveDataMover {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PassiveDataMover {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataMover for PassiveDataMover {
    async fn generate_upload_urls(&self, task_id: &str) -> SchedulerResult<Vec<SignedUploadUrl>> {
        debug!(task_id = %task_id, "未配置存储适配层,不生成上传URL");
        Ok(Vec::new())
    }

    async fn stage_task_output(&self, task_id: &str, worker_id: &str) -> SchedulerResult<()> {
        debug!(task_id = %task_id, worker_id = %worker_id, "未配置存储适配层,跳过输出归档");
        Ok(())
    }
}
