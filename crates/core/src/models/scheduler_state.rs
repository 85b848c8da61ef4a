use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// scheduler_state表的固定主键,单实例部署只有这一行
pub const SCHEDULER_STATE_ID: &str = "scheduler";

/// 调度器实例生命周期状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SchedulerLifecycle {
    #[serde(rename = "STARTING")]
    Starting,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "SHUTTING_DOWN")]
    ShuttingDown,
    #[serde(rename = "STOPPED")]
    Stopped,
}

impl SchedulerLifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerLifecycle::Starting => "STARTING",
            SchedulerLifecycle::Running => "RUNNING",
            SchedulerLifecycle::ShuttingDown => "SHUTTING_DOWN",
            SchedulerLifecycle::Stopped => "STOPPED",
        }
    }
}

impl std::fmt::Display for SchedulerLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl sqlx::Type<sqlx::Postgres> for SchedulerLifecycle {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("VARCHAR")
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for SchedulerLifecycle {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        match s {
            "STARTING" => Ok(SchedulerLifecycle::Starting),
            "RUNNING" => Ok(SchedulerLifecycle::Running),
            "SHUTTING_DOWN" => Ok(SchedulerLifecycle::ShuttingDown),
            "STOPPED" => Ok(SchedulerLifecycle::Stopped),
            _ => Err(format!("Invalid scheduler lifecycle: {s}").into()),
        }
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for SchedulerLifecycle {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Postgres>>::encode(self.as_str(), buf)
    }
}

/// 调度器实例的持久化状态,崩溃恢复的判定依据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerState {
    pub id: String,
    /// 每次启动生成的唯一实例标识
    pub instance_id: String,
    pub status: SchedulerLifecycle,
    /// 上一次关闭是否走完了优雅关闭流程
    pub clean_shutdown: bool,
    pub startup_time: DateTime<Utc>,
    pub shutdown_time: Option<DateTime<Utc>>,
    pub last_heartbeat: DateTime<Utc>,
}

impl SchedulerState {
    /// 上一个实例崩溃或未走完关闭流程时需要恢复
    pub fn requires_recovery(&self) -> bool {
        !self.clean_shutdown
            && matches!(
                self.status,
                SchedulerLifecycle::Starting
                    | SchedulerLifecycle::Running
                    | SchedulerLifecycle::ShuttingDown
            )
    }
}
