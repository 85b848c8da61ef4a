use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 事件队列条目状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "PROCESSING")]
    Processing,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "PENDING",
            EventStatus::Processing => "PROCESSING",
            EventStatus::Completed => "COMPLETED",
            EventStatus::Failed => "FAILED",
        }
    }
}

impl sqlx::Type<sqlx::Postgres> for EventStatus {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("VARCHAR")
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for EventStatus {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        match s {
            "PENDING" => Ok(EventStatus::Pending),
            "PROCESSING" => Ok(EventStatus::Processing),
            "COMPLETED" => Ok(EventStatus::Completed),
            "FAILED" => Ok(EventStatus::Failed),
            _ => Err(format!("Invalid event status: {s}").into()),
        }
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for EventStatus {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Postgres>>::encode(self.as_str(), buf)
    }
}

/// 持久化事件队列条目
///
/// 先落库再投递,投递失败不丢事件,重启后由恢复流程重新入队。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventQueueEntry {
    pub id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: EventStatus,
    /// 数值越大越先投递
    pub priority: i32,
    pub retry_count: i32,
    pub max_retries: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EventQueueEntry {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            payload,
            status: EventStatus::Pending,
            priority: 0,
            retry_count: 0,
            max_retries: 3,
            created_at: now,
            updated_at: now,
        }
    }

    /// 审计事件,记录谁对哪个资源做了什么
    pub fn audit(
        actor: &str,
        action: &str,
        resource_kind: &str,
        resource_id: &str,
    ) -> Self {
        Self::new(
            format!("audit.{action}"),
            serde_json::json!({
                "actor": actor,
                "action": action,
                "resource_kind": resource_kind,
                "resource_id": resource_id,
                "timestamp": Utc::now(),
            }),
        )
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn increment_retry(&mut self) {
        self.retry_count += 1;
        self.updated_at = Utc::now();
    }

    pub fn is_retry_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_entry_is_pending() {
        let entry = EventQueueEntry::new("task.completed", serde_json::json!({"task_id": "t1"}));
        assert_eq!(entry.status, EventStatus::Pending);
        assert_eq!(entry.retry_count, 0);
        assert!(!entry.is_retry_exhausted());
    }

    #[test]
    fn test_retry_exhaustion() {
        let mut entry = EventQueueEntry::new("task.failed", serde_json::Value::Null);
        entry.increment_retry();
        entry.increment_retry();
        assert!(!entry.is_retry_exhausted());
        entry.increment_retry();
        assert!(entry.is_retry_exhausted());
    }

    #[test]
    fn test_audit_event_shape() {
        let entry = EventQueueEntry::audit("scheduler", "worker.timeout", "worker", "w-1");
        assert_eq!(entry.event_type, "audit.worker.timeout");
        assert_eq!(entry.payload["resource_id"], "w-1");
    }
}
