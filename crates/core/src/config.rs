use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::errors::{SchedulerError, SchedulerResult};

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub coordinator: CoordinatorConfig,
    pub health: HealthMonitorConfig,
    pub recovery: RecoveryConfig,
    pub shutdown: ShutdownConfig,
    pub event_queue: EventQueueConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout_seconds: u64,
    pub idle_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/gridsched".to_string(),
            max_connections: 10,
            min_connections: 1,
            connection_timeout_seconds: 30,
            idle_timeout_seconds: 600,
        }
    }
}

/// Worker协调器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// 下发给Worker的心跳间隔
    pub heartbeat_interval_seconds: u64,
    /// 任务默认超时,Worker未带walltime时使用
    pub default_task_timeout_seconds: u64,
    pub working_directory: String,
    /// 每个Worker出站通道的缓冲大小
    pub channel_buffer_size: usize,
    /// 队列为空时下发自毁指令的宽限期
    pub shutdown_grace_seconds: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: 30,
            default_task_timeout_seconds: 3600,
            working_directory: "/tmp/gridsched".to_string(),
            channel_buffer_size: 64,
            shutdown_grace_seconds: 30,
        }
    }
}

/// 健康监控配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMonitorConfig {
    pub check_interval_seconds: u64,
    /// 超过该时长无心跳判定为失联
    pub heartbeat_timeout_seconds: i64,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            check_interval_seconds: 30,
            heartbeat_timeout_seconds: 120,
        }
    }
}

/// 启动恢复配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// scheduler_state行的存活心跳间隔
    pub state_heartbeat_interval_seconds: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            state_heartbeat_interval_seconds: 30,
        }
    }
}

/// 优雅关闭各阶段的时间预算
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// 整个关闭流程的总上限
    pub master_timeout_seconds: u64,
    pub background_jobs_timeout_seconds: u64,
    pub staging_timeout_seconds: u64,
    pub transactions_timeout_seconds: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            master_timeout_seconds: 30,
            background_jobs_timeout_seconds: 15,
            staging_timeout_seconds: 10,
            transactions_timeout_seconds: 5,
        }
    }
}

/// 持久化事件队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventQueueConfig {
    pub worker_count: usize,
    pub channel_capacity: usize,
    pub max_retries: i32,
    pub resume_batch_size: i64,
}

impl Default for EventQueueConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            channel_capacity: 1000,
            max_retries: 3,
            resume_batch_size: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// pretty 或 json
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            coordinator: CoordinatorConfig::default(),
            health: HealthMonitorConfig::default(),
            recovery: RecoveryConfig::default(),
            shutdown: ShutdownConfig::default(),
            event_queue: EventQueueConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = [
                "config/gridsched.toml",
                "gridsched.toml",
                "/etc/gridsched/config.toml",
            ];

            for path in &default_paths {
                if Path::new(path).exists() {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                    break;
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("GRIDSCHED")
                .separator("__")
                .try_parsing(true),
        );

        let defaults = AppConfig::default();
        let builder = builder
            .set_default("database.url", defaults.database.url.clone())?
            .set_default("database.max_connections", defaults.database.max_connections)?
            .set_default("database.min_connections", defaults.database.min_connections)?
            .set_default(
                "database.connection_timeout_seconds",
                defaults.database.connection_timeout_seconds,
            )?
            .set_default(
                "database.idle_timeout_seconds",
                defaults.database.idle_timeout_seconds,
            )?
            .set_default(
                "coordinator.heartbeat_interval_seconds",
                defaults.coordinator.heartbeat_interval_seconds,
            )?
            .set_default(
                "coordinator.default_task_timeout_seconds",
                defaults.coordinator.default_task_timeout_seconds,
            )?
            .set_default(
                "coordinator.working_directory",
                defaults.coordinator.working_directory.clone(),
            )?
            .set_default(
                "coordinator.channel_buffer_size",
                defaults.coordinator.channel_buffer_size as u64,
            )?
            .set_default(
                "coordinator.shutdown_grace_seconds",
                defaults.coordinator.shutdown_grace_seconds,
            )?
            .set_default(
                "health.check_interval_seconds",
                defaults.health.check_interval_seconds,
            )?
            .set_default(
                "health.heartbeat_timeout_seconds",
                defaults.health.heartbeat_timeout_seconds,
            )?
            .set_default(
                "recovery.state_heartbeat_interval_seconds",
                defaults.recovery.state_heartbeat_interval_seconds,
            )?
            .set_default(
                "shutdown.master_timeout_seconds",
                defaults.shutdown.master_timeout_seconds,
            )?
            .set_default(
                "shutdown.background_jobs_timeout_seconds",
                defaults.shutdown.background_jobs_timeout_seconds,
            )?
            .set_default(
                "shutdown.staging_timeout_seconds",
                defaults.shutdown.staging_timeout_seconds,
            )?
            .set_default(
                "shutdown.transactions_timeout_seconds",
                defaults.shutdown.transactions_timeout_seconds,
            )?
            .set_default(
                "event_queue.worker_count",
                defaults.event_queue.worker_count as u64,
            )?
            .set_default(
                "event_queue.channel_capacity",
                defaults.event_queue.channel_capacity as u64,
            )?
            .set_default("event_queue.max_retries", defaults.event_queue.max_retries as i64)?
            .set_default(
                "event_queue.resume_batch_size",
                defaults.event_queue.resume_batch_size,
            )?
            .set_default("observability.log_level", defaults.observability.log_level.clone())?
            .set_default(
                "observability.log_format",
                defaults.observability.log_format.clone(),
            )?;

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        if self.database.url.is_empty() {
            return Err(SchedulerError::Configuration(
                "database.url 不能为空".to_string(),
            ));
        }
        if !self.database.url.starts_with("postgresql://")
            && !self.database.url.starts_with("postgres://")
        {
            return Err(SchedulerError::Configuration(
                "database.url 必须以 postgresql:// 或 postgres:// 开头".to_string(),
            ));
        }
        if self.database.min_connections > self.database.max_connections {
            return Err(SchedulerError::Configuration(
                "database.min_connections 不能大于 max_connections".to_string(),
            ));
        }
        if self.coordinator.channel_buffer_size == 0 {
            return Err(SchedulerError::Configuration(
                "coordinator.channel_buffer_size 必须大于0".to_string(),
            ));
        }
        if self.health.check_interval_seconds == 0 {
            return Err(SchedulerError::Configuration(
                "health.check_interval_seconds 必须大于0".to_string(),
            ));
        }
        if self.health.heartbeat_timeout_seconds <= 0 {
            return Err(SchedulerError::Configuration(
                "health.heartbeat_timeout_seconds 必须大于0".to_string(),
            ));
        }
        if self.event_queue.worker_count == 0 {
            return Err(SchedulerError::Configuration(
                "event_queue.worker_count 必须大于0".to_string(),
            ));
        }
        if self.shutdown.master_timeout_seconds == 0 {
            return Err(SchedulerError::Configuration(
                "shutdown.master_timeout_seconds 必须大于0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.health.heartbeat_timeout_seconds, 120);
        assert_eq!(config.health.check_interval_seconds, 30);
        assert_eq!(config.event_queue.worker_count, 4);
        assert_eq!(config.shutdown.master_timeout_seconds, 30);
    }

    #[test]
    fn test_invalid_database_url() {
        let mut config = AppConfig::default();
        config.database.url = "mysql://localhost/test".to_string();
        assert!(config.validate().is_err());

        config.database.url = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = AppConfig::default();
        config.event_queue.worker_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml_overrides() {
        let toml_str = r#"
[database]
url = "postgresql://localhost/test"
max_connections = 20
min_connections = 2
connection_timeout_seconds = 30
idle_timeout_seconds = 600

[coordinator]
heartbeat_interval_seconds = 15
default_task_timeout_seconds = 7200
working_directory = "/scratch/gridsched"
channel_buffer_size = 128
shutdown_grace_seconds = 30

[health]
check_interval_seconds = 10
heartbeat_timeout_seconds = 60

[recovery]
state_heartbeat_interval_seconds = 30

[shutdown]
master_timeout_seconds = 30
background_jobs_timeout_seconds = 15
staging_timeout_seconds = 10
transactions_timeout_seconds = 5

[event_queue]
worker_count = 8
channel_capacity = 1000
max_retries = 3
resume_batch_size = 500

[observability]
log_level = "debug"
log_format = "json"
"#;

        let config = AppConfig::from_toml(toml_str).expect("Failed to parse TOML");
        assert_eq!(config.database.max_connections, 20);
        assert_eq!(config.coordinator.heartbeat_interval_seconds, 15);
        assert_eq!(config.health.heartbeat_timeout_seconds, 60);
        assert_eq!(config.event_queue.worker_count, 8);
        assert_eq!(config.observability.log_format, "json");
    }
}
