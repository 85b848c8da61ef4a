use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info};

use gridsched_core::models::{
    Heartbeat, ReportedWorkerStatus, ServerMessage, WorkerCapabilities,
};
use gridsched_core::{SchedulerError, SchedulerResult};

/// 单个连接上随心跳变化的可变字段
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub last_heartbeat: DateTime<Utc>,
    /// 尚未收到心跳时last_heartbeat是建连时间,乱序保护不生效
    pub heartbeat_received: bool,
    pub reported_status: ReportedWorkerStatus,
    pub current_task_id: Option<String>,
    pub capabilities: Option<WorkerCapabilities>,
    pub metadata: HashMap<String, String>,
}

/// 一条活跃的Worker双工连接
///
/// 出站方向持有mpsc发送端,多处并发send天然串行化;
/// 可变字段用独立的锁,心跳热路径不触碰注册表的外层锁。
pub struct WorkerConnection {
    pub worker_id: String,
    pub experiment_id: String,
    pub compute_resource_id: String,
    pub connected_at: DateTime<Utc>,
    sender: mpsc::Sender<ServerMessage>,
    info: Mutex<ConnectionInfo>,
}

impl WorkerConnection {
    pub fn new(
        worker_id: impl Into<String>,
        experiment_id: impl Into<String>,
        compute_resource_id: impl Into<String>,
        sender: mpsc::Sender<ServerMessage>,
    ) -> Self {
        let now = Utc::now();
        Self {
            worker_id: worker_id.into(),
            experiment_id: experiment_id.into(),
            compute_resource_id: compute_resource_id.into(),
            connected_at: now,
            sender,
            info: Mutex::new(ConnectionInfo {
                last_heartbeat: now,
                heartbeat_received: false,
                reported_status: ReportedWorkerStatus::Idle,
                current_task_id: None,
                capabilities: None,
                metadata: HashMap::new(),
            }),
        }
    }

    /// 向Worker推送一条消息,通道关闭时报错
    pub async fn send(&self, message: ServerMessage) -> SchedulerResult<()> {
        self.sender
            .send(message)
            .await
            .map_err(|_| SchedulerError::ChannelClosed(self.worker_id.clone()))
    }

    /// 该连接是否挂在给定的出站通道上
    pub fn uses_channel(&self, sender: &mpsc::Sender<ServerMessage>) -> bool {
        self.sender.same_channel(sender)
    }

    /// 心跳到达,刷新连接内的所有可变字段
    ///
    /// 乱序到达的旧心跳直接丢弃,存活时间与状态不得回退。
    pub async fn record_heartbeat(&self, heartbeat: &Heartbeat) {
        let mut info = self.info.lock().await;
        if info.heartbeat_received && heartbeat.timestamp < info.last_heartbeat {
            debug!(worker_id = %self.worker_id, "忽略乱序的旧心跳");
            return;
        }
        info.heartbeat_received = true;
        info.last_heartbeat = heartbeat.timestamp;
        info.reported_status = heartbeat.status;
        info.current_task_id = heartbeat.current_task_id.clone();
        if let Some(caps) = &heartbeat.capabilities {
            info.capabilities = Some(caps.clone());
        }
        if !heartbeat.metadata.is_empty() {
            info.metadata = heartbeat.metadata.clone();
        }
    }

    /// 资源占用上报写入连接元数据
    pub async fn record_metrics(&self, cpu_usage_percent: f64, memory_usage_percent: f64) {
        let mut info = self.info.lock().await;
        info.metadata.insert(
            "cpu_usage_percent".to_string(),
            cpu_usage_percent.to_string(),
        );
        info.metadata.insert(
            "memory_usage_percent".to_string(),
            memory_usage_percent.to_string(),
        );
    }

    pub async fn last_heartbeat(&self) -> DateTime<Utc> {
        self.info.lock().await.last_heartbeat
    }

    pub async fn current_task_id(&self) -> Option<String> {
        self.info.lock().await.current_task_id.clone()
    }

    pub async fn set_current_task(&self, task_id: Option<String>) {
        self.info.lock().await.current_task_id = task_id;
    }

    pub async fn reported_status(&self) -> ReportedWorkerStatus {
        self.info.lock().await.reported_status
    }

    pub async fn set_reported_status(&self, status: ReportedWorkerStatus) {
        self.info.lock().await.reported_status = status;
    }

    pub async fn info_snapshot(&self) -> ConnectionInfo {
        self.info.lock().await.clone()
    }
}

/// 活跃连接注册表
///
/// 外层RwLock只保护成员关系(插入/摘除/遍历),
/// 字段级修改走每条连接自己的锁。
pub struct WorkerConnectionRegistry {
    connections: RwLock<HashMap<String, Arc<WorkerConnection>>>,
}

impl WorkerConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// 插入连接,同一Worker重连时替换旧连接
    pub async fn insert(&self, connection: Arc<WorkerConnection>) {
        let worker_id = connection.worker_id.clone();
        let replaced = self
            .connections
            .write()
            .await
            .insert(worker_id.clone(), connection)
            .is_some();
        if replaced {
            info!(worker_id = %worker_id, "Worker重连,替换旧连接");
        } else {
            debug!(worker_id = %worker_id, "Worker连接已登记");
        }
    }

    /// 仅当该Worker仍挂在给定通道上时摘除
    ///
    /// 旧通道的EOF在Worker已重连到新通道后到达时,不得误伤新连接。
    pub async fn remove_if_channel(
        &self,
        worker_id: &str,
        sender: &mpsc::Sender<ServerMessage>,
    ) -> Option<Arc<WorkerConnection>> {
        let mut guard = self.connections.write().await;
        match guard.get(worker_id) {
            Some(conn) if conn.uses_channel(sender) => {
                debug!(worker_id = %worker_id, "Worker连接已摘除");
                guard.remove(worker_id)
            }
            _ => None,
        }
    }

    /// 摘除连接,返回被摘除的连接
    pub async fn remove(&self, worker_id: &str) -> Option<Arc<WorkerConnection>> {
        let removed = self.connections.write().await.remove(worker_id);
        if removed.is_some() {
            debug!(worker_id = %worker_id, "Worker连接已摘除");
        }
        removed
    }

    pub async fn get(&self, worker_id: &str) -> Option<Arc<WorkerConnection>> {
        self.connections.read().await.get(worker_id).cloned()
    }

    pub async fn contains(&self, worker_id: &str) -> bool {
        self.connections.read().await.contains_key(worker_id)
    }

    /// 当前所有连接的快照,遍历时不持锁
    pub async fn snapshot(&self) -> Vec<Arc<WorkerConnection>> {
        self.connections.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// 清空注册表,返回清掉的连接数
    pub async fn clear(&self) -> usize {
        let mut guard = self.connections.write().await;
        let count = guard.len();
        guard.clear();
        count
    }
}

impl Default for WorkerConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
