use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use gridsched_core::config::EventQueueConfig;
use gridsched_core::models::EventQueueEntry;
use gridsched_core::traits::{EventPublisher, EventQueueRepository, EventReplay};
use gridsched_core::{SchedulerError, SchedulerResult};
use gridsched_coordinator::shutdown::{DrainTask, ShutdownManager};

/// 事件处理器,按事件类型订阅
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, entry: &EventQueueEntry) -> SchedulerResult<()>;
}

/// 订阅所有事件类型的通配键
pub const WILDCARD_EVENT_TYPE: &str = "*";

/// 持久化事件队列
///
/// 发布路径先落库再入内存通道,投递失败不丢事件:
/// 库里的PENDING副本由恢复流程重新入队,达到至少一次投递。
/// 固定数量的worker从共享通道消费,失败按固定次数重试,无退避。
pub struct PersistentEventQueue {
    repo: Arc<dyn EventQueueRepository>,
    handlers: RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
    tx: mpsc::Sender<EventQueueEntry>,
    rx: Mutex<Option<mpsc::Receiver<EventQueueEntry>>>,
    /// 通道内加处理中的事件数,排水依据
    in_flight: AtomicUsize,
    config: EventQueueConfig,
}

impl PersistentEventQueue {
    pub fn new(repo: Arc<dyn EventQueueRepository>, config: EventQueueConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        Self {
            repo,
            handlers: RwLock::new(HashMap::new()),
            tx,
            rx: Mutex::new(Some(rx)),
            in_flight: AtomicUsize::new(0),
            config,
        }
    }

    /// 订阅指定类型的事件,"*"订阅全部
    pub async fn register_handler(
        &self,
        event_type: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) {
        let event_type = event_type.into();
        self.handlers
            .write()
            .await
            .entry(event_type.clone())
            .or_default()
            .push(handler);
        debug!(event_type = %event_type, "事件处理器已注册");
    }

    /// 启动worker池,每个worker独立订阅关闭信号
    pub async fn start(self: &Arc<Self>, shutdown: &ShutdownManager) -> SchedulerResult<()> {
        let rx = self.rx.lock().await.take().ok_or_else(|| {
            SchedulerError::EventQueue("事件队列已经启动过".to_string())
        })?;
        let rx = Arc::new(Mutex::new(rx));

        for worker_index in 0..self.config.worker_count {
            let queue = Arc::clone(self);
            let rx = Arc::clone(&rx);
            let mut shutdown_rx = shutdown.subscribe().await;

            tokio::spawn(async move {
                debug!(worker_index, "事件worker已启动");
                loop {
                    let entry = tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        entry = async { rx.lock().await.recv().await } => {
                            match entry {
                                Some(entry) => entry,
                                None => break,
                            }
                        }
                    };
                    queue.process(entry).await;
                }
                // 关闭信号到达后把通道里剩下的事件投完,
                // 否则已落库的事件卡在PENDING,排水阶段也等不到in_flight归零
                loop {
                    let entry = rx.lock().await.try_recv();
                    match entry {
                        Ok(entry) => queue.process(entry).await,
                        Err(_) => break,
                    }
                }
                debug!(worker_index, "事件worker已退出");
            });
        }

        info!(worker_count = self.config.worker_count, "持久化事件队列已启动");
        Ok(())
    }

    /// 入内存通道,计数先行,失败回退
    fn enqueue(&self, entry: EventQueueEntry) -> bool {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        match self.tx.try_send(entry) {
            Ok(()) => true,
            Err(e) => {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                // 持久化副本还是PENDING,下次恢复会补投
                warn!(error = %e, "事件入队失败,等待恢复流程补投");
                false
            }
        }
    }

    async fn process(&self, mut entry: EventQueueEntry) {
        if let Err(e) = self.repo.mark_processing(&entry.id).await {
            warn!(event_id = %entry.id, error = %e, "标记PROCESSING失败");
        }

        let handlers = {
            let registered = self.handlers.read().await;
            let mut selected: Vec<Arc<dyn EventHandler>> = Vec::new();
            if let Some(list) = registered.get(&entry.event_type) {
                selected.extend(list.iter().cloned());
            }
            if let Some(list) = registered.get(WILDCARD_EVENT_TYPE) {
                selected.extend(list.iter().cloned());
            }
            selected
        };

        let mut failed = false;
        for handler in &handlers {
            if let Err(e) = handler.handle(&entry).await {
                error!(event_id = %entry.id, event_type = %entry.event_type, error = %e, "事件处理失败");
                failed = true;
                break;
            }
        }

        if !failed {
            if let Err(e) = self.repo.mark_completed(&entry.id).await {
                warn!(event_id = %entry.id, error = %e, "标记COMPLETED失败");
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return;
        }

        entry.increment_retry();
        if entry.is_retry_exhausted() {
            warn!(
                event_id = %entry.id,
                retry_count = entry.retry_count,
                "事件重试次数耗尽,标记FAILED"
            );
            if let Err(e) = self.repo.mark_failed(&entry.id).await {
                warn!(event_id = %entry.id, error = %e, "标记FAILED失败");
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return;
        }

        // 固定次数立即重试,不做退避
        if let Err(e) = self.repo.requeue(&entry.id, entry.retry_count).await {
            warn!(event_id = %entry.id, error = %e, "事件退回PENDING失败");
        }
        // 先重新入队再释放计数,排水不会在重试间隙提前返回
        self.enqueue(entry);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventPublisher for PersistentEventQueue {
    /// 先落库再投递;落库失败才算发布失败
    async fn publish(&self, mut entry: EventQueueEntry) -> SchedulerResult<()> {
        // 重试策略由队列统一决定
        entry.max_retries = self.config.max_retries;
        self.repo.insert(&entry).await?;
        self.enqueue(entry);
        Ok(())
    }
}

#[async_trait]
impl EventReplay for PersistentEventQueue {
    /// 把库中PENDING事件重新入队,至少一次投递,重复可接受
    async fn resume_pending(&self) -> SchedulerResult<usize> {
        let pending = self.repo.fetch_pending(self.config.resume_batch_size).await?;
        let mut replayed = 0;
        for entry in pending {
            if self.enqueue(entry) {
                replayed += 1;
            }
        }
        if replayed > 0 {
            info!(count = replayed, "PENDING事件已重新入队");
        }
        Ok(replayed)
    }
}

#[async_trait]
impl DrainTask for PersistentEventQueue {
    fn name(&self) -> &str {
        "event-queue"
    }

    /// 等待通道与处理中的事件清零,外层有超时预算兜底
    async fn drain(&self) -> SchedulerResult<()> {
        while self.in_flight() > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridsched_core::models::EventStatus;
    use std::sync::Mutex as StdMutex;

    #[derive(Clone, Default)]
    struct InMemoryEventRepo {
        entries: Arc<StdMutex<HashMap<String, EventQueueEntry>>>,
    }

    impl InMemoryEventRepo {
        fn status_of(&self, id: &str) -> Option<EventStatus> {
            self.entries.lock().unwrap().get(id).map(|e| e.status)
        }

        fn insert_pending(&self, entry: EventQueueEntry) {
            self.entries.lock().unwrap().insert(entry.id.clone(), entry);
        }
    }

    #[async_trait]
    impl EventQueueRepository for InMemoryEventRepo {
        async fn insert(&self, entry: &EventQueueEntry) -> SchedulerResult<()> {
            self.entries
                .lock()
                .unwrap()
                .insert(entry.id.clone(), entry.clone());
            Ok(())
        }

        async fn fetch_pending(&self, limit: i64) -> SchedulerResult<Vec<EventQueueEntry>> {
            let entries = self.entries.lock().unwrap();
            let mut pending: Vec<EventQueueEntry> = entries
                .values()
                .filter(|e| e.status == EventStatus::Pending)
                .cloned()
                .collect();
            pending.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.created_at.cmp(&b.created_at))
            });
            pending.truncate(limit as usize);
            Ok(pending)
        }

        async fn mark_processing(&self, event_id: &str) -> SchedulerResult<()> {
            self.set_status(event_id, EventStatus::Processing)
        }

        async fn mark_completed(&self, event_id: &str) -> SchedulerResult<()> {
            self.set_status(event_id, EventStatus::Completed)
        }

        async fn mark_failed(&self, event_id: &str) -> SchedulerResult<()> {
            self.set_status(event_id, EventStatus::Failed)
        }

        async fn requeue(&self, event_id: &str, retry_count: i32) -> SchedulerResult<()> {
            let mut entries = self.entries.lock().unwrap();
            let entry = entries
                .get_mut(event_id)
                .ok_or_else(|| SchedulerError::EventQueue(format!("事件不存在: {event_id}")))?;
            entry.status = EventStatus::Pending;
            entry.retry_count = retry_count;
            Ok(())
        }
    }

    impl InMemoryEventRepo {
        fn set_status(&self, event_id: &str, status: EventStatus) -> SchedulerResult<()> {
            let mut entries = self.entries.lock().unwrap();
            let entry = entries
                .get_mut(event_id)
                .ok_or_else(|| SchedulerError::EventQueue(format!("事件不存在: {event_id}")))?;
            entry.status = status;
            Ok(())
        }
    }

    struct RecordingHandler {
        seen: Arc<StdMutex<Vec<String>>>,
        fail_times: Arc<StdMutex<i32>>,
    }

    impl RecordingHandler {
        fn new() -> (Arc<Self>, Arc<StdMutex<Vec<String>>>) {
            let seen = Arc::new(StdMutex::new(Vec::new()));
            let handler = Arc::new(Self {
                seen: seen.clone(),
                fail_times: Arc::new(StdMutex::new(0)),
            });
            (handler, seen)
        }

        fn failing(times: i32) -> (Arc<Self>, Arc<StdMutex<Vec<String>>>) {
            let (handler, seen) = Self::new();
            *handler.fail_times.lock().unwrap() = times;
            (handler, seen)
        }
    }

    #[async_trait]
    impl EventHandler for RecordingHandler {
        async fn handle(&self, entry: &EventQueueEntry) -> SchedulerResult<()> {
            let mut fail_times = self.fail_times.lock().unwrap();
            if *fail_times > 0 {
                *fail_times -= 1;
                return Err(SchedulerError::Internal("handler failure".to_string()));
            }
            self.seen.lock().unwrap().push(entry.id.clone());
            Ok(())
        }
    }

    fn test_config() -> EventQueueConfig {
        EventQueueConfig {
            worker_count: 2,
            channel_capacity: 16,
            max_retries: 3,
            resume_batch_size: 100,
        }
    }

    #[tokio::test]
    async fn test_publish_is_durable_first() {
        let repo = InMemoryEventRepo::default();
        let queue = Arc::new(PersistentEventQueue::new(
            Arc::new(repo.clone()),
            test_config(),
        ));

        // worker未启动,事件只会停在库里和通道里
        let entry = EventQueueEntry::new("task.completed", serde_json::json!({"t": 1}));
        let id = entry.id.clone();
        queue.publish(entry).await.unwrap();

        assert_eq!(repo.status_of(&id), Some(EventStatus::Pending));
        assert_eq!(queue.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_workers_deliver_and_complete() {
        let repo = InMemoryEventRepo::default();
        let queue = Arc::new(PersistentEventQueue::new(
            Arc::new(repo.clone()),
            test_config(),
        ));
        let (handler, seen) = RecordingHandler::new();
        queue.register_handler("task.completed", handler).await;

        let shutdown = ShutdownManager::new();
        queue.start(&shutdown).await.unwrap();

        let entry = EventQueueEntry::new("task.completed", serde_json::json!({"t": 1}));
        let id = entry.id.clone();
        queue.publish(entry).await.unwrap();

        queue.drain().await.unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), &[id.clone()]);
        assert_eq!(repo.status_of(&id), Some(EventStatus::Completed));

        shutdown.shutdown().await;
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let repo = InMemoryEventRepo::default();
        let queue = Arc::new(PersistentEventQueue::new(
            Arc::new(repo.clone()),
            test_config(),
        ));
        let (handler, seen) = RecordingHandler::failing(2);
        queue.register_handler("task.failed", handler).await;

        let shutdown = ShutdownManager::new();
        queue.start(&shutdown).await.unwrap();

        let entry = EventQueueEntry::new("task.failed", serde_json::Value::Null);
        let id = entry.id.clone();
        queue.publish(entry).await.unwrap();

        queue.drain().await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(repo.status_of(&id), Some(EventStatus::Completed));

        shutdown.shutdown().await;
    }

    #[tokio::test]
    async fn test_retry_exhaustion_marks_failed() {
        let repo = InMemoryEventRepo::default();
        let queue = Arc::new(PersistentEventQueue::new(
            Arc::new(repo.clone()),
            test_config(),
        ));
        let (handler, seen) = RecordingHandler::failing(10);
        queue.register_handler("task.failed", handler).await;

        let shutdown = ShutdownManager::new();
        queue.start(&shutdown).await.unwrap();

        let entry = EventQueueEntry::new("task.failed", serde_json::Value::Null);
        let id = entry.id.clone();
        queue.publish(entry).await.unwrap();

        queue.drain().await.unwrap();
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(repo.status_of(&id), Some(EventStatus::Failed));

        shutdown.shutdown().await;
    }

    #[tokio::test]
    async fn test_resume_pending_reinjects() {
        let repo = InMemoryEventRepo::default();

        // 模拟崩溃遗留:库里有PENDING事件但从未进过通道
        let stale = EventQueueEntry::new("task.completed", serde_json::json!({"t": 9}));
        let id = stale.id.clone();
        repo.insert_pending(stale);

        let queue = Arc::new(PersistentEventQueue::new(
            Arc::new(repo.clone()),
            test_config(),
        ));
        let (handler, seen) = RecordingHandler::new();
        queue.register_handler(WILDCARD_EVENT_TYPE, handler).await;

        let shutdown = ShutdownManager::new();
        queue.start(&shutdown).await.unwrap();

        let replayed = queue.resume_pending().await.unwrap();
        assert_eq!(replayed, 1);

        queue.drain().await.unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), &[id.clone()]);
        assert_eq!(repo.status_of(&id), Some(EventStatus::Completed));

        shutdown.shutdown().await;
    }

    struct SlowHandler {
        seen: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl EventHandler for SlowHandler {
        async fn handle(&self, entry: &EventQueueEntry) -> SchedulerResult<()> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.seen.lock().unwrap().push(entry.id.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_shutdown_signal_does_not_strand_published_events() {
        let repo = InMemoryEventRepo::default();
        let queue = Arc::new(PersistentEventQueue::new(
            Arc::new(repo.clone()),
            EventQueueConfig {
                worker_count: 1,
                channel_capacity: 64,
                max_retries: 3,
                resume_batch_size: 100,
            },
        ));
        let seen = Arc::new(StdMutex::new(Vec::new()));
        queue
            .register_handler(WILDCARD_EVENT_TYPE, Arc::new(SlowHandler { seen: seen.clone() }))
            .await;

        let shutdown = ShutdownManager::new();
        queue.start(&shutdown).await.unwrap();

        let mut ids = Vec::new();
        for i in 0..20 {
            let entry = EventQueueEntry::new("task.completed", serde_json::json!({"n": i}));
            ids.push(entry.id.clone());
            queue.publish(entry).await.unwrap();
        }

        // 关闭信号先到,已落库的事件仍要全部投递完
        shutdown.shutdown().await;
        tokio::time::timeout(Duration::from_secs(5), queue.drain())
            .await
            .expect("排水不应超时")
            .unwrap();

        assert_eq!(queue.in_flight(), 0);
        assert_eq!(seen.lock().unwrap().len(), 20);
        for id in &ids {
            assert_eq!(repo.status_of(id), Some(EventStatus::Completed));
        }
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let repo = InMemoryEventRepo::default();
        let queue = Arc::new(PersistentEventQueue::new(Arc::new(repo), test_config()));
        let shutdown = ShutdownManager::new();

        queue.start(&shutdown).await.unwrap();
        assert!(queue.start(&shutdown).await.is_err());

        shutdown.shutdown().await;
    }
}
