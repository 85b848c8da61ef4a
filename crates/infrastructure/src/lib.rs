pub mod database;
pub mod event_queue;

pub use database::create_pool;
pub use database::postgres::{
    PostgresEventQueueRepository, PostgresSchedulerStateRepository, PostgresStagingRepository,
    PostgresTaskRepository, PostgresWorkerRepository,
};
pub use event_queue::{EventHandler, PersistentEventQueue};
