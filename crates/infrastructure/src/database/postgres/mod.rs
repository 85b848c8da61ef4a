pub mod postgres_event_queue_repository;
pub mod postgres_scheduler_state_repository;
pub mod postgres_staging_repository;
pub mod postgres_task_repository;
pub mod postgres_worker_repository;

pub use postgres_event_queue_repository::PostgresEventQueueRepository;
pub use postgres_scheduler_state_repository::PostgresSchedulerStateRepository;
pub use postgres_staging_repository::PostgresStagingRepository;
pub use postgres_task_repository::PostgresTaskRepository;
pub use postgres_worker_repository::PostgresWorkerRepository;
