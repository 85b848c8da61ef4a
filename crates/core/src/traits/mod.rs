pub mod repository;
pub mod scheduler;

pub use repository::{
    EventQueueRepository, SchedulerStateRepository, StagingOperationRepository, TaskRepository,
    WorkerRepository,
};
pub use scheduler::{DataMover, EventPublisher, EventReplay, StateManager, TaskScheduler};
