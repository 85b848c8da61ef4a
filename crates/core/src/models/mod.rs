pub mod event;
pub mod message;
pub mod scheduler_state;
pub mod staging;
pub mod task;
pub mod worker;

pub use event::{EventQueueEntry, EventStatus};
pub use message::{
    Heartbeat, OutputKind, OutputUploadRequest, ReportedWorkerStatus, ServerMessage,
    StagingProgress, TaskCancellation, TaskOutput, TaskRequest, TaskStatusUpdate, WorkerMessage,
    WorkerMetricsReport, WorkerShutdownDirective,
};
pub use scheduler_state::{SchedulerLifecycle, SchedulerState, SCHEDULER_STATE_ID};
pub use staging::{SignedUploadUrl, StagingOperation, StagingStatus};
pub use task::{FileMetadata, Task, TaskAssignment, TaskLease, TaskStatus};
pub use worker::{
    ConnectionState, Worker, WorkerCapabilities, WorkerRegistration, WorkerRunConfig, WorkerStatus,
};
