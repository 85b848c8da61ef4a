pub mod health;
pub mod protocol;
pub mod recovery;
pub mod registry;
pub mod shutdown;

pub mod test_utils;

pub use health::HealthMonitor;
pub use protocol::WorkerCoordinator;
pub use recovery::{RecoveryManager, RecoveryReport};
pub use registry::{WorkerConnection, WorkerConnectionRegistry};
pub use shutdown::{DrainTask, ShutdownCoordinator, ShutdownManager, WorkIntake};
