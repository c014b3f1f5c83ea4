pub mod concurrency_manager;
pub mod job_manager;
pub(crate) mod queue;
pub mod resources;

pub use concurrency_manager::{
    ConcurrencyConfig, ConcurrencyManager, ConcurrencyStats, DomainUsage, JobCancellationToken,
    JobEvent, JobFuture, JobObserver, JobTask, ShutdownReport,
};
pub use job_manager::{
    CleanupReport, DiscoveryJobManager, JobManagerConfig, JobStatistics, QueueStatus,
};
pub use resources::{FixedMemoryProbe, MemoryProbe, ResourceLimits, SysinfoMemoryProbe};

use crate::models::CoreError;

pub type OrchestrationResult<T> = Result<T, CoreError>;
