pub mod discovery_job;
pub mod error;
pub mod job;
pub mod opportunity;
pub mod plugin;

pub use discovery_job::{DiscoveryJobId, DiscoveryJobState, DiscoveryJobStatus, NewDiscoveryJob};
pub use error::{CoreError, CoreErrorKind};
pub use job::{JobId, JobOptions, JobPriority, JobSnapshot, JobStatus};
pub use opportunity::{
    DiscoveryContext, DiscoveryOutput, DuplicateCheck, Opportunity, OpportunityType,
};
pub use plugin::{
    PluginConfig, PluginPriority, PluginStats, PluginStatsSnapshot, SourceType,
};
