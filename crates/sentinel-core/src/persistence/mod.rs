pub mod in_memory;

pub use in_memory::{InMemoryConfigManager, InMemoryDiscoveryJobStore, InMemoryOpportunityRepository};

use crate::models::{CoreError, DiscoveryJobStatus, Opportunity, PluginConfig};

pub type PersistenceResult<T> = Result<T, CoreError>;

pub trait MigrationStore: Send + Sync {
    fn current_version(&self) -> PersistenceResult<i64>;

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()>;
}

pub trait ConfigManager: Send + Sync {
    fn initialize(&self) -> PersistenceResult<()> {
        Ok(())
    }

    fn get_source_config(&self, name: &str) -> PersistenceResult<Option<PluginConfig>>;

    fn update_source_config(&self, name: &str, config: &PluginConfig) -> PersistenceResult<()>;
}

pub trait OpportunityRepository: Send + Sync {
    fn initialize(&self) -> PersistenceResult<()> {
        Ok(())
    }

    fn create(&self, opportunity: &Opportunity) -> PersistenceResult<()>;
}

pub trait DiscoveryJobStore: Send + Sync {
    fn initialize(&self) -> PersistenceResult<()> {
        Ok(())
    }

    /// Re-recording the same id replaces the earlier record.
    fn record_job(&self, job: &DiscoveryJobStatus) -> PersistenceResult<()>;

    fn list_recent_jobs(&self, limit: usize) -> PersistenceResult<Vec<DiscoveryJobStatus>>;
}
