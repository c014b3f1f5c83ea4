//! Discoverer plugins and the service that runs them.

pub mod dedup;
pub mod sentinel;

pub use dedup::{InMemoryDeduplicationService, dedup_key};
pub use sentinel::{
    DiscovererPlugin, DiscoveryRunResult, HealthReport, PluginHealth, SentinelCollaborators,
    SentinelConfig, SentinelService, SourceResult,
};

use async_trait::async_trait;

use crate::models::{
    CoreError, DiscoveryContext, DiscoveryOutput, DuplicateCheck, Opportunity, PluginConfig,
    SourceType,
};

pub type DiscoveryResult<T> = Result<T, CoreError>;

/// A source-specific scraper. Implementations are shared across concurrent
/// runs, so any mutable state needs interior synchronisation.
#[async_trait]
pub trait Discoverer: Send + Sync {
    fn name(&self) -> &str;

    fn source_type(&self) -> SourceType;

    async fn initialize(&self, _config: &PluginConfig) -> DiscoveryResult<()> {
        Ok(())
    }

    async fn discover(&self, context: &DiscoveryContext) -> DiscoveryResult<DiscoveryOutput>;

    async fn is_healthy(&self) -> bool {
        true
    }

    async fn update_config(&self, _config: &PluginConfig) -> DiscoveryResult<()> {
        Ok(())
    }

    async fn cleanup(&self) -> DiscoveryResult<()> {
        Ok(())
    }
}

pub trait DeduplicationService: Send + Sync {
    fn initialize(&self) -> DiscoveryResult<()> {
        Ok(())
    }

    /// Must not mark the key as seen; that happens in `record`.
    fn check_duplicate(&self, opportunity: &Opportunity) -> DiscoveryResult<DuplicateCheck>;

    /// Called once the opportunity behind `check` has been stored.
    fn record(&self, _check: &DuplicateCheck) -> DiscoveryResult<()> {
        Ok(())
    }
}
