use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::models::{CoreError, CoreErrorKind, DiscoveryJobStatus, Opportunity, PluginConfig};
use crate::persistence::{
    ConfigManager, DiscoveryJobStore, OpportunityRepository, PersistenceResult,
};

#[derive(Debug, Default)]
pub struct InMemoryConfigManager {
    configs: Mutex<HashMap<String, PluginConfig>>,
}

impl InMemoryConfigManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_configs(configs: impl IntoIterator<Item = (String, PluginConfig)>) -> Self {
        Self {
            configs: Mutex::new(configs.into_iter().collect()),
        }
    }
}

impl ConfigManager for InMemoryConfigManager {
    fn get_source_config(&self, name: &str) -> PersistenceResult<Option<PluginConfig>> {
        Ok(lock(&self.configs, "config manager")?.get(name).cloned())
    }

    fn update_source_config(&self, name: &str, config: &PluginConfig) -> PersistenceResult<()> {
        lock(&self.configs, "config manager")?.insert(name.to_string(), config.clone());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryOpportunityRepository {
    opportunities: Mutex<Vec<Opportunity>>,
}

impl InMemoryOpportunityRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn opportunities(&self) -> PersistenceResult<Vec<Opportunity>> {
        Ok(lock(&self.opportunities, "opportunity repository")?.clone())
    }
}

impl OpportunityRepository for InMemoryOpportunityRepository {
    fn create(&self, opportunity: &Opportunity) -> PersistenceResult<()> {
        lock(&self.opportunities, "opportunity repository")?.push(opportunity.clone());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryDiscoveryJobStore {
    jobs: Mutex<Vec<DiscoveryJobStatus>>,
}

impl InMemoryDiscoveryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DiscoveryJobStore for InMemoryDiscoveryJobStore {
    fn record_job(&self, job: &DiscoveryJobStatus) -> PersistenceResult<()> {
        let mut jobs = lock(&self.jobs, "discovery job store")?;
        jobs.retain(|existing| existing.id != job.id);
        jobs.push(job.clone());
        Ok(())
    }

    fn list_recent_jobs(&self, limit: usize) -> PersistenceResult<Vec<DiscoveryJobStatus>> {
        let jobs = lock(&self.jobs, "discovery job store")?;
        Ok(jobs.iter().rev().take(limit).cloned().collect())
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>, store: &str) -> PersistenceResult<MutexGuard<'a, T>> {
    mutex.lock().map_err(|_| {
        CoreError::new(
            CoreErrorKind::StorageFailure,
            format!("in-memory {store} mutex poisoned"),
        )
    })
}
