use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::discovery::{DeduplicationService, Discoverer, DiscoveryResult, InMemoryDeduplicationService};
use crate::models::{
    CoreError, CoreErrorKind, DiscoveryContext, DiscoveryJobId, DiscoveryJobState,
    DiscoveryOutput, NewDiscoveryJob, Opportunity, PluginConfig, PluginStats, PluginStatsSnapshot,
    SourceType,
};
use crate::orchestration::{DiscoveryJobManager, JobManagerConfig};
use crate::persistence::{
    ConfigManager, DiscoveryJobStore, InMemoryConfigManager, InMemoryOpportunityRepository,
    OpportunityRepository,
};
use crate::resilience::{
    CircuitBreakerConfig, DEFAULT_REQUESTS_PER_MINUTE, RateLimiter, RetryConfig, RetryManager,
};

#[derive(Clone, Debug)]
pub struct SentinelConfig {
    /// Plugins run concurrently per batch.
    pub max_concurrent_jobs: usize,
    pub health_check_timeout: Duration,
    /// Limit for rate-limit buckets that no plugin config has claimed.
    pub default_requests_per_minute: u32,
    /// Base retry policy; `max_attempts` is overridden per plugin.
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub job_manager: JobManagerConfig,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 3,
            health_check_timeout: Duration::from_secs(5),
            default_requests_per_minute: DEFAULT_REQUESTS_PER_MINUTE,
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            job_manager: JobManagerConfig::default(),
        }
    }
}

#[derive(Clone)]
pub struct SentinelCollaborators {
    pub config_manager: Arc<dyn ConfigManager>,
    pub repository: Arc<dyn OpportunityRepository>,
    pub deduplication: Arc<dyn DeduplicationService>,
    pub job_store: Option<Arc<dyn DiscoveryJobStore>>,
}

impl SentinelCollaborators {
    pub fn in_memory() -> Self {
        Self {
            config_manager: Arc::new(InMemoryConfigManager::new()),
            repository: Arc::new(InMemoryOpportunityRepository::new()),
            deduplication: Arc::new(InMemoryDeduplicationService::new()),
            job_store: None,
        }
    }
}

/// A registered discoverer together with its effective config and counters.
#[derive(Clone)]
pub struct DiscovererPlugin {
    pub discoverer: Arc<dyn Discoverer>,
    pub config: PluginConfig,
    pub stats: PluginStats,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SourceResult {
    pub plugin: String,
    pub source_type: SourceType,
    pub job_id: Option<DiscoveryJobId>,
    pub opportunities_found: usize,
    pub new_opportunities: usize,
    pub duplicates: usize,
    pub processing_time: Duration,
    /// Non-fatal errors the plugin reported alongside its output.
    pub errors: Vec<String>,
    /// Set when the run itself failed.
    pub error: Option<String>,
}

impl SourceResult {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DiscoveryRunResult {
    pub total_opportunities: usize,
    pub new_opportunities: usize,
    pub duplicates_removed: usize,
    pub sources: Vec<SourceResult>,
    pub processing_time: Duration,
    pub errors: Vec<String>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PluginHealth {
    pub name: String,
    pub enabled: bool,
    pub healthy: bool,
    pub error: Option<String>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HealthReport {
    /// True when every enabled plugin reported healthy.
    pub healthy: bool,
    pub plugins: Vec<PluginHealth>,
}

/// Registers discoverer plugins and runs batched, deduplicated discovery
/// passes over them.
pub struct SentinelService {
    config: SentinelConfig,
    collaborators: SentinelCollaborators,
    job_manager: Arc<DiscoveryJobManager>,
    retry_manager: Arc<RetryManager>,
    rate_limiter: Arc<RateLimiter>,
    plugins: Mutex<HashMap<String, DiscovererPlugin>>,
    initialized: AtomicBool,
    discovery_running: AtomicBool,
}

struct PluginRun {
    name: String,
    discoverer: Arc<dyn Discoverer>,
    config: PluginConfig,
}

struct PendingRun {
    name: String,
    source_type: SourceType,
    job_id: Option<DiscoveryJobId>,
    started: Instant,
    handle: JoinHandle<(DiscoveryResult<DiscoveryOutput>, Duration)>,
}

struct RunningFlag<'a>(&'a AtomicBool);

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct DedupOutcome {
    per_source: Vec<(usize, usize)>,
    errors: Vec<String>,
}

impl SentinelService {
    pub fn new(config: SentinelConfig, collaborators: SentinelCollaborators) -> Self {
        let job_manager = match &collaborators.job_store {
            Some(store) => DiscoveryJobManager::with_store(config.job_manager.clone(), store.clone()),
            None => DiscoveryJobManager::new(config.job_manager.clone()),
        };
        let retry_manager = RetryManager::new(config.retry.clone(), config.circuit_breaker.clone());
        let rate_limiter = RateLimiter::new(config.default_requests_per_minute);

        Self {
            config,
            collaborators,
            job_manager: Arc::new(job_manager),
            retry_manager: Arc::new(retry_manager),
            rate_limiter: Arc::new(rate_limiter),
            plugins: Mutex::new(HashMap::new()),
            initialized: AtomicBool::new(false),
            discovery_running: AtomicBool::new(false),
        }
    }

    pub fn in_memory(config: SentinelConfig) -> Self {
        Self::new(config, SentinelCollaborators::in_memory())
    }

    pub fn job_manager(&self) -> &DiscoveryJobManager {
        &self.job_manager
    }

    pub fn retry_manager(&self) -> &RetryManager {
        &self.retry_manager
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Boots the storage collaborators. Safe to call more than once.
    pub async fn initialize(&self) -> DiscoveryResult<()> {
        if self.is_initialized() {
            return Ok(());
        }

        let collaborators = self.collaborators.clone();
        run_blocking("initialize", move || {
            collaborators.config_manager.initialize()?;
            collaborators.repository.initialize()?;
            collaborators.deduplication.initialize()?;
            if let Some(store) = &collaborators.job_store {
                store.initialize()?;
            }
            Ok(())
        })
        .await?;

        self.initialized.store(true, Ordering::SeqCst);
        tracing::info!("sentinel service initialized");
        Ok(())
    }

    /// Loads the persisted config for the plugin (defaults when none is
    /// stored) and initializes the plugin with it.
    pub async fn register_discoverer(&self, discoverer: Arc<dyn Discoverer>) -> DiscoveryResult<()> {
        self.ensure_initialized()?;
        let name = discoverer.name().to_string();
        if self.lock_plugins()?.contains_key(&name) {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                format!("discoverer '{name}' is already registered"),
            )
            .with_plugin(&name));
        }

        let config_manager = self.collaborators.config_manager.clone();
        let lookup_name = name.clone();
        let config = run_blocking("get_source_config", move || {
            config_manager.get_source_config(&lookup_name)
        })
        .await
        .map_err(|error| error.attribute(Some(name.as_str()), Some("register")))?
        .unwrap_or_default();

        discoverer
            .initialize(&config)
            .await
            .map_err(|error| error.attribute(Some(name.as_str()), Some("initialize")))?;
        self.apply_rate_limit(&name, &config)?;

        let mut plugins = self.lock_plugins()?;
        if plugins.contains_key(&name) {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                format!("discoverer '{name}' is already registered"),
            )
            .with_plugin(&name));
        }
        tracing::info!(
            plugin = %name,
            enabled = config.enabled,
            priority = ?config.priority,
            "discoverer registered"
        );
        plugins.insert(
            name,
            DiscovererPlugin {
                discoverer,
                config,
                stats: PluginStats::default(),
            },
        );
        Ok(())
    }

    /// Removes a plugin and runs its cleanup. Returns `false` for unknown names.
    pub async fn unregister_discoverer(&self, name: &str) -> DiscoveryResult<bool> {
        let Some(plugin) = self.lock_plugins()?.remove(name) else {
            return Ok(false);
        };
        if let Err(error) = plugin.discoverer.cleanup().await {
            tracing::warn!(plugin = name, error = %error, "discoverer cleanup failed");
        }
        tracing::info!(plugin = name, "discoverer unregistered");
        Ok(true)
    }

    pub async fn toggle_discoverer(&self, name: &str, enabled: bool) -> DiscoveryResult<()> {
        let mut config = self
            .get_discoverer_config(name)
            .ok_or_else(|| unknown_discoverer(name))?;
        config.enabled = enabled;
        self.update_discoverer_config(name, config).await
    }

    pub fn get_discoverer_config(&self, name: &str) -> Option<PluginConfig> {
        let plugins = self.lock_plugins().ok()?;
        plugins.get(name).map(|plugin| plugin.config.clone())
    }

    /// Persists a new config, pushes it to the plugin, and only then makes it
    /// effective for future runs.
    pub async fn update_discoverer_config(
        &self,
        name: &str,
        config: PluginConfig,
    ) -> DiscoveryResult<()> {
        let discoverer = self
            .lock_plugins()?
            .get(name)
            .map(|plugin| plugin.discoverer.clone())
            .ok_or_else(|| unknown_discoverer(name))?;

        let config_manager = self.collaborators.config_manager.clone();
        let (stored_name, stored_config) = (name.to_string(), config.clone());
        run_blocking("update_source_config", move || {
            config_manager.update_source_config(&stored_name, &stored_config)
        })
        .await
        .map_err(|error| error.attribute(Some(name), Some("update_config")))?;

        discoverer
            .update_config(&config)
            .await
            .map_err(|error| error.attribute(Some(name), Some("update_config")))?;
        self.apply_rate_limit(name, &config)?;

        let mut plugins = self.lock_plugins()?;
        let plugin = plugins.get_mut(name).ok_or_else(|| unknown_discoverer(name))?;
        tracing::info!(plugin = name, enabled = config.enabled, "discoverer config updated");
        plugin.config = config;
        Ok(())
    }

    pub fn get_plugin_stats(&self) -> Vec<PluginStatsSnapshot> {
        let Ok(plugins) = self.lock_plugins() else {
            return Vec::new();
        };
        let mut stats: Vec<_> = plugins
            .iter()
            .map(|(name, plugin)| PluginStatsSnapshot {
                name: name.clone(),
                source_type: plugin.discoverer.source_type(),
                enabled: plugin.config.enabled,
                priority: plugin.config.priority,
                stats: plugin.stats.clone(),
            })
            .collect();
        stats.sort_by(|left, right| left.name.cmp(&right.name));
        stats
    }

    /// Runs every enabled plugin, highest priority first, in batches of
    /// `max_concurrent_jobs`, then deduplicates and persists what they found.
    pub async fn run_discovery(&self, context: DiscoveryContext) -> DiscoveryResult<DiscoveryRunResult> {
        self.ensure_initialized()?;
        let _running = self.begin_discovery()?;
        let started = Instant::now();

        let mut selected: Vec<PluginRun> = self
            .lock_plugins()?
            .iter()
            .filter(|(_, plugin)| plugin.config.enabled)
            .map(|(name, plugin)| PluginRun {
                name: name.clone(),
                discoverer: plugin.discoverer.clone(),
                config: plugin.config.clone(),
            })
            .collect();
        selected.sort_by(|left, right| {
            right
                .config
                .priority
                .cmp(&left.config.priority)
                .then_with(|| left.name.cmp(&right.name))
        });

        tracing::info!(plugins = selected.len(), "discovery run started");
        let context = Arc::new(context);
        let batch_size = self.config.max_concurrent_jobs.max(1);
        let mut runs = Vec::with_capacity(selected.len());
        let mut batches = Vec::new();
        while !selected.is_empty() {
            let rest = selected.split_off(batch_size.min(selected.len()));
            batches.push(std::mem::replace(&mut selected, rest));
        }
        for batch in batches {
            let pending: Vec<PendingRun> = batch
                .into_iter()
                .map(|run| self.spawn_plugin_run(run, context.clone()))
                .collect();
            for run in pending {
                runs.push(self.collect_plugin_run(run).await);
            }
        }

        let result = self.finish_run(runs, Vec::new(), started).await;
        tracing::info!(
            total = result.total_opportunities,
            new = result.new_opportunities,
            duplicates = result.duplicates_removed,
            errors = result.errors.len(),
            elapsed_ms = result.processing_time.as_millis() as u64,
            "discovery run finished"
        );
        Ok(result)
    }

    /// Runs the named plugins concurrently in the given order. Unknown or
    /// disabled names are reported in `errors` instead of failing the call.
    pub async fn run_specific_discovery(
        &self,
        names: &[&str],
        context: DiscoveryContext,
    ) -> DiscoveryResult<DiscoveryRunResult> {
        self.ensure_initialized()?;
        let _running = self.begin_discovery()?;
        let started = Instant::now();

        let mut errors = Vec::new();
        let mut selected = Vec::new();
        {
            let plugins = self.lock_plugins()?;
            for name in names {
                match plugins.get(*name) {
                    None => errors.push(format!("unknown discoverer: {name}")),
                    Some(plugin) if !plugin.config.enabled => {
                        errors.push(format!("discoverer is disabled: {name}"))
                    }
                    Some(plugin) => selected.push(PluginRun {
                        name: name.to_string(),
                        discoverer: plugin.discoverer.clone(),
                        config: plugin.config.clone(),
                    }),
                }
            }
        }

        let context = Arc::new(context);
        let pending: Vec<PendingRun> = selected
            .into_iter()
            .map(|run| self.spawn_plugin_run(run, context.clone()))
            .collect();
        let mut runs = Vec::with_capacity(pending.len());
        for run in pending {
            runs.push(self.collect_plugin_run(run).await);
        }

        Ok(self.finish_run(runs, errors, started).await)
    }

    /// Checks every plugin concurrently. A panic or a check slower than
    /// `health_check_timeout` counts as unhealthy.
    pub async fn check_health(&self) -> DiscoveryResult<HealthReport> {
        let targets: Vec<(String, bool, Arc<dyn Discoverer>)> = self
            .lock_plugins()?
            .iter()
            .map(|(name, plugin)| (name.clone(), plugin.config.enabled, plugin.discoverer.clone()))
            .collect();

        let limit = self.config.health_check_timeout;
        let handles: Vec<_> = targets
            .into_iter()
            .map(|(name, enabled, discoverer)| {
                let handle =
                    tokio::spawn(async move { tokio::time::timeout(limit, discoverer.is_healthy()).await });
                (name, enabled, handle)
            })
            .collect();

        let mut plugins = Vec::with_capacity(handles.len());
        for (name, enabled, handle) in handles {
            let (healthy, error) = match handle.await {
                Ok(Ok(true)) => (true, None),
                Ok(Ok(false)) => (false, Some("reported unhealthy".to_string())),
                Ok(Err(_)) => (
                    false,
                    Some(format!("health check timed out after {}ms", limit.as_millis())),
                ),
                Err(join_error) => (false, Some(format!("health check failed: {join_error}"))),
            };
            if !healthy {
                tracing::warn!(plugin = %name, error = ?error, "discoverer unhealthy");
            }
            plugins.push(PluginHealth {
                name,
                enabled,
                healthy,
                error,
            });
        }
        plugins.sort_by(|left, right| left.name.cmp(&right.name));

        let healthy = plugins
            .iter()
            .filter(|plugin| plugin.enabled)
            .all(|plugin| plugin.healthy);
        Ok(HealthReport { healthy, plugins })
    }

    /// Cleans up and drops every plugin. The service must be initialized again
    /// before further use.
    pub async fn shutdown(&self) -> DiscoveryResult<()> {
        let plugins: Vec<(String, DiscovererPlugin)> = self.lock_plugins()?.drain().collect();
        for (name, plugin) in plugins {
            if let Err(error) = plugin.discoverer.cleanup().await {
                tracing::warn!(plugin = %name, error = %error, "discoverer cleanup failed");
            }
        }
        self.initialized.store(false, Ordering::SeqCst);
        tracing::info!("sentinel service shut down");
        Ok(())
    }

    fn spawn_plugin_run(&self, run: PluginRun, context: Arc<DiscoveryContext>) -> PendingRun {
        let PluginRun {
            name,
            discoverer,
            config,
        } = run;
        let source_type = discoverer.source_type();
        let job_id = self.open_job(&name);

        let retry_manager = self.retry_manager.clone();
        let rate_limiter = self.rate_limiter.clone();
        let retry = RetryConfig {
            max_attempts: config.retry_attempts.max(1),
            ..self.retry_manager.default_config().clone()
        };
        let plugin = name.clone();
        let handle = tokio::spawn(async move {
            let started = Instant::now();
            let operation = format!("discover:{plugin}");
            let outcome = retry_manager
                .execute_with_retry(
                    &operation,
                    || {
                        let discoverer = discoverer.clone();
                        let context = context.clone();
                        let rate_limiter = rate_limiter.clone();
                        let plugin = plugin.clone();
                        let timeout = config.timeout;
                        async move {
                            rate_limiter.acquire(&plugin).await;
                            match tokio::time::timeout(timeout, discoverer.discover(&context)).await {
                                Ok(outcome) => outcome,
                                Err(_) => Err(CoreError::new(
                                    CoreErrorKind::Timeout,
                                    format!(
                                        "discoverer '{plugin}' timed out after {}ms",
                                        timeout.as_millis()
                                    ),
                                )),
                            }
                        }
                    },
                    Some(retry),
                )
                .await
                .map_err(|error| error.attribute(Some(plugin.as_str()), Some("discover")));
            (outcome, started.elapsed())
        });

        PendingRun {
            name,
            source_type,
            job_id,
            started: Instant::now(),
            handle,
        }
    }

    async fn collect_plugin_run(&self, run: PendingRun) -> (SourceResult, Vec<Opportunity>) {
        let PendingRun {
            name,
            source_type,
            job_id,
            started,
            handle,
        } = run;
        let (outcome, elapsed) = match handle.await {
            Ok(joined) => joined,
            Err(join_error) => (
                Err(CoreError::new(
                    CoreErrorKind::Internal,
                    format!("discoverer panicked: {join_error}"),
                )
                .with_plugin(&name)),
                started.elapsed(),
            ),
        };

        let mut source = SourceResult {
            plugin: name.clone(),
            source_type,
            job_id,
            opportunities_found: 0,
            new_opportunities: 0,
            duplicates: 0,
            processing_time: elapsed,
            errors: Vec::new(),
            error: None,
        };

        match outcome {
            Ok(output) => {
                source.opportunities_found = output.opportunities.len();
                source.errors = output
                    .errors
                    .iter()
                    .map(|error| format!("{name}: {error}"))
                    .collect();
                self.close_job(
                    job_id,
                    DiscoveryJobState::Completed,
                    None,
                    Some(serde_json::json!({
                        "opportunities": output.opportunities.len(),
                        "errors": output.errors.len(),
                        "processing_time_ms": elapsed.as_millis() as u64,
                    })),
                );
                self.record_stats(&name, |stats| stats.record_success(elapsed));
                tracing::debug!(
                    plugin = %name,
                    found = source.opportunities_found,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "discoverer finished"
                );
                (source, output.opportunities)
            }
            Err(error) => {
                let message = error.message.clone();
                source.error = Some(format!("{name}: {message}"));
                self.close_job(job_id, DiscoveryJobState::Failed, Some(message.clone()), None);
                self.record_stats(&name, |stats| stats.record_failure(message));
                tracing::warn!(
                    plugin = %name,
                    kind = ?error.kind,
                    error = %error.message,
                    "discoverer failed"
                );
                (source, Vec::new())
            }
        }
    }

    async fn finish_run(
        &self,
        runs: Vec<(SourceResult, Vec<Opportunity>)>,
        mut errors: Vec<String>,
        started: Instant,
    ) -> DiscoveryRunResult {
        let (mut sources, found): (Vec<SourceResult>, Vec<Vec<Opportunity>>) = runs.into_iter().unzip();
        let labelled: Vec<(String, Vec<Opportunity>)> = sources
            .iter()
            .map(|source| source.plugin.clone())
            .zip(found)
            .collect();

        let deduplication = self.collaborators.deduplication.clone();
        let repository = self.collaborators.repository.clone();
        let dedup = match run_blocking("deduplicate", move || {
            Ok(deduplicate_and_store(
                deduplication.as_ref(),
                repository.as_ref(),
                labelled,
            ))
        })
        .await
        {
            Ok(outcome) => outcome,
            Err(error) => DedupOutcome {
                per_source: Vec::new(),
                errors: vec![format!("deduplication failed: {}", error.message)],
            },
        };

        let mut result = DiscoveryRunResult::default();
        for (source, (new, duplicates)) in sources.iter_mut().zip(dedup.per_source) {
            source.new_opportunities = new;
            source.duplicates = duplicates;
        }
        for source in &sources {
            result.total_opportunities += source.opportunities_found;
            result.new_opportunities += source.new_opportunities;
            result.duplicates_removed += source.duplicates;
            errors.extend(source.error.iter().cloned());
            errors.extend(source.errors.iter().cloned());
        }
        errors.extend(dedup.errors);

        result.sources = sources;
        result.errors = errors;
        result.processing_time = started.elapsed();
        result
    }

    fn open_job(&self, name: &str) -> Option<DiscoveryJobId> {
        let opened = self
            .job_manager
            .create_job(NewDiscoveryJob::for_discoverer(name))
            .and_then(|job_id| {
                self.job_manager
                    .update_job_status(job_id, DiscoveryJobState::Running, None, None)
                    .map(|_| job_id)
            });
        match opened {
            Ok(job_id) => Some(job_id),
            Err(error) => {
                tracing::error!(plugin = name, error = %error, "failed to open discovery job");
                None
            }
        }
    }

    fn close_job(
        &self,
        job_id: Option<DiscoveryJobId>,
        state: DiscoveryJobState,
        error: Option<String>,
        result: Option<serde_json::Value>,
    ) {
        let Some(job_id) = job_id else {
            return;
        };
        let closed = match result {
            Some(result) => self.job_manager.set_job_result(job_id, result),
            None => Ok(()),
        }
        .and_then(|()| self.job_manager.update_job_status(job_id, state, error, None));
        if let Err(error) = closed {
            tracing::error!(job_id = job_id.0, error = %error, "failed to close discovery job");
        }
    }

    fn record_stats(&self, name: &str, update: impl FnOnce(&mut PluginStats)) {
        match self.lock_plugins() {
            Ok(mut plugins) => {
                if let Some(plugin) = plugins.get_mut(name) {
                    update(&mut plugin.stats);
                }
            }
            Err(error) => tracing::error!(plugin = name, error = %error, "failed to record plugin stats"),
        }
    }

    fn apply_rate_limit(&self, name: &str, config: &PluginConfig) -> DiscoveryResult<()> {
        self.rate_limiter
            .set_domain_limit(name, config.rate_limit_per_minute)
            .map_err(|error| error.attribute(Some(name), Some("configure")))
    }

    fn begin_discovery(&self) -> DiscoveryResult<RunningFlag<'_>> {
        if self
            .discovery_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                "discovery already running",
            ));
        }
        Ok(RunningFlag(&self.discovery_running))
    }

    fn ensure_initialized(&self) -> DiscoveryResult<()> {
        if self.is_initialized() {
            return Ok(());
        }
        Err(CoreError::new(
            CoreErrorKind::InvalidInput,
            "sentinel service is not initialized",
        ))
    }

    fn lock_plugins(&self) -> DiscoveryResult<MutexGuard<'_, HashMap<String, DiscovererPlugin>>> {
        self.plugins.lock().map_err(|_| {
            CoreError::new(
                CoreErrorKind::Internal,
                "plugin registry mutex poisoned",
            )
        })
    }
}

/// First reporter of a dedup key wins; sources are visited in run order.
fn deduplicate_and_store(
    deduplication: &dyn DeduplicationService,
    repository: &dyn OpportunityRepository,
    sources: Vec<(String, Vec<Opportunity>)>,
) -> DedupOutcome {
    let mut outcome = DedupOutcome::default();
    for (plugin, opportunities) in sources {
        let (mut new, mut duplicates) = (0, 0);
        for opportunity in opportunities {
            let check = match deduplication.check_duplicate(&opportunity) {
                Ok(check) => check,
                Err(error) => {
                    outcome
                        .errors
                        .push(format!("{plugin}: duplicate check failed: {}", error.message));
                    continue;
                }
            };
            if check.is_duplicate {
                duplicates += 1;
                tracing::trace!(plugin = %plugin, key = %check.dedup_key, "duplicate opportunity dropped");
                continue;
            }
            if let Err(error) = repository.create(&opportunity) {
                outcome.errors.push(format!(
                    "{plugin}: failed to store '{}': {}",
                    opportunity.title, error.message
                ));
                continue;
            }
            new += 1;
            if let Err(error) = deduplication.record(&check) {
                outcome
                    .errors
                    .push(format!("{plugin}: failed to record duplicate key: {}", error.message));
            }
        }
        outcome.per_source.push((new, duplicates));
    }
    outcome
}

async fn run_blocking<T, F>(operation: &'static str, call: F) -> DiscoveryResult<T>
where
    F: FnOnce() -> DiscoveryResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|join_error| {
            CoreError::new(
                CoreErrorKind::Internal,
                format!("{operation} join failure: {join_error}"),
            )
            .with_operation(operation)
        })?
}

fn unknown_discoverer(name: &str) -> CoreError {
    CoreError::new(
        CoreErrorKind::NotFound,
        format!("unknown discoverer '{name}'"),
    )
    .with_plugin(name)
}
