use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use crate::models::{
    CoreError, CoreErrorKind, DiscoveryJobId, DiscoveryJobState, DiscoveryJobStatus,
    NewDiscoveryJob,
};
use crate::orchestration::OrchestrationResult;
use crate::persistence::DiscoveryJobStore;

pub const DEFAULT_HISTORY_LIMIT: usize = 1000;
pub const DEFAULT_WAIT_ESTIMATE: Duration = Duration::from_secs(30);
const HOURLY_BUCKETS: usize = 24;
const STALE_JOB_ERROR: &str = "job exceeded cleanup cutoff";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JobManagerConfig {
    pub history_limit: usize,
    /// Per-job estimate used for queue wait times before any job has finished.
    pub default_wait_estimate: Duration,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
            default_wait_estimate: DEFAULT_WAIT_ESTIMATE,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JobStatistics {
    pub active: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub average_execution_time: Option<Duration>,
    /// Jobs created per hour over the last day; index 0 is the most recent hour.
    pub hourly_activity: [u32; HOURLY_BUCKETS],
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct QueueStatus {
    pub pending: usize,
    pub running: usize,
    pub estimated_wait_time: Duration,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CleanupReport {
    pub failed_stale_jobs: usize,
    pub trimmed_history: usize,
}

/// Lifecycle bookkeeping for discovery runs.
///
/// Active jobs live in a map keyed by id. A terminal transition stamps the end
/// time and moves the job into a bounded history, oldest first out.
pub struct DiscoveryJobManager {
    config: JobManagerConfig,
    state: Mutex<JobManagerState>,
    store: Option<Arc<dyn DiscoveryJobStore>>,
}

#[derive(Default)]
struct JobManagerState {
    next_job_id: u64,
    active: HashMap<DiscoveryJobId, DiscoveryJobStatus>,
    history: VecDeque<DiscoveryJobStatus>,
}

impl Default for DiscoveryJobManager {
    fn default() -> Self {
        Self::new(JobManagerConfig::default())
    }
}

impl DiscoveryJobManager {
    pub fn new(config: JobManagerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(JobManagerState::default()),
            store: None,
        }
    }

    pub fn with_store(config: JobManagerConfig, store: Arc<dyn DiscoveryJobStore>) -> Self {
        Self {
            store: Some(store),
            ..Self::new(config)
        }
    }

    pub fn create_job(&self, job: NewDiscoveryJob) -> OrchestrationResult<DiscoveryJobId> {
        if job.discoverer.trim().is_empty() {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                "discovery job requires a discoverer name",
            ));
        }

        let mut state = self.lock_state()?;
        let id = DiscoveryJobId(state.next_job_id);
        state.next_job_id = state.next_job_id.saturating_add(1);
        state.active.insert(
            id,
            DiscoveryJobStatus {
                id,
                discoverer: job.discoverer.clone(),
                status: DiscoveryJobState::Pending,
                created_at: SystemTime::now(),
                start_time: None,
                end_time: None,
                progress: 0,
                error: None,
                result: None,
                metadata: job.metadata,
            },
        );
        drop(state);

        tracing::debug!(job_id = id.0, plugin = %job.discoverer, "discovery job created");
        Ok(id)
    }

    pub fn update_job_status(
        &self,
        job_id: DiscoveryJobId,
        status: DiscoveryJobState,
        error: Option<String>,
        progress: Option<u8>,
    ) -> OrchestrationResult<DiscoveryJobStatus> {
        let (updated, terminal) = {
            let mut state = self.lock_state()?;
            state.transition(job_id, status, error, progress, self.config.history_limit)?
        };

        tracing::debug!(
            job_id = job_id.0,
            plugin = %updated.discoverer,
            status = updated.status.as_str(),
            "discovery job updated"
        );
        if terminal {
            self.persist(&updated);
        }
        Ok(updated)
    }

    pub fn update_job_progress(&self, job_id: DiscoveryJobId, progress: u8) -> OrchestrationResult<()> {
        let mut state = self.lock_state()?;
        state.active_job_mut(job_id)?.progress = progress.min(100);
        Ok(())
    }

    pub fn set_job_result(
        &self,
        job_id: DiscoveryJobId,
        result: serde_json::Value,
    ) -> OrchestrationResult<()> {
        let mut state = self.lock_state()?;
        state.active_job_mut(job_id)?.result = Some(result);
        Ok(())
    }

    pub fn get_job_status(&self, job_id: DiscoveryJobId) -> Option<DiscoveryJobStatus> {
        let state = self.lock_state().ok()?;
        state
            .active
            .get(&job_id)
            .or_else(|| state.history.iter().rev().find(|job| job.id == job_id))
            .cloned()
    }

    pub fn get_active_jobs(&self) -> Vec<DiscoveryJobStatus> {
        let Ok(state) = self.lock_state() else {
            return Vec::new();
        };
        let mut jobs: Vec<_> = state.active.values().cloned().collect();
        jobs.sort_by_key(|job| job.id);
        jobs
    }

    pub fn get_jobs_by_status(&self, status: DiscoveryJobState) -> Vec<DiscoveryJobStatus> {
        self.collect_jobs(|job| job.status == status)
    }

    pub fn get_jobs_for_discoverer(&self, discoverer: &str) -> Vec<DiscoveryJobStatus> {
        self.collect_jobs(|job| job.discoverer == discoverer)
    }

    /// Most recently finished jobs first.
    pub fn get_job_history(&self, limit: usize) -> Vec<DiscoveryJobStatus> {
        let Ok(state) = self.lock_state() else {
            return Vec::new();
        };
        state.history.iter().rev().take(limit).cloned().collect()
    }

    /// Returns `Ok(false)` when the job already finished.
    pub fn cancel_job(&self, job_id: DiscoveryJobId) -> OrchestrationResult<bool> {
        let cancelled = {
            let mut state = self.lock_state()?;
            if !state.active.contains_key(&job_id) {
                if state.history.iter().any(|job| job.id == job_id) {
                    return Ok(false);
                }
                return Err(job_lookup_error(job_id));
            }
            let (cancelled, _) = state.transition(
                job_id,
                DiscoveryJobState::Cancelled,
                None,
                None,
                self.config.history_limit,
            )?;
            cancelled
        };

        tracing::info!(job_id = job_id.0, "discovery job cancelled");
        self.persist(&cancelled);
        Ok(true)
    }

    /// Fails active jobs created more than `older_than` ago and trims history
    /// back to its cap.
    pub fn cleanup_jobs(&self, older_than: Duration) -> OrchestrationResult<CleanupReport> {
        let cutoff = SystemTime::now()
            .checked_sub(older_than)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut report = CleanupReport::default();
        let failed = {
            let mut state = self.lock_state()?;
            let mut stale: Vec<DiscoveryJobId> = state
                .active
                .values()
                .filter(|job| job.created_at < cutoff)
                .map(|job| job.id)
                .collect();
            stale.sort();

            let mut failed = Vec::with_capacity(stale.len());
            for job_id in stale {
                let (job, _) = state.transition(
                    job_id,
                    DiscoveryJobState::Failed,
                    Some(STALE_JOB_ERROR.to_string()),
                    None,
                    self.config.history_limit,
                )?;
                failed.push(job);
            }

            while state.history.len() > self.config.history_limit {
                state.history.pop_front();
                report.trimmed_history += 1;
            }
            failed
        };

        report.failed_stale_jobs = failed.len();
        for job in &failed {
            self.persist(job);
        }
        if report.failed_stale_jobs > 0 {
            tracing::warn!(
                failed = report.failed_stale_jobs,
                older_than_secs = older_than.as_secs(),
                "failed stale discovery jobs"
            );
        }
        Ok(report)
    }

    pub fn get_job_statistics(&self) -> OrchestrationResult<JobStatistics> {
        let state = self.lock_state()?;
        let now = SystemTime::now();

        let count = |status: DiscoveryJobState| {
            state
                .active
                .values()
                .chain(state.history.iter())
                .filter(|job| job.status == status)
                .count()
        };

        let mut hourly_activity = [0_u32; HOURLY_BUCKETS];
        for job in state.active.values().chain(state.history.iter()) {
            let Ok(age) = now.duration_since(job.created_at) else {
                hourly_activity[0] += 1;
                continue;
            };
            let hours_ago = (age.as_secs() / 3600) as usize;
            if hours_ago < HOURLY_BUCKETS {
                hourly_activity[hours_ago] += 1;
            }
        }

        Ok(JobStatistics {
            active: state.active.len(),
            pending: count(DiscoveryJobState::Pending),
            running: count(DiscoveryJobState::Running),
            completed: count(DiscoveryJobState::Completed),
            failed: count(DiscoveryJobState::Failed),
            cancelled: count(DiscoveryJobState::Cancelled),
            average_execution_time: state.average_execution_time(),
            hourly_activity,
        })
    }

    pub fn get_queue_status(&self) -> OrchestrationResult<QueueStatus> {
        let state = self.lock_state()?;
        let pending = state
            .active
            .values()
            .filter(|job| job.status == DiscoveryJobState::Pending)
            .count();
        let running = state.active.len() - pending;
        let per_job = state
            .average_execution_time()
            .unwrap_or(self.config.default_wait_estimate);

        Ok(QueueStatus {
            pending,
            running,
            estimated_wait_time: per_job.saturating_mul(u32::try_from(pending).unwrap_or(u32::MAX)),
        })
    }

    fn collect_jobs(&self, filter: impl Fn(&DiscoveryJobStatus) -> bool) -> Vec<DiscoveryJobStatus> {
        let Ok(state) = self.lock_state() else {
            return Vec::new();
        };
        let mut jobs: Vec<_> = state
            .active
            .values()
            .chain(state.history.iter())
            .filter(|job| filter(job))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.id);
        jobs
    }

    fn persist(&self, job: &DiscoveryJobStatus) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(error) = store.record_job(job) {
            tracing::error!(
                job_id = job.id.0,
                plugin = %job.discoverer,
                kind = ?error.kind,
                message = %error.message,
                "failed to persist terminal discovery job"
            );
        }
    }

    fn lock_state(&self) -> OrchestrationResult<MutexGuard<'_, JobManagerState>> {
        self.state.lock().map_err(|_| {
            CoreError::new(
                CoreErrorKind::Internal,
                "discovery job manager mutex poisoned",
            )
        })
    }
}

impl JobManagerState {
    /// Applies a validated status change. Terminal jobs move into history and
    /// come back with `true`.
    fn transition(
        &mut self,
        job_id: DiscoveryJobId,
        status: DiscoveryJobState,
        error: Option<String>,
        progress: Option<u8>,
        history_limit: usize,
    ) -> OrchestrationResult<(DiscoveryJobStatus, bool)> {
        let current = self.active_job(job_id)?.status;
        if !transition_allowed(current, status) {
            return Err(invalid_job_transition(job_id, current, status));
        }

        let now = SystemTime::now();
        let job = self.active_job_mut(job_id)?;
        job.status = status;
        if status == DiscoveryJobState::Running && job.start_time.is_none() {
            job.start_time = Some(now);
        }
        if let Some(progress) = progress {
            job.progress = progress.min(100);
        }
        if error.is_some() {
            job.error = error;
        }
        if status == DiscoveryJobState::Completed {
            job.progress = 100;
        }

        if !status.is_terminal() {
            return Ok((job.clone(), false));
        }
        job.end_time = Some(now);
        let finished = self.retire(job_id, history_limit)?;
        Ok((finished, true))
    }

    fn active_job(&self, job_id: DiscoveryJobId) -> OrchestrationResult<&DiscoveryJobStatus> {
        match self.active.get(&job_id) {
            Some(job) => Ok(job),
            None => Err(self.missing_active_job(job_id)),
        }
    }

    fn active_job_mut(
        &mut self,
        job_id: DiscoveryJobId,
    ) -> OrchestrationResult<&mut DiscoveryJobStatus> {
        if !self.active.contains_key(&job_id) {
            return Err(self.missing_active_job(job_id));
        }
        self.active
            .get_mut(&job_id)
            .ok_or_else(|| job_lookup_error(job_id))
    }

    fn missing_active_job(&self, job_id: DiscoveryJobId) -> CoreError {
        match self.history.iter().find(|job| job.id == job_id) {
            Some(job) => CoreError::new(
                CoreErrorKind::InvalidInput,
                format!(
                    "discovery job '{}' already finished as '{}'",
                    job_id.0,
                    job.status.as_str()
                ),
            ),
            None => job_lookup_error(job_id),
        }
    }

    fn retire(
        &mut self,
        job_id: DiscoveryJobId,
        history_limit: usize,
    ) -> OrchestrationResult<DiscoveryJobStatus> {
        let job = self
            .active
            .remove(&job_id)
            .ok_or_else(|| job_lookup_error(job_id))?;
        self.history.push_back(job.clone());
        while self.history.len() > history_limit {
            self.history.pop_front();
        }
        Ok(job)
    }

    fn average_execution_time(&self) -> Option<Duration> {
        let (total, samples) = self
            .history
            .iter()
            .filter_map(DiscoveryJobStatus::execution_time)
            .fold((Duration::ZERO, 0_u32), |(total, samples), elapsed| {
                (total.saturating_add(elapsed), samples.saturating_add(1))
            });
        (samples > 0).then(|| total / samples)
    }
}

fn transition_allowed(current: DiscoveryJobState, desired: DiscoveryJobState) -> bool {
    use DiscoveryJobState::{Cancelled, Completed, Failed, Pending, Running};
    matches!(
        (current, desired),
        (Pending, Running | Failed | Cancelled) | (Running, Running | Completed | Failed | Cancelled)
    )
}

fn invalid_job_transition(
    job_id: DiscoveryJobId,
    current: DiscoveryJobState,
    desired: DiscoveryJobState,
) -> CoreError {
    CoreError::new(
        CoreErrorKind::InvalidInput,
        format!(
            "discovery job '{}' cannot transition from '{}' to '{}'",
            job_id.0,
            current.as_str(),
            desired.as_str()
        ),
    )
}

fn job_lookup_error(job_id: DiscoveryJobId) -> CoreError {
    CoreError::new(
        CoreErrorKind::NotFound,
        format!("unknown discovery job id '{}'", job_id.0),
    )
}
