use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::{Duration, SystemTime};

use serde_json::Value;
use tokio::sync::{Notify, watch};
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;

use crate::models::{
    CoreError, CoreErrorKind, JobId, JobOptions, JobPriority, JobSnapshot, JobStatus,
};
use crate::orchestration::OrchestrationResult;
use crate::orchestration::queue::JobQueue;
use crate::orchestration::resources::{MemoryProbe, ResourceLimits, SysinfoMemoryProbe};

pub type JobFuture = Pin<Box<dyn Future<Output = Result<Value, CoreError>> + Send>>;

pub type JobTask = Arc<dyn Fn(JobCancellationToken) -> JobFuture + Send + Sync>;

#[derive(Clone, Debug, Default)]
pub struct JobCancellationToken {
    flag: Arc<AtomicBool>,
}

impl JobCancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConcurrencyConfig {
    pub max_concurrent_jobs: usize,
    pub max_jobs_per_domain: usize,
    pub default_timeout: Duration,
    pub tick_interval: Duration,
    pub completed_jobs_limit: usize,
    pub shutdown_grace: Duration,
    pub resource_limits: ResourceLimits,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 10,
            max_jobs_per_domain: 2,
            default_timeout: Duration::from_secs(300),
            tick_interval: Duration::from_millis(100),
            completed_jobs_limit: 1000,
            shutdown_grace: Duration::from_secs(30),
            resource_limits: ResourceLimits::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum JobEvent {
    Queued {
        job_id: JobId,
        name: String,
        priority: JobPriority,
    },
    Deferred {
        job_id: JobId,
        domain: String,
    },
    Started {
        job_id: JobId,
        name: String,
    },
    Finished {
        job_id: JobId,
        name: String,
        status: JobStatus,
    },
    Paused,
    Resumed,
    ShutdownStarted,
}

/// Receives job lifecycle events synchronously, after the manager's internal
/// lock has been released.
pub trait JobObserver: Send + Sync {
    fn on_event(&self, event: &JobEvent);
}

impl<F> JobObserver for F
where
    F: Fn(&JobEvent) + Send + Sync,
{
    fn on_event(&self, event: &JobEvent) {
        self(event)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DomainUsage {
    pub domain: String,
    pub running: usize,
    pub limit: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConcurrencyStats {
    pub pending: usize,
    pub running: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    pub average_duration: Duration,
    pub paused: bool,
    pub shutting_down: bool,
    pub domains: Vec<DomainUsage>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ShutdownReport {
    pub cancelled_pending: usize,
    pub drained: usize,
    pub aborted: usize,
}

#[derive(Clone)]
pub struct ConcurrencyManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: ConcurrencyConfig,
    memory_probe: Arc<dyn MemoryProbe>,
    state: Mutex<ManagerState>,
    wake: Arc<Notify>,
    observers: RwLock<Vec<Arc<dyn JobObserver>>>,
    scheduler: Mutex<Option<AbortHandle>>,
}

struct JobEntry {
    snapshot: JobSnapshot,
    task: JobTask,
    token: JobCancellationToken,
    attempts: Arc<AtomicU32>,
    abort: Option<AbortHandle>,
    terminal: watch::Sender<Option<JobSnapshot>>,
}

#[derive(Debug)]
struct DomainLimiter {
    running: usize,
    limit: usize,
}

#[derive(Default)]
struct ManagerState {
    next_job_id: u64,
    queue: JobQueue,
    jobs: HashMap<JobId, JobEntry>,
    running: HashSet<JobId>,
    domains: HashMap<String, DomainLimiter>,
    completed: VecDeque<JobSnapshot>,
    paused: bool,
    shutting_down: bool,
    stopped: bool,
    completed_count: u64,
    failed_count: u64,
    cancelled_count: u64,
    timed_out_count: u64,
    total_duration: Duration,
    timed_samples: u32,
}

struct Launch {
    job_id: JobId,
    name: String,
    task: JobTask,
    token: JobCancellationToken,
    attempts: Arc<AtomicU32>,
    retries: u32,
    timeout: Duration,
}

enum JobOutcome {
    Completed(Value),
    Failed(CoreError),
    TimedOut(CoreError),
}

impl ConcurrencyManager {
    pub fn new(config: ConcurrencyConfig) -> OrchestrationResult<Self> {
        Self::with_memory_probe(config, Arc::new(SysinfoMemoryProbe))
    }

    pub fn with_memory_probe(
        config: ConcurrencyConfig,
        memory_probe: Arc<dyn MemoryProbe>,
    ) -> OrchestrationResult<Self> {
        if config.max_concurrent_jobs == 0 || config.max_jobs_per_domain == 0 {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                "concurrency limits must be at least 1",
            ));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|error| {
            CoreError::new(
                CoreErrorKind::Internal,
                format!("concurrency manager requires a tokio runtime: {error}"),
            )
        })?;

        let inner = Arc::new(Inner {
            config,
            memory_probe,
            state: Mutex::new(ManagerState::default()),
            wake: Arc::new(Notify::new()),
            observers: RwLock::new(Vec::new()),
            scheduler: Mutex::new(None),
        });

        let scheduler = runtime.spawn(run_scheduler(
            Arc::downgrade(&inner),
            inner.wake.clone(),
            inner.config.tick_interval,
        ));
        *lock_recovered(&inner.scheduler) = Some(scheduler.abort_handle());

        Ok(Self { inner })
    }

    pub fn config(&self) -> &ConcurrencyConfig {
        &self.inner.config
    }

    pub fn add_observer(&self, observer: Arc<dyn JobObserver>) {
        self.inner
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    pub fn add_job<F, Fut>(
        &self,
        name: impl Into<String>,
        task: F,
        options: JobOptions,
    ) -> OrchestrationResult<JobId>
    where
        F: Fn(JobCancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, CoreError>> + Send + 'static,
    {
        let name = name.into();
        let task: JobTask = Arc::new(move |token: JobCancellationToken| {
            Box::pin(task(token)) as JobFuture
        });
        self.check_memory(&name)?;

        let (job_id, priority) = {
            let mut state = self.inner.lock_state()?;
            if state.shutting_down {
                return Err(CoreError::new(
                    CoreErrorKind::ShuttingDown,
                    format!("cannot accept job '{name}': concurrency manager is shutting down"),
                ));
            }
            if let Some(max_total) = self.inner.config.resource_limits.max_total_jobs
                && state.jobs.len() >= max_total
            {
                return Err(CoreError::new(
                    CoreErrorKind::ResourceExhausted,
                    format!("cannot accept job '{name}': {max_total} jobs already admitted"),
                ));
            }

            let job_id = JobId(state.next_job_id);
            state.next_job_id = state.next_job_id.saturating_add(1);

            let (terminal, _) = watch::channel(None);
            let snapshot = JobSnapshot {
                id: job_id,
                name: name.clone(),
                priority: options.priority,
                domain: options.domain,
                timeout: options.timeout.unwrap_or(self.inner.config.default_timeout),
                retries: options.retries,
                attempts: 0,
                metadata: options.metadata,
                status: JobStatus::Pending,
                created_at: SystemTime::now(),
                started_at: None,
                completed_at: None,
                result: None,
                error: None,
            };
            state.jobs.insert(
                job_id,
                JobEntry {
                    snapshot,
                    task,
                    token: JobCancellationToken::new(),
                    attempts: Arc::new(AtomicU32::new(0)),
                    abort: None,
                    terminal,
                },
            );
            state.queue.push(job_id, options.priority);
            (job_id, options.priority)
        };

        tracing::debug!(job_id = job_id.0, job = %name, priority = ?priority, "job queued");
        self.inner.emit(&[JobEvent::Queued {
            job_id,
            name,
            priority,
        }]);
        self.inner.wake.notify_one();
        Ok(job_id)
    }

    // `timeout` bounds only the wait, never the job.
    pub async fn get_job_result(
        &self,
        job_id: JobId,
        timeout: Option<Duration>,
    ) -> OrchestrationResult<Value> {
        let mut receiver = {
            let state = self.inner.lock_state()?;
            match state.jobs.get(&job_id) {
                Some(entry) => entry.terminal.subscribe(),
                None => {
                    let snapshot = state
                        .find_completed(job_id)
                        .cloned()
                        .ok_or_else(|| job_lookup_error(job_id))?;
                    return terminal_result(snapshot);
                }
            }
        };

        let wait = async {
            receiver
                .wait_for(Option::is_some)
                .await
                .map(|snapshot| (*snapshot).clone())
        };
        let terminal = match timeout {
            Some(duration) => tokio::time::timeout(duration, wait).await.map_err(|_| {
                CoreError::new(
                    CoreErrorKind::Timeout,
                    format!("timed out waiting for job '{}' to complete", job_id.0),
                )
            })?,
            None => wait.await,
        };

        match terminal {
            Ok(Some(snapshot)) => terminal_result(snapshot),
            Ok(None) | Err(_) => Err(CoreError::new(
                CoreErrorKind::Internal,
                format!("job '{}' was dropped before reaching a terminal state", job_id.0),
            )),
        }
    }

    /// Running jobs are not aborted; the slot is released, the token flagged
    /// and the late outcome dropped.
    pub fn cancel_job(&self, job_id: JobId) -> OrchestrationResult<bool> {
        let event = {
            let mut state = self.inner.lock_state()?;
            let Some(entry) = state.jobs.get(&job_id) else {
                return match state.find_completed(job_id) {
                    Some(_) => Ok(false),
                    None => Err(job_lookup_error(job_id)),
                };
            };
            entry.token.cancel();
            let was_running = entry.snapshot.status == JobStatus::Running;
            if !was_running {
                state.queue.remove(job_id);
            }

            let error = CoreError::new(
                CoreErrorKind::Cancelled,
                format!("job '{}' was cancelled", job_id.0),
            );
            let limit = self.inner.config.completed_jobs_limit;
            state
                .finalize(job_id, JobStatus::Cancelled, None, Some(error), limit)
                .map(|snapshot| finished_event(&snapshot))
        };

        tracing::info!(job_id = job_id.0, "job cancelled");
        if let Some(event) = event {
            self.inner.emit(&[event]);
        }
        self.inner.wake.notify_one();
        Ok(true)
    }

    pub fn get_job_status(&self, job_id: JobId) -> Option<JobSnapshot> {
        let state = self.inner.lock_state_recovered();
        state
            .jobs
            .get(&job_id)
            .map(JobEntry::current_snapshot)
            .or_else(|| state.find_completed(job_id).cloned())
    }

    pub fn get_all_jobs(&self) -> Vec<JobSnapshot> {
        let state = self.inner.lock_state_recovered();
        let mut live: Vec<JobSnapshot> = state
            .jobs
            .values()
            .map(JobEntry::current_snapshot)
            .collect();
        live.sort_by_key(|snapshot| snapshot.id);

        let mut completed: Vec<JobSnapshot> = state.completed.iter().cloned().collect();
        completed.sort_by_key(|snapshot| snapshot.id);

        live.extend(completed);
        live
    }

    pub fn set_domain_limit(&self, domain: &str, limit: usize) -> OrchestrationResult<()> {
        if limit == 0 {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                format!("job limit for domain '{domain}' must be at least 1"),
            ));
        }
        {
            let mut state = self.inner.lock_state()?;
            let default_limit = self.inner.config.max_jobs_per_domain;
            state.domain_limiter(domain, default_limit).limit = limit;
        }
        self.inner.wake.notify_one();
        Ok(())
    }

    pub fn pause(&self) {
        self.inner.lock_state_recovered().paused = true;
        tracing::info!("job scheduling paused");
        self.inner.emit(&[JobEvent::Paused]);
    }

    pub fn resume(&self) {
        self.inner.lock_state_recovered().paused = false;
        tracing::info!("job scheduling resumed");
        self.inner.emit(&[JobEvent::Resumed]);
        self.inner.wake.notify_one();
    }

    pub fn get_stats(&self) -> ConcurrencyStats {
        let state = self.inner.lock_state_recovered();
        let average_duration = if state.timed_samples == 0 {
            Duration::ZERO
        } else {
            state.total_duration / state.timed_samples
        };
        let mut domains: Vec<DomainUsage> = state
            .domains
            .iter()
            .map(|(domain, limiter)| DomainUsage {
                domain: domain.clone(),
                running: limiter.running,
                limit: limiter.limit,
            })
            .collect();
        domains.sort_by(|left, right| left.domain.cmp(&right.domain));

        ConcurrencyStats {
            pending: state.queue.len(),
            running: state.running.len(),
            completed: state.completed_count,
            failed: state.failed_count,
            cancelled: state.cancelled_count,
            timed_out: state.timed_out_count,
            average_duration,
            paused: state.paused,
            shutting_down: state.shutting_down,
            domains,
        }
    }

    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        let limit = self.inner.config.completed_jobs_limit;
        let mut events = vec![JobEvent::ShutdownStarted];

        let waiters = {
            let mut state = self.inner.lock_state_recovered();
            state.shutting_down = true;
            for entry in state.queue.drain() {
                let error = CoreError::new(
                    CoreErrorKind::ShuttingDown,
                    format!("job '{}' cancelled by shutdown", entry.job_id.0),
                );
                if let Some(snapshot) =
                    state.finalize(entry.job_id, JobStatus::Cancelled, None, Some(error), limit)
                {
                    report.cancelled_pending += 1;
                    events.push(finished_event(&snapshot));
                }
            }
            state
                .running
                .iter()
                .filter_map(|job_id| state.jobs.get(job_id))
                .map(|entry| entry.terminal.subscribe())
                .collect::<Vec<_>>()
        };
        self.inner.emit(&events);
        tracing::info!(
            cancelled_pending = report.cancelled_pending,
            running = waiters.len(),
            grace_ms = grace.as_millis() as u64,
            "concurrency manager shutting down"
        );

        let running = waiters.len();
        let drain = async move {
            for mut receiver in waiters {
                let _ = receiver.wait_for(Option::is_some).await;
            }
        };
        let _ = tokio::time::timeout(grace, drain).await;

        let mut events = Vec::new();
        {
            let mut state = self.inner.lock_state_recovered();
            let remaining: Vec<JobId> = state.running.iter().copied().collect();
            for job_id in remaining {
                if let Some(entry) = state.jobs.get_mut(&job_id) {
                    entry.token.cancel();
                    if let Some(abort) = entry.abort.take() {
                        abort.abort();
                    }
                }
                let error = CoreError::new(
                    CoreErrorKind::ShuttingDown,
                    format!("job '{}' aborted after shutdown grace period", job_id.0),
                );
                if let Some(snapshot) =
                    state.finalize(job_id, JobStatus::Cancelled, None, Some(error), limit)
                {
                    report.aborted += 1;
                    events.push(finished_event(&snapshot));
                }
            }
            state.stopped = true;
        }
        report.drained = running.saturating_sub(report.aborted);
        self.inner.emit(&events);

        if let Some(scheduler) = lock_recovered(&self.inner.scheduler).take() {
            scheduler.abort();
        }
        tracing::info!(
            drained = report.drained,
            aborted = report.aborted,
            "concurrency manager stopped"
        );
        report
    }

    fn check_memory(&self, name: &str) -> OrchestrationResult<()> {
        let Some(max_memory) = self.inner.config.resource_limits.max_memory_bytes else {
            return Ok(());
        };
        match self.inner.memory_probe.resident_bytes() {
            Some(used) if used > max_memory => Err(CoreError::new(
                CoreErrorKind::ResourceExhausted,
                format!(
                    "cannot accept job '{name}': resident memory {used} bytes exceeds limit {max_memory} bytes"
                ),
            )),
            _ => Ok(()),
        }
    }
}

impl Inner {
    fn dispatch(self: &Arc<Self>) {
        let mut launches = Vec::new();
        let mut events = Vec::new();
        {
            let mut state = self.lock_state_recovered();
            if state.paused || state.shutting_down {
                return;
            }

            let mut deferred = Vec::new();
            while state.running.len() < self.config.max_concurrent_jobs {
                let Some(entry) = state.queue.pop() else {
                    break;
                };
                let Some(domain) = state
                    .jobs
                    .get(&entry.job_id)
                    .map(|job| job.snapshot.domain.clone())
                else {
                    continue;
                };

                if let Some(domain) = &domain {
                    let limiter = state.domain_limiter(domain, self.config.max_jobs_per_domain);
                    if limiter.running >= limiter.limit {
                        events.push(JobEvent::Deferred {
                            job_id: entry.job_id,
                            domain: domain.clone(),
                        });
                        deferred.push(entry);
                        continue;
                    }
                    limiter.running += 1;
                }

                state.running.insert(entry.job_id);
                let Some(job) = state.jobs.get_mut(&entry.job_id) else {
                    continue;
                };
                job.snapshot.status = JobStatus::Running;
                job.snapshot.started_at = Some(SystemTime::now());
                launches.push(Launch {
                    job_id: entry.job_id,
                    name: job.snapshot.name.clone(),
                    task: job.task.clone(),
                    token: job.token.clone(),
                    attempts: job.attempts.clone(),
                    retries: job.snapshot.retries,
                    timeout: job.snapshot.timeout,
                });
            }

            for entry in deferred {
                state.queue.requeue(entry);
            }
        }

        for launch in launches {
            events.push(JobEvent::Started {
                job_id: launch.job_id,
                name: launch.name.clone(),
            });
            self.launch(launch);
        }
        self.emit(&events);
    }

    fn launch(self: &Arc<Self>, launch: Launch) {
        let Launch {
            job_id,
            name,
            task,
            token,
            attempts,
            retries,
            timeout,
        } = launch;
        tracing::debug!(job_id = job_id.0, job = %name, "job started");

        // Nested spawn so a panicking task surfaces as a JoinError.
        let execution = tokio::spawn(run_attempts(job_id, task, token.clone(), attempts, retries));
        let abort = execution.abort_handle();
        if let Some(entry) = self.lock_state_recovered().jobs.get_mut(&job_id) {
            entry.abort = Some(abort.clone());
        }

        let inner = Arc::downgrade(self);
        tokio::spawn(async move {
            let outcome = match tokio::time::timeout(timeout, execution).await {
                Ok(Ok(Ok(value))) => JobOutcome::Completed(value),
                Ok(Ok(Err(error))) => JobOutcome::Failed(error),
                Ok(Err(join_error)) if join_error.is_panic() => JobOutcome::Failed(
                    CoreError::new(CoreErrorKind::Internal, format!("job '{name}' panicked")),
                ),
                // Aborted by shutdown, which records the terminal state itself.
                Ok(Err(_)) => return,
                Err(_) => {
                    token.cancel();
                    abort.abort();
                    JobOutcome::TimedOut(CoreError::new(
                        CoreErrorKind::Timeout,
                        format!("job '{name}' timed out after {}ms", timeout.as_millis()),
                    ))
                }
            };
            if let Some(inner) = inner.upgrade() {
                inner.finish(job_id, outcome);
            }
        });
    }

    fn finish(&self, job_id: JobId, outcome: JobOutcome) {
        let limit = self.config.completed_jobs_limit;
        let snapshot = {
            let mut state = self.lock_state_recovered();
            let still_running = state
                .jobs
                .get(&job_id)
                .is_some_and(|entry| entry.snapshot.status == JobStatus::Running);
            if !still_running {
                tracing::debug!(job_id = job_id.0, "discarding outcome of cancelled job");
                return;
            }
            match outcome {
                JobOutcome::Completed(value) => {
                    state.finalize(job_id, JobStatus::Completed, Some(value), None, limit)
                }
                JobOutcome::Failed(error) => {
                    state.finalize(job_id, JobStatus::Failed, None, Some(error), limit)
                }
                JobOutcome::TimedOut(error) => {
                    state.finalize(job_id, JobStatus::Timeout, None, Some(error), limit)
                }
            }
        };

        if let Some(snapshot) = snapshot {
            match &snapshot.error {
                Some(error) => tracing::warn!(
                    job_id = job_id.0,
                    job = %snapshot.name,
                    status = ?snapshot.status,
                    attempts = snapshot.attempts,
                    error = %error,
                    "job finished unsuccessfully"
                ),
                None => tracing::debug!(
                    job_id = job_id.0,
                    job = %snapshot.name,
                    attempts = snapshot.attempts,
                    "job completed"
                ),
            }
            self.emit(&[finished_event(&snapshot)]);
        }
        self.wake.notify_one();
    }

    fn emit(&self, events: &[JobEvent]) {
        if events.is_empty() {
            return;
        }
        let observers = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for event in events {
            for observer in &observers {
                observer.on_event(event);
            }
        }
    }

    fn is_stopped(&self) -> bool {
        self.lock_state_recovered().stopped
    }

    fn lock_state(&self) -> OrchestrationResult<MutexGuard<'_, ManagerState>> {
        self.state.lock().map_err(|_| {
            CoreError::new(
                CoreErrorKind::Internal,
                "concurrency manager mutex poisoned",
            )
        })
    }

    fn lock_state_recovered(&self) -> MutexGuard<'_, ManagerState> {
        lock_recovered(&self.state)
    }
}

impl ManagerState {
    fn domain_limiter(&mut self, domain: &str, default_limit: usize) -> &mut DomainLimiter {
        self.domains
            .entry(domain.to_string())
            .or_insert_with(|| DomainLimiter {
                running: 0,
                limit: default_limit,
            })
    }

    fn find_completed(&self, job_id: JobId) -> Option<&JobSnapshot> {
        self.completed.iter().rev().find(|snapshot| snapshot.id == job_id)
    }

    fn finalize(
        &mut self,
        job_id: JobId,
        status: JobStatus,
        result: Option<Value>,
        error: Option<CoreError>,
        completed_limit: usize,
    ) -> Option<JobSnapshot> {
        let entry = self.jobs.remove(&job_id)?;
        if self.running.remove(&job_id)
            && let Some(domain) = &entry.snapshot.domain
            && let Some(limiter) = self.domains.get_mut(domain)
        {
            limiter.running = limiter.running.saturating_sub(1);
        }

        let mut snapshot = entry.current_snapshot();
        snapshot.status = status;
        snapshot.completed_at = Some(SystemTime::now());
        snapshot.result = result;
        snapshot.error = error;

        match status {
            JobStatus::Completed => self.completed_count += 1,
            JobStatus::Failed => self.failed_count += 1,
            JobStatus::Cancelled => self.cancelled_count += 1,
            JobStatus::Timeout => self.timed_out_count += 1,
            JobStatus::Pending | JobStatus::Running => {}
        }
        if let Some(duration) = snapshot.duration() {
            self.total_duration = self.total_duration.saturating_add(duration);
            self.timed_samples = self.timed_samples.saturating_add(1);
        }

        self.completed.push_back(snapshot.clone());
        while self.completed.len() > completed_limit.max(1) {
            self.completed.pop_front();
        }
        entry.terminal.send_replace(Some(snapshot.clone()));
        Some(snapshot)
    }
}

impl JobEntry {
    fn current_snapshot(&self) -> JobSnapshot {
        let mut snapshot = self.snapshot.clone();
        snapshot.attempts = self.attempts.load(Ordering::SeqCst);
        snapshot
    }
}

async fn run_scheduler(inner: Weak<Inner>, wake: Arc<Notify>, tick: Duration) {
    let mut interval = tokio::time::interval(tick.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            if inner.is_stopped() {
                break;
            }
            inner.dispatch();
        }
        tokio::select! {
            _ = wake.notified() => {}
            _ = interval.tick() => {}
        }
    }
    tracing::debug!("job scheduler stopped");
}

async fn run_attempts(
    job_id: JobId,
    task: JobTask,
    token: JobCancellationToken,
    attempts: Arc<AtomicU32>,
    retries: u32,
) -> Result<Value, CoreError> {
    let mut attempt = 0_u32;
    loop {
        attempt += 1;
        attempts.store(attempt, Ordering::SeqCst);
        match task(token.clone()).await {
            Ok(value) => return Ok(value),
            Err(error) if attempt > retries || token.is_cancelled() => return Err(error),
            Err(error) => {
                tracing::debug!(job_id = job_id.0, attempt, error = %error, "job attempt failed");
            }
        }
    }
}

fn terminal_result(snapshot: JobSnapshot) -> OrchestrationResult<Value> {
    if snapshot.status == JobStatus::Completed {
        return Ok(snapshot.result.unwrap_or(Value::Null));
    }
    Err(snapshot.error.unwrap_or_else(|| {
        CoreError::new(
            CoreErrorKind::Internal,
            format!(
                "job '{}' ended as {:?} without an error",
                snapshot.id.0, snapshot.status
            ),
        )
    }))
}

fn finished_event(snapshot: &JobSnapshot) -> JobEvent {
    JobEvent::Finished {
        job_id: snapshot.id,
        name: snapshot.name.clone(),
        status: snapshot.status,
    }
}

fn job_lookup_error(job_id: JobId) -> CoreError {
    CoreError::new(
        CoreErrorKind::NotFound,
        format!("unknown job id '{}'", job_id.0),
    )
}

fn lock_recovered<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
