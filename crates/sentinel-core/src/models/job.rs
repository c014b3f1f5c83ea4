use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::models::CoreError;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub u64);

/// Scheduling priority. Declaration order is the ordering used by the queue,
/// so `Critical` sorts above `Low`.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
    Critical,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct JobOptions {
    pub priority: JobPriority,
    pub domain: Option<String>,
    pub timeout: Option<Duration>,
    pub retries: u32,
    pub metadata: serde_json::Value,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: JobPriority::Normal,
            domain: None,
            timeout: None,
            retries: 0,
            metadata: serde_json::Value::Null,
        }
    }
}

impl JobOptions {
    pub fn priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Point-in-time copy of a job owned by the concurrency manager.
#[derive(Clone, Debug, PartialEq)]
pub struct JobSnapshot {
    pub id: JobId,
    pub name: String,
    pub priority: JobPriority,
    pub domain: Option<String>,
    pub timeout: Duration,
    pub retries: u32,
    pub attempts: u32,
    pub metadata: serde_json::Value,
    pub status: JobStatus,
    pub created_at: SystemTime,
    pub started_at: Option<SystemTime>,
    pub completed_at: Option<SystemTime>,
    pub result: Option<serde_json::Value>,
    pub error: Option<CoreError>,
}

impl JobSnapshot {
    pub fn duration(&self) -> Option<Duration> {
        let started = self.started_at?;
        let completed = self.completed_at?;
        completed.duration_since(started).ok()
    }
}
