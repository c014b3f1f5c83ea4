use std::time::SystemTime;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DiscoveryJobId(pub u64);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryJobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl DiscoveryJobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for DiscoveryJobState {
    type Err = ();

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct NewDiscoveryJob {
    pub discoverer: String,
    pub metadata: serde_json::Value,
}

impl NewDiscoveryJob {
    pub fn for_discoverer(discoverer: impl Into<String>) -> Self {
        Self {
            discoverer: discoverer.into(),
            metadata: serde_json::Value::Null,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryJobStatus {
    pub id: DiscoveryJobId,
    pub discoverer: String,
    pub status: DiscoveryJobState,
    pub created_at: SystemTime,
    pub start_time: Option<SystemTime>,
    pub end_time: Option<SystemTime>,
    pub progress: u8,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub metadata: serde_json::Value,
}

impl DiscoveryJobStatus {
    pub fn execution_time(&self) -> Option<std::time::Duration> {
        let start = self.start_time?;
        let end = self.end_time?;
        end.duration_since(start).ok()
    }
}
