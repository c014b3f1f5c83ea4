use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    WebSearch,
    JobBoard,
    GrantDatabase,
    SocialFeed,
    Newsletter,
    Rss,
    Other,
}

#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PluginPriority {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    pub enabled: bool,
    pub priority: PluginPriority,
    pub rate_limit_per_minute: u32,
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    pub retry_attempts: u32,
    pub settings: serde_json::Value,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            priority: PluginPriority::Medium,
            rate_limit_per_minute: 60,
            timeout: Duration::from_secs(30),
            retry_attempts: 3,
            settings: serde_json::Value::Null,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PluginStats {
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
    pub average_processing_time: Duration,
    pub last_run: Option<SystemTime>,
    pub last_error: Option<String>,
}

impl PluginStats {
    pub fn record_success(&mut self, elapsed: Duration) {
        self.total_runs = self.total_runs.saturating_add(1);
        self.successful_runs = self.successful_runs.saturating_add(1);
        self.average_processing_time =
            rolling_average(self.average_processing_time, elapsed, self.successful_runs);
        self.last_run = Some(SystemTime::now());
        self.last_error = None;
    }

    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.total_runs = self.total_runs.saturating_add(1);
        self.failed_runs = self.failed_runs.saturating_add(1);
        self.last_run = Some(SystemTime::now());
        self.last_error = Some(error.into());
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_runs == 0 {
            return 0.0;
        }
        self.successful_runs as f64 / self.total_runs as f64
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PluginStatsSnapshot {
    pub name: String,
    pub source_type: SourceType,
    pub enabled: bool,
    pub priority: PluginPriority,
    pub stats: PluginStats,
}

pub(crate) fn rolling_average(current: Duration, sample: Duration, count: u64) -> Duration {
    if count <= 1 {
        return sample;
    }
    let current = current.as_nanos() as i128;
    let updated = current + (sample.as_nanos() as i128 - current) / i128::from(count);
    Duration::from_nanos(u64::try_from(updated.max(0)).unwrap_or(u64::MAX))
}

pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
