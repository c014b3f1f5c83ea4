use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpportunityType {
    Grant,
    Job,
    Residency,
    Fellowship,
    Competition,
    Other,
}

impl OpportunityType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Grant => "grant",
            Self::Job => "job",
            Self::Residency => "residency",
            Self::Fellowship => "fellowship",
            Self::Competition => "competition",
            Self::Other => "other",
        }
    }
}

/// Raw opportunity candidate as reported by a discoverer, before
/// deduplication and persistence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub title: String,
    pub url: Option<String>,
    pub organization: Option<String>,
    pub description: Option<String>,
    pub opportunity_type: OpportunityType,
    pub location: Option<String>,
    pub deadline: Option<SystemTime>,
    pub tags: Vec<String>,
    pub source: String,
    pub discovered_at: SystemTime,
    #[serde(default)]
    pub raw: serde_json::Value,
}

impl Opportunity {
    pub fn new(
        title: impl Into<String>,
        opportunity_type: OpportunityType,
        source: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            url: None,
            organization: None,
            description: None,
            opportunity_type,
            location: None,
            deadline: None,
            tags: Vec::new(),
            source: source.into(),
            discovered_at: SystemTime::now(),
            raw: serde_json::Value::Null,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryContext {
    pub keywords: Vec<String>,
    pub opportunity_types: Vec<OpportunityType>,
    pub since: Option<SystemTime>,
    pub max_results: Option<usize>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DiscoveryOutput {
    pub opportunities: Vec<Opportunity>,
    /// Non-fatal problems the discoverer hit while still producing output.
    pub errors: Vec<String>,
    pub processing_time: Duration,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DuplicateCheck {
    pub is_duplicate: bool,
    pub dedup_key: String,
}
