use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use url::Url;
use url::form_urlencoded;

use crate::discovery::{DeduplicationService, DiscoveryResult};
use crate::models::{CoreError, CoreErrorKind, DuplicateCheck, Opportunity};

const TRACKING_PARAM_PREFIX: &str = "utm_";

/// Identity used to recognise the same opportunity across sources.
///
/// Prefers the normalised URL: lower-case host without `www.`, no fragment,
/// no `utm_*` parameters and no trailing slash. Opportunities without a
/// usable URL fall back to title and organisation.
pub fn dedup_key(opportunity: &Opportunity) -> String {
    if let Some(key) = opportunity.url.as_deref().and_then(normalize_url) {
        return format!("url:{key}");
    }
    format!(
        "title:{}|{}",
        normalize_text(&opportunity.title),
        normalize_text(opportunity.organization.as_deref().unwrap_or_default())
    )
}

fn normalize_url(raw: &str) -> Option<String> {
    let url = Url::parse(raw.trim()).ok()?;
    let host = url.host_str()?.to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);

    let mut key = host.to_string();
    if let Some(port) = url.port() {
        key.push_str(&format!(":{port}"));
    }
    key.push_str(url.path().trim_end_matches('/'));

    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(name, _)| !name.starts_with(TRACKING_PARAM_PREFIX))
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();
    if !retained.is_empty() {
        let query = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(retained)
            .finish();
        key.push('?');
        key.push_str(&query);
    }
    Some(key)
}

fn normalize_text(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Keys of stored opportunities, held in memory.
#[derive(Debug, Default)]
pub struct InMemoryDeduplicationService {
    seen: Mutex<HashSet<String>>,
}

impl InMemoryDeduplicationService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seen_keys(&self) -> usize {
        self.seen.lock().map(|seen| seen.len()).unwrap_or_default()
    }

    fn lock_seen(&self) -> DiscoveryResult<MutexGuard<'_, HashSet<String>>> {
        self.seen.lock().map_err(|_| {
            CoreError::new(
                CoreErrorKind::Internal,
                "deduplication service mutex poisoned",
            )
        })
    }
}

impl DeduplicationService for InMemoryDeduplicationService {
    fn check_duplicate(&self, opportunity: &Opportunity) -> DiscoveryResult<DuplicateCheck> {
        let dedup_key = dedup_key(opportunity);
        let is_duplicate = self.lock_seen()?.contains(&dedup_key);
        Ok(DuplicateCheck {
            is_duplicate,
            dedup_key,
        })
    }

    fn record(&self, check: &DuplicateCheck) -> DiscoveryResult<()> {
        self.lock_seen()?.insert(check.dedup_key.clone());
        Ok(())
    }
}
