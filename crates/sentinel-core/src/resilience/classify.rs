use serde::{Deserialize, Serialize};

use crate::models::{CoreError, CoreErrorKind};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Timeout,
    RateLimited,
    ServerError,
    Connection,
    TemporaryFailure,
    Permanent,
}

pub const RETRYABLE_CATEGORIES: [ErrorCategory; 6] = [
    ErrorCategory::Network,
    ErrorCategory::Timeout,
    ErrorCategory::RateLimited,
    ErrorCategory::ServerError,
    ErrorCategory::Connection,
    ErrorCategory::TemporaryFailure,
];

const RATE_LIMIT_MARKERS: &[&str] = &[
    "rate limit",
    "rate-limit",
    "too many requests",
    "429",
    "quota exceeded",
];
const TIMEOUT_MARKERS: &[&str] = &["timeout", "timed out", "etimedout", "deadline exceeded"];
const CONNECTION_MARKERS: &[&str] = &[
    "econnrefused",
    "econnreset",
    "connection refused",
    "connection reset",
    "connection closed",
    "connection aborted",
    "socket hang up",
    "broken pipe",
];
const NETWORK_MARKERS: &[&str] = &[
    "network",
    "enotfound",
    "eai_again",
    "dns",
    "unreachable",
    "no route to host",
];
const SERVER_ERROR_MARKERS: &[&str] = &[
    "500",
    "502",
    "503",
    "504",
    "internal server error",
    "bad gateway",
    "service unavailable",
    "server error",
];

/// Maps an error onto a retry category. Typed kinds win over message
/// heuristics; anything unrecognised is a temporary failure.
pub fn classify_error(error: &CoreError) -> ErrorCategory {
    match error.kind {
        CoreErrorKind::Timeout => return ErrorCategory::Timeout,
        CoreErrorKind::InvalidInput
        | CoreErrorKind::NotFound
        | CoreErrorKind::Cancelled
        | CoreErrorKind::CircuitOpen
        | CoreErrorKind::ShuttingDown => return ErrorCategory::Permanent,
        CoreErrorKind::ResourceExhausted
        | CoreErrorKind::OperationFailed
        | CoreErrorKind::StorageFailure
        | CoreErrorKind::Internal => {}
    }
    classify_message(&error.message)
}

fn classify_message(message: &str) -> ErrorCategory {
    let message = message.to_ascii_lowercase();
    let matches = |markers: &[&str]| markers.iter().any(|marker| message.contains(marker));

    if matches(RATE_LIMIT_MARKERS) {
        ErrorCategory::RateLimited
    } else if matches(TIMEOUT_MARKERS) {
        ErrorCategory::Timeout
    } else if matches(CONNECTION_MARKERS) {
        ErrorCategory::Connection
    } else if matches(NETWORK_MARKERS) {
        ErrorCategory::Network
    } else if matches(SERVER_ERROR_MARKERS) {
        ErrorCategory::ServerError
    } else {
        ErrorCategory::TemporaryFailure
    }
}
