// ABOUTME: CRM upstream API module - records, error taxonomy, HTTP client
// ABOUTME: Classifies every upstream failure so the governor can dispatch on it

pub mod client;
pub mod models;

pub use client::CrmClient;
pub use models::{Page, SourceRecord};

use thiserror::Error;

/// Classified upstream failure.
///
/// The fetcher never surfaces a generic error: every non-2xx response and
/// transport fault is mapped to one of these so the retry policy can treat
/// throttling, transient faults and credential problems differently.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The upstream throttling signal. It arrives on the same status code as
    /// an auth failure and is recognised by message content only.
    #[error("upstream throttled the request: {0}")]
    Throttled(String),

    /// Invalid or expired credentials. Not worth retrying.
    #[error("upstream rejected credentials: {0}")]
    Auth(String),

    /// Network fault or 5xx; a short backoff usually clears it.
    #[error("transient upstream failure: {0}")]
    Transient(String),

    /// A request the upstream will never accept (unexpected 4xx, unparsable
    /// response body). Retrying cannot help.
    #[error("permanent upstream failure: {0}")]
    Permanent(String),

    /// Terminal: retries exhausted. The run must abort rather than report a
    /// false "complete".
    #[error("upstream unavailable after {attempts} attempts: {last}")]
    Unavailable { attempts: u32, last: String },
}

/// How the governor should react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Short exponential backoff in seconds.
    Transient,
    /// Dedicated multi-minute cooldown.
    Throttled,
    /// No retry; escalate immediately.
    Fatal,
}

impl UpstreamError {
    pub fn retry_class(&self) -> RetryClass {
        match self {
            UpstreamError::Transient(_) => RetryClass::Transient,
            UpstreamError::Throttled(_) => RetryClass::Throttled,
            UpstreamError::Auth(_)
            | UpstreamError::Permanent(_)
            | UpstreamError::Unavailable { .. } => RetryClass::Fatal,
        }
    }
}

/// Map a non-2xx response to an [`UpstreamError`].
///
/// The CRM reuses 403 for both credential failures and rate limiting; only
/// the body text tells them apart.
pub fn classify_status(status: u16, body: &str) -> UpstreamError {
    let lower = body.to_lowercase();
    match status {
        401 | 403 if lower.contains("too many requests") || lower.contains("rate limit") => {
            UpstreamError::Throttled(format!("HTTP {}: {}", status, body.trim()))
        }
        401 | 403 => UpstreamError::Auth(format!("HTTP {}: {}", status, body.trim())),
        429 => UpstreamError::Throttled(format!("HTTP 429: {}", body.trim())),
        500..=599 => UpstreamError::Transient(format!("HTTP {}: {}", status, body.trim())),
        _ => UpstreamError::Permanent(format!("HTTP {}: {}", status, body.trim())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_shares_status_code_with_auth() {
        // Same 403, different message - must classify differently
        let throttled = classify_status(403, "Too many requests, slow down");
        assert!(matches!(throttled, UpstreamError::Throttled(_)));
        assert_eq!(throttled.retry_class(), RetryClass::Throttled);

        let auth = classify_status(403, "Invalid token");
        assert!(matches!(auth, UpstreamError::Auth(_)));
        assert_eq!(auth.retry_class(), RetryClass::Fatal);
    }

    #[test]
    fn test_server_errors_are_transient() {
        let err = classify_status(503, "service unavailable");
        assert!(matches!(err, UpstreamError::Transient(_)));
        assert_eq!(err.retry_class(), RetryClass::Transient);
    }

    #[test]
    fn test_unexpected_client_errors_are_permanent() {
        let err = classify_status(400, "bad request");
        assert!(matches!(err, UpstreamError::Permanent(_)));
        assert_eq!(err.retry_class(), RetryClass::Fatal);
    }

    #[test]
    fn test_explicit_429_is_throttled() {
        let err = classify_status(429, "");
        assert!(matches!(err, UpstreamError::Throttled(_)));
    }
}
