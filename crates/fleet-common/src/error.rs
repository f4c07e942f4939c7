// Error taxonomy shared by the GitHub and compute adapters and the
// reconciler. The variants drive retry policy: transient conditions are
// absorbed locally with backoff, auth and invariant failures are surfaced.

use std::time::Duration;

use thiserror::Error;

/// Convenience alias used throughout the adapter crates.
pub type FleetResult<T> = Result<T, FleetError>;

/// Classified failure from an external call or a store invariant check.
#[derive(Debug, Error)]
pub enum FleetError {
    /// Credentials or signature rejected. Never retried.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// The remote side is throttling us. Retried with backoff.
    #[error("rate limited by remote API")]
    RateLimited {
        /// Server-suggested delay, when the response carried one.
        retry_after: Option<Duration>,
    },

    /// Network failure or 5xx from the provider/GitHub. Retried up to the
    /// configured attempt bound.
    #[error("transient error: {0}")]
    Transient(String),

    /// The resource is already gone. Delete/deregister paths treat this as
    /// success.
    #[error("resource not found")]
    NotFound,

    /// The call did not complete in time; the outcome is unknown and is
    /// resolved by the next drift listing, never assumed.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// The request itself was malformed or rejected with a non-retryable
    /// client error.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A store invariant was violated (e.g. duplicate instance id). Fatal
    /// for the affected record; requires operator intervention.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl FleetError {
    /// Whether the operation may be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FleetError::RateLimited { .. } | FleetError::Transient(_) | FleetError::Timeout(_)
        )
    }

    /// Classify an HTTP status from GitHub or the compute API.
    ///
    /// 404 maps to `NotFound` so idempotent cleanup paths can treat it as
    /// success. A 403 is an auth failure unless the rate-limit headers say
    /// the quota is exhausted, in which case it is throttling.
    pub fn from_status(status: reqwest::StatusCode, response: &reqwest::Response) -> FleetError {
        match status.as_u16() {
            401 => FleetError::Auth("credentials rejected (401)".into()),
            403 => {
                let remaining = response
                    .headers()
                    .get("x-ratelimit-remaining")
                    .and_then(|v| v.to_str().ok());
                if remaining == Some("0") {
                    FleetError::RateLimited {
                        retry_after: retry_after_header(response),
                    }
                } else {
                    FleetError::Auth("access forbidden (403)".into())
                }
            }
            404 => FleetError::NotFound,
            429 => FleetError::RateLimited {
                retry_after: retry_after_header(response),
            },
            500..=599 => FleetError::Transient(format!("server error ({})", status)),
            _ => FleetError::InvalidRequest(format!("unexpected status {}", status)),
        }
    }

    /// Classify a `reqwest` transport error. Timeouts are kept distinct
    /// because their outcome is unknown rather than failed.
    pub fn from_transport(err: reqwest::Error) -> FleetError {
        if err.is_timeout() {
            FleetError::Timeout(err.to_string())
        } else {
            FleetError::Transient(err.to_string())
        }
    }
}

fn retry_after_header(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(FleetError::Transient("boom".into()).is_retryable());
        assert!(FleetError::RateLimited { retry_after: None }.is_retryable());
        assert!(FleetError::Timeout("slow".into()).is_retryable());
        assert!(!FleetError::Auth("no".into()).is_retryable());
        assert!(!FleetError::NotFound.is_retryable());
        assert!(!FleetError::InvariantViolation("dup".into()).is_retryable());
    }
}
