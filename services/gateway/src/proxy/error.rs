use std::time::Duration;
use thiserror::Error;

/// Failures talking to a backend. Non-2xx responses are not errors; they are
/// passed through untouched.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("Upstream did not respond within {0:?}")]
    Timeout(Duration),

    #[error("Upstream connection failed: {0}")]
    Connect(String),

    #[error("Upstream returned a response that cannot be proxied (status {status}): {reason}")]
    InvalidResponse { status: u16, reason: String },
}

impl UpstreamError {
    pub(crate) fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        // A connect timeout is an unreachable upstream, not a slow one.
        if err.is_connect() || !err.is_timeout() {
            UpstreamError::Connect(err.to_string())
        } else {
            UpstreamError::Timeout(timeout)
        }
    }
}
