use thiserror::Error;

/// Result type alias for fabula operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced across component boundaries.
///
/// Each variant corresponds to one boundary error kind; the daemon maps
/// them to HTTP status codes.
#[derive(Debug, Error)]
pub enum Error {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("upstream failure: {0}")]
    Upstream(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("queue is full")]
    QueueFull,

    #[error("cache miss: {0}")]
    CacheMiss(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether a failed call may be retried.
    ///
    /// Mirrors the retry set of the upstream providers: timeouts,
    /// connection refusals and rate limiting.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Timeout(_) => true,
            Error::Http(e) => e.is_timeout() || e.is_connect(),
            Error::Upstream(msg) | Error::Unavailable(msg) => {
                let msg = msg.to_ascii_lowercase();
                msg.contains("timeout")
                    || msg.contains("connection refused")
                    || msg.contains("rate limit")
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(Error::Timeout("read".into()).is_retryable());
        assert!(Error::Upstream("429 rate limit exceeded".into()).is_retryable());
        assert!(Error::Unavailable("connection refused".into()).is_retryable());
        assert!(!Error::NotFound("story".into()).is_retryable());
        assert!(!Error::Upstream("invalid api key".into()).is_retryable());
    }
}
