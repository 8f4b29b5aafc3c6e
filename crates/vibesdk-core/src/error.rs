//! Typed error kinds that callers must discriminate. Everything else in the
//! codebase propagates plain `anyhow::Error`.

use thiserror::Error;

/// Raised when a rate-limit check rejects a caller. Bubbles to the top of
/// the build loop, where it is surfaced as `RATE_LIMIT_ERROR` instead of a
/// generic error.
#[derive(Debug, Clone, Error)]
#[error("rate limit exceeded: {scope}")]
pub struct RateLimitExceeded {
    pub scope: String,
}

/// Raised when an in-flight inference chain is aborted via the agent's
/// cancellation token. The build loop swallows it.
#[derive(Debug, Clone, Copy, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Raised by the sandbox for any path whose components escape the instance
/// root.
#[derive(Debug, Clone, Error)]
#[error("path escapes sandbox root: {path}")]
pub struct PathTraversal {
    pub path: String,
}

/// Raised by the CSRF layer; mapped to 403 JSON at the HTTP boundary.
#[derive(Debug, Clone, Error)]
#[error("security violation: {reason}")]
pub struct SecurityViolation {
    pub reason: String,
}

/// True if `err` is (or wraps) a cancellation.
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.downcast_ref::<Cancelled>().is_some()
}

/// True if `err` is (or wraps) a rate-limit rejection.
pub fn is_rate_limited(err: &anyhow::Error) -> bool {
    err.downcast_ref::<RateLimitExceeded>().is_some()
}
