use std::time::Duration;
use store::StoreError;
use thiserror::Error;

/// Errors surfaced by [`ResilientClient`](crate::ResilientClient).
///
/// Rate limits and server errors are retried inside the client; callers only see
/// `Transient` once the attempts are spent.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The upstream asked us to slow down.
    #[error("rate limited by upstream (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    /// The key has no usable result; cached for the rest of the run.
    #[error("no result upstream")]
    NotFound,
    /// Server errors, network failures or rate limits that outlasted every attempt.
    #[error("transient upstream failure after {attempts} attempt(s) (last status: {status:?})")]
    Transient { status: Option<u16>, attempts: u32 },
    /// The upstream rejected the request itself; retrying will not help.
    #[error("upstream rejected the request with status {status}")]
    Client { status: u16 },
    /// The circuit breaker is open; no call was made.
    #[error("circuit breaker open, upstream call skipped")]
    CircuitOpen,
    /// Credentials were rejected. Fatal for the process.
    #[error("upstream authentication failed with status {status}")]
    Auth { status: u16 },
    /// A payload or fixture could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
    /// The HTTP client could not be constructed.
    #[error("transport setup failed: {0}")]
    Setup(String),
    /// Cache persistence failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApiError {
    /// Errors that must stop the whole run rather than fail one item.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ApiError::Auth { .. })
    }

    /// Errors worth another attempt after a delay.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::RateLimited { .. } | ApiError::Transient { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_auth_is_fatal() {
        assert!(ApiError::Auth { status: 401 }.is_fatal());
        assert!(!ApiError::NotFound.is_fatal());
        assert!(!ApiError::CircuitOpen.is_fatal());
        assert!(!ApiError::Transient { status: Some(503), attempts: 5 }.is_fatal());
    }

    #[test]
    fn retryable_classification() {
        assert!(ApiError::RateLimited { retry_after: None }.is_retryable());
        assert!(ApiError::Transient { status: None, attempts: 1 }.is_retryable());
        assert!(!ApiError::Client { status: 400 }.is_retryable());
        assert!(!ApiError::NotFound.is_retryable());
    }

    #[test]
    fn error_messages_carry_status() {
        let err = ApiError::Transient { status: Some(502), attempts: 3 };
        assert!(err.to_string().contains("3 attempt"));
        assert!(err.to_string().contains("502"));
        assert!(ApiError::Auth { status: 403 }.to_string().contains("403"));
    }

    #[test]
    fn store_errors_convert() {
        let err: ApiError = StoreError::backend("disk full").into();
        assert!(matches!(err, ApiError::Store(_)));
        assert!(err.to_string().contains("disk full"));
    }
}
