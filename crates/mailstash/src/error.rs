//! Error taxonomy for the sync engine
//!
//! Every remote and store failure is mapped into one of these variants so
//! that retry policy can dispatch on the variant rather than on message
//! text. Only the sync engine writes errors to the per-account cursor.

use thiserror::Error;

/// Engine-wide error type
#[derive(Debug, Error)]
pub enum EngineError {
    /// Missing or malformed required configuration. Fatal to the process.
    #[error("configuration error: {0}")]
    Config(String),

    /// Credential invalid and refresh impossible. Fatal to the tick.
    #[error("authentication failed: {0}")]
    AuthFailure(String),

    /// Credential rejected by the provider. The engine refreshes once and
    /// retries before escalating to [`EngineError::AuthFailure`].
    #[error("credential rejected: {0}")]
    Unauthorized(String),

    /// Transport-level failure talking to the provider. Transient.
    #[error("network error: {0}")]
    Network(String),

    /// The provider asked us to slow down. Transient, longer backoff.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The provider response was malformed or violated its own contract.
    /// Fatal to the tick, never retried.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The archive store is unreachable or busy. Transient.
    #[error("archive store unavailable: {0}")]
    StoreUnavailable(String),

    /// An upsert conflict the schema should have made impossible.
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    /// The caller cancelled the operation. Clean abort; never recorded
    /// on the cursor.
    #[error("operation cancelled")]
    Cancelled,

    /// A full sync pass is already in flight for this account.
    #[error("a sync pass is already running for this account")]
    SyncInProgress,
}

impl EngineError {
    /// Whether the retry loop should attempt this operation again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Network(_)
                | EngineError::RateLimited(_)
                | EngineError::StoreUnavailable(_)
        )
    }

    /// Whether backoff should start from the longer rate-limit delay.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, EngineError::RateLimited(_))
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                EngineError::IntegrityViolation(err.to_string())
            }
            _ => EngineError::StoreUnavailable(err.to_string()),
        }
    }
}

/// Convenience alias used throughout the engine.
pub type Result<T> = std::result::Result<T, EngineError>;
