//! Error types for the limiter.

use std::time::Duration;

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for limiter operations.
///
/// A rate-limit rejection is not an error: it is reported through
/// [`Outcome::Wait`](crate::ratelimit::Outcome::Wait).
#[derive(Error, Debug)]
pub enum LimiterError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Backing store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Prefix and unique key were both blank after sanitizing
    #[error("Key prefix and unique key cannot both be blank")]
    InvalidKey,

    /// The amount to consume was NaN or infinite
    #[error("Invalid amount to consume: {0}")]
    InvalidAmount(f64),

    /// The advisory lock could not be acquired within its bound
    #[error("Unable to acquire lock for {key} after {attempts} attempts")]
    LockTimeout { key: String, attempts: u32 },

    /// The compare-and-swap loop was beaten by other writers until its bound ran out
    #[error("Unable to update {key} after {attempts} contended attempts")]
    Contention { key: String, attempts: u32 },

    /// The blocking wrapper gave up waiting
    #[error("Timed out waiting for {key} after {waited:?}")]
    WaitTimeout { key: String, waited: Duration },

    /// The request can never fit in the quota
    #[error("Cannot consume {requested} from {key}: exceeds max_requests {max_requests}")]
    Unsatisfiable {
        key: String,
        requested: f64,
        max_requests: f64,
    },
}

impl LimiterError {
    /// Whether this is a lock or CAS failure, i.e. a transient infrastructure
    /// error rather than a decision about the caller.
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            LimiterError::LockTimeout { .. } | LimiterError::Contention { .. }
        )
    }
}

/// Result type alias for limiter operations.
pub type Result<T> = std::result::Result<T, LimiterError>;
