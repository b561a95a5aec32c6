//! Error types for the shared circuit breaker.
//!
//! Three error families exist, with strictly separated audiences:
//!
//! - [`CircuitError`]: the only errors a caller of
//!   [`CircuitEngine::execute`](crate::engine::CircuitEngine::execute) can
//!   observe besides the guarded call's own error.
//! - [`ConfigError`]: construction-time validation failures.
//! - [`StoreError`]: faults inside the store seam. These are recovered
//!   internally (reads degrade to "absent", writes become best-effort, lease
//!   acquisition fails open) and never escape `execute`.
//!
//! # Examples
//!
//! ```
//! use shared_breaker::error::CircuitError;
//!
//! fn describe<E: std::fmt::Display>(err: &CircuitError<E>) -> String {
//!     match err {
//!         CircuitError::Open { retry_after } => format!("open, retry in {retry_after:?}"),
//!         CircuitError::Isolated => "isolated by an operator".to_owned(),
//!         CircuitError::Inner(e) => format!("call failed: {e}"),
//!     }
//! }
//! ```

use std::time::Duration;

use thiserror::Error;

/// Result type alias for store-backend operations.
///
/// Used by [`StoreBackend`](crate::store::StoreBackend) implementations. The
/// [`StateStore`](crate::store::StateStore) façade absorbs these errors; code
/// above the store seam never handles them.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Fast-fail errors surfaced by the circuit engine.
///
/// A caller of `execute` sees exactly three outcome classes: the guarded
/// call's own result, the guarded call's own error (wrapped transparently in
/// [`Inner`](Self::Inner)), or one of the two fast-fail variants below.
/// Nothing else leaks.
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    /// The circuit is open; the guarded call was not invoked.
    ///
    /// `retry_after` is the remaining time until the circuit will permit a
    /// probe. It is `None` only when the shared record carried no usable
    /// blocked-until instant.
    ///
    /// # Recovery
    ///
    /// Serve a fallback, or retry after `retry_after` has elapsed — the next
    /// call past that point attempts a half-open probe automatically.
    #[error("circuit is open; calls are failing fast")]
    Open {
        /// Time remaining until a probe becomes possible.
        retry_after: Option<Duration>,
    },

    /// The circuit was isolated by an operator; the guarded call was not
    /// invoked.
    ///
    /// Isolation never recovers automatically. Only
    /// [`reset`](crate::engine::CircuitEngine::reset) re-enables the circuit.
    #[error("circuit is isolated; automatic recovery is disabled")]
    Isolated,

    /// The guarded call ran and failed.
    ///
    /// The failure was recorded against the shared health window before being
    /// re-raised unchanged.
    #[error(transparent)]
    Inner(E),
}

/// Configuration rejected at engine construction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid circuit configuration: {0}")]
pub struct ConfigError(String);

impl ConfigError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Faults raised by a store backend.
///
/// Every variant is treated identically by the [`StateStore`](crate::store::StateStore)
/// façade: logged at warning level and translated into a neutral signal. The
/// type is public so that custom [`StoreBackend`](crate::store::StoreBackend)
/// implementations can produce it.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The operation did not complete within the configured store timeout.
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    /// The Redis client reported an error (connection refused, protocol
    /// fault, script failure).
    #[error("store backend error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The backend is unreachable or deliberately offline.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_error_display() {
        let err: CircuitError<String> =
            CircuitError::Open { retry_after: Some(Duration::from_secs(30)) };
        assert_eq!(err.to_string(), "circuit is open; calls are failing fast");
    }

    #[test]
    fn test_isolated_error_display() {
        let err: CircuitError<String> = CircuitError::Isolated;
        assert!(err.to_string().contains("isolated"));
    }

    #[test]
    fn test_inner_error_is_transparent() {
        let err: CircuitError<String> = CircuitError::Inner("backend exploded".to_owned());
        assert_eq!(err.to_string(), "backend exploded");
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::new("failure_threshold must lie in [0, 1]");
        assert_eq!(
            err.to_string(),
            "invalid circuit configuration: failure_threshold must lie in [0, 1]"
        );
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::Unavailable("connection pool drained".to_owned());
        assert!(err.to_string().contains("store unavailable"));

        let err = StoreError::Timeout(Duration::from_secs(5));
        assert!(err.to_string().contains("timed out"));
    }
}
