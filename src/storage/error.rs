//! Store-level error types.
//!
//! Every [`Store`](super::Store) implementation maps its client errors onto
//! [`StorageError`] so that queue, connection and cleaner code can treat
//! failures of the shared store uniformly.

use thiserror::Error;

/// Errors that can occur while talking to the shared store.
///
/// # Examples
///
/// ```rust
/// use rmq::storage::StorageError;
///
/// fn handle_error(err: StorageError) {
///     if err.is_retryable() {
///         // store unreachable, retry on the next pass
///         eprintln!("transient: {}", err);
///     } else {
///         eprintln!("error: {}", err);
///     }
/// }
/// ```
#[derive(Error, Debug)]
pub enum StorageError {
    /// Store is unavailable (connection lost, pool exhausted, server down)
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A key holds a value of a different type than the operation expects
    #[error("wrong type for key {0}")]
    WrongType(String),

    /// Internal store error
    #[error("internal error: {0}")]
    Internal(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Timeout during operation
    #[error("operation timeout: {0}")]
    Timeout(String),
}

impl StorageError {
    /// Returns true if this error is potentially recoverable with a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Unavailable(_) | StorageError::Timeout(_))
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for StorageError {
    fn from(err: redis::RedisError) -> Self {
        if err.code() == Some("WRONGTYPE") {
            return StorageError::WrongType(err.to_string());
        }
        if err.is_timeout() {
            return StorageError::Timeout(err.to_string());
        }
        if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
            return StorageError::Unavailable(err.to_string());
        }
        // server error replies and client-side decoding failures
        StorageError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(StorageError::Unavailable("down".into()).is_retryable());
        assert!(StorageError::Timeout("slow".into()).is_retryable());
        assert!(!StorageError::WrongType("rmq::queues".into()).is_retryable());
        assert!(!StorageError::Configuration("bad url".into()).is_retryable());
    }

    #[cfg(feature = "redis")]
    #[test]
    fn only_connection_failures_are_unavailable() {
        use redis::{ErrorKind, RedisError};

        let refused = RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        ));
        assert!(matches!(StorageError::from(refused), StorageError::Unavailable(_)));

        let unknown_command =
            RedisError::from((ErrorKind::ResponseError, "An error was signalled by the server"));
        let err = StorageError::from(unknown_command);
        assert!(matches!(err, StorageError::Internal(_)));
        assert!(!err.is_retryable());

        let no_script = RedisError::from((ErrorKind::NoScriptError, "NOSCRIPT"));
        assert!(matches!(StorageError::from(no_script), StorageError::Internal(_)));

        let decoding = RedisError::from((ErrorKind::TypeError, "Response was of incompatible type"));
        assert!(matches!(StorageError::from(decoding), StorageError::Internal(_)));
    }
}
