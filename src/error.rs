//! Crate-level error type.
//!
//! Store failures are wrapped as [`Error::Storage`]. The structural variants
//! name the queue or connection an operation failed on, so that a caller of
//! [`Cleaner::clean`](crate::Cleaner::clean) can diagnose and re-run.

use thiserror::Error;

use crate::storage::StorageError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// The shared store failed or is unreachable
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("failed to open queue {queue}: {source}")]
    QueueOpen {
        queue: String,
        #[source]
        source: StorageError,
    },

    #[error("failed to close queue {queue} in connection {connection}: {source}")]
    QueueClose {
        queue: String,
        connection: String,
        #[source]
        source: StorageError,
    },

    #[error("failed to close connection {connection}: {source}")]
    ConnectionClose {
        connection: String,
        #[source]
        source: StorageError,
    },

    /// The connection was no longer registered; another actor closed it first
    #[error("connection {0} was already closed")]
    ConnectionAlreadyClosed(String),

    /// A queue or connection name that cannot be embedded in store keys
    #[error("invalid name: {0:?}")]
    InvalidName(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("queue {0} is already consuming")]
    AlreadyConsuming(String),

    #[error("queue {0} is not consuming")]
    NotConsuming(String),

    /// Recovering a dead connection failed; it stays registered for the
    /// next sweep
    #[error("failed to clean connection {connection}: {source}")]
    ConnectionClean {
        connection: String,
        #[source]
        source: Box<Error>,
    },

    /// One or more dead connections could not be cleaned
    #[error("cleanup finished with {} failure(s): {}", .0.len(), join(.0))]
    Cleanup(Vec<Error>),
}

fn join(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Soft failures mean a concurrent actor already did the work.
    pub fn is_soft(&self) -> bool {
        matches!(self, Error::ConnectionAlreadyClosed(_))
    }

    /// Returns true if the failure was caused by a transient store outage.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Storage(e)
            | Error::QueueOpen { source: e, .. }
            | Error::QueueClose { source: e, .. }
            | Error::ConnectionClose { source: e, .. } => e.is_retryable(),
            Error::ConnectionClean { source, .. } => source.is_retryable(),
            Error::Cleanup(errors) => errors.iter().all(Error::is_retryable),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanup_names_every_failed_connection() {
        let err = Error::Cleanup(vec![
            Error::ConnectionClean {
                connection: "dead-aaaaaa".into(),
                source: Box::new(Error::Storage(StorageError::Unavailable("boom".into()))),
            },
            Error::ConnectionClean {
                connection: "dead-bbbbbb".into(),
                source: Box::new(Error::QueueClose {
                    queue: "jobs".into(),
                    connection: "dead-bbbbbb".into(),
                    source: StorageError::Internal("oops".into()),
                }),
            },
        ]);

        let text = err.to_string();
        assert!(text.starts_with("cleanup finished with 2 failure(s)"));
        assert!(text.contains("failed to clean connection dead-aaaaaa: store unavailable: boom"));
        assert!(text.contains("queue jobs in connection dead-bbbbbb"));
        // one non-retryable failure makes the whole sweep non-retryable
        assert!(!err.is_retryable());
    }
}
