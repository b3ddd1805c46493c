//! Error types for permafrost-engine
//!
//! Wraps the database error taxonomy and adds the engine-side kinds:
//! filesystem failures from CSV export, configuration problems, and
//! cooperative cancellation. Cancellation is its own kind so the retry layer
//! never mistakes it for a transient failure.

use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, ArchiveError>;

/// Main error type for the archive engine
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// Database-layer error
    #[error(transparent)]
    Db(#[from] permafrost_db::Error),

    /// Filesystem error during CSV export
    #[error("filesystem error: {message}")]
    Filesystem {
        /// What failed
        message: String,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Cooperative cancellation was observed
    #[error("operation cancelled")]
    Cancelled,
}

impl ArchiveError {
    /// Create a filesystem error
    pub fn fs(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Filesystem {
            message: message.into(),
            source,
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Whether this error may succeed if the operation is retried
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Db(e) => e.is_retriable(),
            Self::Filesystem { .. } | Self::Configuration(_) | Self::Cancelled => false,
        }
    }

    /// Whether this error is a cancellation
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Display form of the innermost cause, for operator-facing messages
    pub fn base_cause(&self) -> String {
        let mut current: &dyn std::error::Error = self;
        while let Some(source) = current.source() {
            current = source;
        }
        current.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(ArchiveError::from(permafrost_db::Error::Deadlock).is_retriable());
        assert!(ArchiveError::from(permafrost_db::Error::connection("reset")).is_retriable());

        // timeouts are structural, cancellation is cooperative: neither retries
        assert!(!ArchiveError::from(permafrost_db::Error::timeout("bulk load")).is_retriable());
        assert!(!ArchiveError::Cancelled.is_retriable());
        assert!(!ArchiveError::config("bad setting").is_retriable());
        assert!(!ArchiveError::fs(
            "create dir",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied")
        )
        .is_retriable());
    }

    #[test]
    fn test_base_cause_walks_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err = ArchiveError::fs("write part file", io);
        assert_eq!(err.base_cause(), "disk full");

        let err = ArchiveError::Cancelled;
        assert_eq!(err.base_cause(), "operation cancelled");
    }
}
