//! Error types for permafrost-db
//!
//! Provides granular error classification for proper retry handling:
//! - Retriable errors (dropped connections, deadlock victims)
//! - Non-retriable errors (configuration, query timeouts, type errors)
//!
//! Query timeouts are deliberately *not* retriable: a statement that blows
//! its timeout indicates a structural problem (missing index, runaway scan)
//! that a retry will only repeat.

use std::fmt;
use thiserror::Error;

/// Result type for permafrost-db operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Configuration error (bad identifiers, empty connection strings)
    Configuration,
    /// Connection-related errors (retriable)
    Connection,
    /// Query execution errors
    Query,
    /// Deadlock victim (retriable)
    Deadlock,
    /// Command timeout (structural, not retriable)
    Timeout,
    /// Type conversion errors
    TypeConversion,
    /// Schema-related errors
    Schema,
    /// Unsupported operation for this backend
    Unsupported,
}

impl ErrorCategory {
    /// Whether errors in this category are generally retriable
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Connection | Self::Deadlock)
    }
}

/// Main error type for permafrost-db
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration {
        /// What is misconfigured
        message: String,
    },

    /// Connection failed or was dropped mid-operation
    #[error("connection error: {message}")]
    Connection {
        /// Driver-level description
        message: String,
        /// Underlying driver error, when available
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Query execution failed
    #[error("query error: {message}")]
    Query {
        /// Driver-level description
        message: String,
        /// The statement that failed, when known
        sql: Option<String>,
        /// Underlying driver error, when available
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// This command was chosen as a deadlock victim
    #[error("deadlock victim")]
    Deadlock,

    /// Command timed out
    #[error("timeout: {message}")]
    Timeout {
        /// Which command timed out
        message: String,
    },

    /// Type conversion failed
    #[error("type conversion error: {message}")]
    TypeConversion {
        /// What could not be converted
        message: String,
    },

    /// Schema error (table not found, column mismatch)
    #[error("schema error: {message}")]
    Schema {
        /// What is wrong with the schema
        message: String,
    },

    /// Unsupported operation for this backend
    #[error("unsupported: {message}")]
    Unsupported {
        /// What was attempted
        message: String,
    },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Query { .. } => ErrorCategory::Query,
            Self::Deadlock => ErrorCategory::Deadlock,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::TypeConversion { .. } => ErrorCategory::TypeConversion,
            Self::Schema { .. } => ErrorCategory::Schema,
            Self::Unsupported { .. } => ErrorCategory::Unsupported,
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a query error
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: None,
            source: None,
        }
    }

    /// Create a query error with SQL
    pub fn query_with_sql(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: Some(sql.into()),
            source: None,
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a type conversion error
    pub fn type_conversion(message: impl Into<String>) -> Self {
        Self::TypeConversion {
            message: message.into(),
        }
    }

    /// Create a schema error
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
        }
    }

    /// Create an unsupported operation error
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Connection => write!(f, "connection"),
            Self::Query => write!(f, "query"),
            Self::Deadlock => write!(f, "deadlock"),
            Self::Timeout => write!(f, "timeout"),
            Self::TypeConversion => write!(f, "type_conversion"),
            Self::Schema => write!(f, "schema"),
            Self::Unsupported => write!(f, "unsupported"),
        }
    }
}
