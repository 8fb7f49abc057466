//! Error types for tabsync-rdbc
//!
//! A lost connection or an exhausted pool may clear up on its own, so callers
//! can retry those. A rejected statement or a broken cursor transaction will
//! fail the same way again.

use thiserror::Error;

/// Result type for tabsync-rdbc operations
pub type Result<T> = std::result::Result<T, Error>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Database access failure
#[derive(Error, Debug)]
pub enum Error {
    /// Opening, validating or talking to a connection failed
    #[error("connection error: {message}")]
    Connection {
        /// What went wrong
        message: String,
        /// Driver error, if any
        #[source]
        source: Option<BoxError>,
    },

    /// The backend rejected a statement
    #[error("query error: {message}")]
    Query {
        /// What went wrong
        message: String,
        /// Statement text, kept for logs only
        sql: Option<String>,
    },

    /// Cursor transaction could not be started, advanced or finished
    #[error("transaction error: {0}")]
    Transaction(String),

    /// Pool or connection settings are unusable
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No connection became available within the acquire timeout
    #[error("pool exhausted: {0}")]
    PoolExhausted(String),
}

impl Error {
    /// Whether the same call may succeed later without any change
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::PoolExhausted(_))
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error wrapping a driver error
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
        }
    }

    /// Create a query error that remembers the offending statement
    pub fn query_with_sql(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: Some(sql.into()),
        }
    }

    /// Create a transaction error
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction(message.into())
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create a pool exhaustion error
    pub fn pool_exhausted(message: impl Into<String>) -> Self {
        Self::PoolExhausted(message.into())
    }
}
