//! Error types for tabsync
//!
//! Malformed client input (bad filters, invalid field indices, unknown
//! projection entries) never becomes an error: it is normalized into a
//! degraded but valid request. What remains here are failures the immediate
//! caller has to decide about.

use thiserror::Error;

/// Result type alias for tabsync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for tabsync
#[derive(Error, Debug)]
pub enum Error {
    /// Credentials did not match any source
    #[error("unauthorized")]
    Unauthorized,

    /// Configuration is missing or invalid
    #[error("configuration error: {0}")]
    Config(String),

    /// An instance does not fit the source it was pushed to
    #[error("invalid instance: {0}")]
    InvalidInstance(String),

    /// Database failure (pool, query, write)
    #[error(transparent)]
    Database(#[from] tabsync_rdbc::Error),

    /// The external platform rejected or never received a forward call
    #[error("forward failed: {message}")]
    Forward {
        /// Failure description
        message: String,
        /// HTTP status, when a response was received
        status: Option<u16>,
    },

    /// MQTT client failure
    #[error("mqtt error: {0}")]
    Mqtt(String),

    /// JSON encoding or decoding failure
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a forward error
    pub fn forward(message: impl Into<String>, status: Option<u16>) -> Self {
        Self::Forward {
            message: message.into(),
            status,
        }
    }

    /// Whether retrying the same operation later may succeed
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Forward { .. } | Self::Mqtt(_) => true,
            Self::Database(e) => e.is_retriable(),
            _ => false,
        }
    }

    /// Text safe to show to an end user.
    ///
    /// Authorization failures are uniform; everything else is reported as a
    /// generic failure so internal details never leak.
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            _ => "internal error",
        }
    }
}
