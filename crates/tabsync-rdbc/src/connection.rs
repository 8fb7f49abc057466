//! Connection traits for tabsync-rdbc
//!
//! A backend supplies a [`ConnectionFactory`]; the pool owns the connections
//! it creates. Reads that may return many rows go through a [`Cursor`], which
//! fetches in batches instead of materializing the result.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Row, Value};

/// An open database session
#[async_trait]
pub trait Connection: Send + Sync {
    /// Run a statement and collect every row it returns
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Run a statement and return the number of rows it touched
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// First row of `sql`, if any
    async fn query_one(&self, sql: &str, params: &[Value]) -> Result<Option<Row>> {
        Ok(self.query(sql, params).await?.into_iter().next())
    }

    /// Start a forward-only cursor over `sql`.
    ///
    /// The session belongs to the cursor until [`Cursor::close`] completes.
    /// A failed open must leave the session outside any transaction. Pooled
    /// callers go through `PooledConnection::open_cursor`, which keeps the
    /// pool from lending out a session that still has a cursor on it.
    async fn open_cursor(&self, sql: &str, params: &[Value]) -> Result<Box<dyn Cursor>>;

    /// Cheap liveness check
    async fn is_valid(&self) -> bool;

    /// Stop using the session
    async fn close(&self) -> Result<()>;
}

/// Forward-only cursor
#[async_trait]
pub trait Cursor: Send {
    /// Up to `max_rows` further rows; an empty batch means the end
    async fn fetch(&mut self, max_rows: usize) -> Result<Vec<Row>>;

    /// Release the cursor and finish the transaction behind it
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Where and how to open connections
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Backend URL; may carry a password
    pub url: String,
    /// Give up opening a connection after this many milliseconds
    pub connect_timeout_ms: u64,
    /// Reported to the server so sessions can be told apart
    pub application_name: Option<String>,
}

impl ConnectionConfig {
    /// Defaults for `url`
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    fn redacted_url(&self) -> String {
        match url::Url::parse(&self.url) {
            Ok(mut parsed) if parsed.password().is_some() => {
                // Only fails for URLs that cannot carry credentials at all.
                let _ = parsed.set_password(Some("***"));
                parsed.to_string()
            }
            Ok(parsed) => parsed.to_string(),
            Err(_) => "***".to_string(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            connect_timeout_ms: 10_000,
            application_name: Some("tabsync".into()),
        }
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("url", &self.redacted_url())
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("application_name", &self.application_name)
            .finish()
    }
}

/// Opens connections for a pool
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Open one connection
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>>;
}
