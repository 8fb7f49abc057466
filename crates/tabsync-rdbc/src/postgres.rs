//! PostgreSQL backend implementation for tabsync-rdbc
//!
//! - Connection over tokio-postgres
//! - Server-side cursors (`DECLARE ... NO SCROLL CURSOR`) for streaming reads
//! - Column decoding into the [`Value`] model

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::types::{ToSql, Type};
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory, Cursor};
use crate::error::{Error, Result};
use crate::types::{Row, Value};

/// Convert a Value to a tokio-postgres compatible parameter
fn value_to_sql(value: &Value) -> Box<dyn ToSql + Sync + Send> {
    match value {
        Value::Null => Box::new(Option::<String>::None),
        Value::Bool(b) => Box::new(*b),
        Value::Int64(n) => Box::new(*n),
        Value::Float64(n) => Box::new(*n),
        Value::String(s) => Box::new(s.clone()),
        Value::DateTime(dt) => Box::new(*dt),
    }
}

fn boxed_params(params: &[Value]) -> Vec<Box<dyn ToSql + Sync + Send>> {
    params.iter().map(value_to_sql).collect()
}

fn param_refs(boxed: &[Box<dyn ToSql + Sync + Send>]) -> Vec<&(dyn ToSql + Sync)> {
    boxed
        .iter()
        .map(|b| b.as_ref() as &(dyn ToSql + Sync))
        .collect()
}

/// Convert a tokio-postgres row to a Row
fn pg_row_to_row(pg_row: &tokio_postgres::Row) -> Row {
    let columns: Vec<String> = pg_row
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();

    let values: Vec<Value> = pg_row
        .columns()
        .iter()
        .enumerate()
        .map(|(i, col)| pg_value_to_value(pg_row, i, col.type_()))
        .collect();

    Row::new(columns, values)
}

fn get<'a, T>(row: &'a tokio_postgres::Row, idx: usize) -> Option<T>
where
    T: tokio_postgres::types::FromSql<'a>,
{
    row.try_get::<_, Option<T>>(idx).ok().flatten()
}

/// Convert a PostgreSQL column to a Value; unreadable values become NULL
fn pg_value_to_value(row: &tokio_postgres::Row, idx: usize, pg_type: &Type) -> Value {
    let value = match *pg_type {
        Type::BOOL => get::<bool>(row, idx).map(Value::Bool),
        Type::INT2 => get::<i16>(row, idx).map(|n| Value::Int64(n.into())),
        Type::INT4 => get::<i32>(row, idx).map(|n| Value::Int64(n.into())),
        Type::INT8 => get::<i64>(row, idx).map(Value::Int64),
        Type::FLOAT4 => get::<f32>(row, idx).map(|n| Value::Float64(n.into())),
        Type::FLOAT8 => get::<f64>(row, idx).map(Value::Float64),
        Type::NUMERIC => get::<rust_decimal::Decimal>(row, idx)
            .and_then(|d| d.to_f64())
            .map(Value::Float64),
        Type::DATE => get::<NaiveDate>(row, idx)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| Value::DateTime(dt.and_utc())),
        Type::TIMESTAMP => get::<NaiveDateTime>(row, idx).map(|dt| Value::DateTime(dt.and_utc())),
        Type::TIMESTAMPTZ => get::<DateTime<Utc>>(row, idx).map(Value::DateTime),
        Type::JSON | Type::JSONB => {
            get::<serde_json::Value>(row, idx).map(|j| Value::String(j.to_string()))
        }
        _ => get::<String>(row, idx).map(Value::String),
    };
    value.unwrap_or(Value::Null)
}

fn query_error(e: tokio_postgres::Error, sql: &str) -> Error {
    Error::query_with_sql(e.to_string(), sql)
}

fn transaction_error(e: tokio_postgres::Error) -> Error {
    Error::transaction(e.to_string())
}

/// PostgreSQL connection implementation
pub struct PgConnection {
    client: Arc<tokio_postgres::Client>,
    closed: AtomicBool,
    cursor_seq: AtomicU64,
}

impl PgConnection {
    /// Create a new connection from a tokio-postgres client
    pub fn new(client: tokio_postgres::Client) -> Self {
        Self {
            client: Arc::new(client),
            closed: AtomicBool::new(false),
            cursor_seq: AtomicU64::new(0),
        }
    }

    /// Get the underlying client
    pub fn client(&self) -> &tokio_postgres::Client {
        &self.client
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) || self.client.is_closed() {
            return Err(Error::connection("connection is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for PgConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.ensure_open()?;

        let boxed = boxed_params(params);
        let pg_rows = self
            .client
            .query(sql, &param_refs(&boxed))
            .await
            .map_err(|e| query_error(e, sql))?;

        Ok(pg_rows.iter().map(pg_row_to_row).collect())
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.ensure_open()?;

        let boxed = boxed_params(params);
        self.client
            .execute(sql, &param_refs(&boxed))
            .await
            .map_err(|e| query_error(e, sql))
    }

    async fn open_cursor(&self, sql: &str, params: &[Value]) -> Result<Box<dyn Cursor>> {
        self.ensure_open()?;

        let name = format!(
            "tabsync_cursor_{}",
            self.cursor_seq.fetch_add(1, Ordering::Relaxed)
        );

        // Cursors only live inside a transaction block.
        self.client
            .batch_execute("BEGIN")
            .await
            .map_err(transaction_error)?;

        let declare = format!("DECLARE {} NO SCROLL CURSOR FOR {}", name, sql);
        let boxed = boxed_params(params);
        if let Err(e) = self.client.execute(&declare, &param_refs(&boxed)).await {
            let _ = self.client.batch_execute("ROLLBACK").await;
            return Err(query_error(e, sql));
        }

        debug!(cursor = %name, "declared cursor");

        Ok(Box::new(PgCursor {
            client: Arc::clone(&self.client),
            name,
            failed: false,
        }))
    }

    async fn is_valid(&self) -> bool {
        if self.ensure_open().is_err() {
            return false;
        }
        self.client.simple_query("SELECT 1").await.is_ok()
    }

    /// Marks the connection closed. The session itself ends when the last
    /// handle to the client is dropped, which also aborts any transaction a
    /// dropped cursor left open.
    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// Server-side cursor bound to the transaction that declared it
pub struct PgCursor {
    client: Arc<tokio_postgres::Client>,
    name: String,
    failed: bool,
}

#[async_trait]
impl Cursor for PgCursor {
    async fn fetch(&mut self, max_rows: usize) -> Result<Vec<Row>> {
        let sql = format!("FETCH FORWARD {} FROM {}", max_rows, self.name);
        match self.client.query(&sql, &[]).await {
            Ok(rows) => Ok(rows.iter().map(pg_row_to_row).collect()),
            Err(e) => {
                self.failed = true;
                Err(query_error(e, &sql))
            }
        }
    }

    async fn close(self: Box<Self>) -> Result<()> {
        if self.failed {
            return self
                .client
                .batch_execute("ROLLBACK")
                .await
                .map_err(transaction_error);
        }

        let sql = format!("CLOSE {}; COMMIT", self.name);
        if let Err(e) = self.client.batch_execute(&sql).await {
            warn!(cursor = %self.name, error = %e, "failed to close cursor, rolling back");
            let _ = self.client.batch_execute("ROLLBACK").await;
            return Err(transaction_error(e));
        }
        Ok(())
    }
}

/// PostgreSQL connection factory
pub struct PgConnectionFactory;

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let mut pg_config: tokio_postgres::Config = config
            .url
            .parse()
            .map_err(|e| Error::connection_with_source("invalid connection url", e))?;
        pg_config.connect_timeout(Duration::from_millis(config.connect_timeout_ms));
        if let Some(app) = &config.application_name {
            pg_config.application_name(app);
        }

        let (client, connection) = pg_config
            .connect(tokio_postgres::NoTls)
            .await
            .map_err(|e| Error::connection_with_source("failed to connect", e))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "postgres connection terminated");
            }
        });

        Ok(Box::new(PgConnection::new(client)))
    }
}
