//! Shared database handle
//!
//! One pool and one dialect serve every source and every operation kind.

use std::sync::Arc;
use std::time::Duration;
use tabsync_rdbc::connection::ConnectionFactory;
use tabsync_rdbc::dialect::{PostgresDialect, SqlDialect};
use tabsync_rdbc::pool::{ConnectionPool, PoolConfig, SimpleConnectionPool};
use tracing::info;

use crate::config::DatabaseSettings;
use crate::error::{Error, Result};
use crate::field::Instance;
use crate::registry::Source;

/// Pool plus the dialect used to render statements for it
#[derive(Clone)]
pub struct Database {
    pool: Arc<dyn ConnectionPool>,
    dialect: Arc<dyn SqlDialect>,
}

impl Database {
    /// Wrap an existing pool
    pub fn new(pool: Arc<dyn ConnectionPool>, dialect: Arc<dyn SqlDialect>) -> Self {
        Self { pool, dialect }
    }

    /// Build a pool over `factory` from settings, using the PostgreSQL dialect
    pub async fn connect(
        settings: &DatabaseSettings,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Result<Self> {
        let config = PoolConfig::new(settings.url.expose_secret())
            .with_min_size(settings.min_connections as usize)
            .with_max_size(settings.max_connections as usize)
            .with_acquire_timeout(Duration::from_secs(settings.acquire_timeout_secs))
            .with_max_lifetime(Duration::from_secs(settings.max_lifetime_secs))
            .with_idle_timeout(Duration::from_secs(settings.idle_timeout_secs));
        let pool = SimpleConnectionPool::new(config, factory).await?;
        Ok(Self::new(pool, Arc::new(PostgresDialect)))
    }

    /// Build a PostgreSQL-backed database from settings
    pub async fn connect_postgres(settings: &DatabaseSettings) -> Result<Self> {
        Self::connect(settings, Arc::new(tabsync_rdbc::postgres::PgConnectionFactory)).await
    }

    /// The shared pool
    #[inline]
    pub fn pool(&self) -> &Arc<dyn ConnectionPool> {
        &self.pool
    }

    /// The dialect statements are rendered with
    #[inline]
    pub fn dialect(&self) -> &dyn SqlDialect {
        self.dialect.as_ref()
    }

    /// Write one instance as a new row of the source's table
    pub async fn insert(&self, source: &Source, instance: &Instance) -> Result<()> {
        let fields = source.fields();
        if instance.len() != fields.len() {
            return Err(Error::InvalidInstance(format!(
                "expected {} values, got {}",
                fields.len(),
                instance.len()
            )));
        }

        let columns: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
        let sql = self.dialect.build_insert(source.table(), &columns);
        let (sql, params) = self.dialect.render(&sql, instance.values().to_vec())?;

        let conn = self.pool.get().await?;
        conn.execute(&sql, &params).await?;
        Ok(())
    }

    /// Close pooled connections
    pub async fn close(&self) -> Result<()> {
        self.pool.close().await?;
        let stats = self.pool.stats();
        info!(
            opened = stats.opened,
            closed = stats.closed,
            acquired = stats.acquired,
            timed_out = stats.timed_out,
            failed_health_checks = stats.failed_health_checks,
            abandoned_cursors = stats.abandoned_cursors,
            "database pool closed"
        );
        Ok(())
    }
}
