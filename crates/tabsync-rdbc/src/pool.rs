//! Connection pool for tabsync-rdbc
//!
//! One pool serves ingestion writes, queries and counts for every source.
//! Borrowers hold a [`PooledConnection`] guard; dropping it hands the
//! connection back.
//!
//! Cursors must be opened through [`PooledConnection::open_cursor`]. A
//! connection whose cursor was never closed may still be inside the cursor's
//! transaction, so the pool closes it instead of lending it out again. That
//! keeps an abandoned query (a dropped future, a caller timeout) from leaking
//! its transaction into the next borrower's writes.
//!
//! ```rust,ignore
//! let conn = pool.get().await?;
//! let mut cursor = conn.open_cursor("SELECT * FROM \"readings\"", &[]).await?;
//! while !cursor.fetch(100).await?.is_empty() {}
//! cursor.close().await?;
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory, Cursor};
use crate::error::{Error, Result};
use crate::types::{Row, Value};

/// Connection pool trait
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Borrow a connection, waiting at most the configured acquire timeout
    async fn get(&self) -> Result<PooledConnection>;

    /// Take back a borrowed connection.
    ///
    /// With `reuse == false` the connection is closed rather than parked.
    async fn release(&self, conn: Box<dyn Connection>, created_at: Instant, reuse: bool);

    /// Connections currently open, borrowed or idle
    fn size(&self) -> usize;

    /// Counters since the pool was built
    fn stats(&self) -> PoolStats;

    /// Close idle connections and refuse further borrowing
    async fn close(&self) -> Result<()>;
}

/// A connection borrowed from the pool
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    created_at: Instant,
    cursor_open: AtomicBool,
    pool: Arc<dyn ConnectionPool>,
}

impl PooledConnection {
    pub(crate) fn new(
        conn: Box<dyn Connection>,
        created_at: Instant,
        pool: Arc<dyn ConnectionPool>,
    ) -> Self {
        Self {
            conn: Some(conn),
            created_at,
            cursor_open: AtomicBool::new(false),
            pool,
        }
    }

    /// Open a forward-only cursor tied to this borrow.
    ///
    /// The connection counts as busy from the moment the cursor is requested
    /// until [`PooledCursor::close`] succeeds. Only one cursor may be open at
    /// a time.
    pub async fn open_cursor(&self, sql: &str, params: &[Value]) -> Result<PooledCursor<'_>> {
        if self.cursor_open.swap(true, Ordering::AcqRel) {
            return Err(Error::transaction("connection already has an open cursor"));
        }

        let conn: &dyn Connection = &**self;
        match conn.open_cursor(sql, params).await {
            Ok(cursor) => Ok(PooledCursor {
                inner: Some(cursor),
                owner: self,
            }),
            Err(e) => {
                // A failed open leaves no transaction behind.
                self.cursor_open.store(false, Ordering::Release);
                Err(e)
            }
        }
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.conn
            .as_deref()
            .expect("connection is only taken when the guard drops")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let pool = Arc::clone(&self.pool);
            let created_at = self.created_at;
            let reuse = !self.cursor_open.load(Ordering::Acquire);
            tokio::spawn(async move {
                pool.release(conn, created_at, reuse).await;
            });
        }
    }
}

/// Cursor opened through [`PooledConnection::open_cursor`]
pub struct PooledCursor<'a> {
    inner: Option<Box<dyn Cursor>>,
    owner: &'a PooledConnection,
}

impl PooledCursor<'_> {
    /// Fetch up to `max_rows` rows; an empty batch means the end
    pub async fn fetch(&mut self, max_rows: usize) -> Result<Vec<Row>> {
        let Some(cursor) = self.inner.as_mut() else {
            return Err(Error::transaction("cursor already closed"));
        };
        cursor.fetch(max_rows).await
    }

    /// Close the cursor and end its transaction.
    ///
    /// If closing fails the connection stays marked busy and is discarded
    /// when its guard drops.
    pub async fn close(mut self) -> Result<()> {
        if let Some(cursor) = self.inner.take() {
            cursor.close().await?;
            self.owner.cursor_open.store(false, Ordering::Release);
        }
        Ok(())
    }
}

impl Drop for PooledCursor<'_> {
    fn drop(&mut self) {
        if self.inner.is_some() {
            debug!("cursor dropped before close, its connection will be discarded");
        }
    }
}

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// How each connection is opened
    pub connection: ConnectionConfig,
    /// Connections opened when the pool is built
    pub min_size: usize,
    /// Upper bound on open connections
    pub max_size: usize,
    /// How long `get` waits for a free slot
    pub acquire_timeout: Duration,
    /// Connections older than this are closed instead of lent out
    pub max_lifetime: Duration,
    /// Connections parked longer than this are closed instead of lent out
    pub idle_timeout: Duration,
    /// Run a liveness check before lending out a parked connection
    pub test_on_borrow: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            min_size: 1,
            max_size: 10,
            acquire_timeout: Duration::from_secs(30),
            max_lifetime: Duration::from_secs(30 * 60),
            idle_timeout: Duration::from_secs(10 * 60),
            test_on_borrow: true,
        }
    }
}

impl PoolConfig {
    /// Defaults for connections to `url`
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            connection: ConnectionConfig::new(url),
            ..Default::default()
        }
    }

    /// Set minimum pool size
    pub fn with_min_size(mut self, size: usize) -> Self {
        self.min_size = size;
        self
    }

    /// Set maximum pool size
    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Set acquire timeout
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set maximum connection lifetime
    pub fn with_max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    /// Set idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

/// Pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections opened
    pub opened: u64,
    /// Connections closed, for any reason
    pub closed: u64,
    /// Successful borrows
    pub acquired: u64,
    /// Borrows that gave up after the acquire timeout
    pub timed_out: u64,
    /// Parked connections that failed the liveness check
    pub failed_health_checks: u64,
    /// Connections discarded because a cursor on them was never closed
    pub abandoned_cursors: u64,
}

#[derive(Default)]
struct Counters {
    opened: AtomicU64,
    closed: AtomicU64,
    acquired: AtomicU64,
    timed_out: AtomicU64,
    failed_health_checks: AtomicU64,
    abandoned_cursors: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PoolStats {
        PoolStats {
            opened: self.opened.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            acquired: self.acquired.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            failed_health_checks: self.failed_health_checks.load(Ordering::Relaxed),
            abandoned_cursors: self.abandoned_cursors.load(Ordering::Relaxed),
        }
    }
}

struct PoolEntry {
    conn: Box<dyn Connection>,
    created_at: Instant,
    parked_at: Instant,
}

/// Semaphore-bounded connection pool.
///
/// At most `max_size` connections are open at once. A borrower that waits
/// longer than `acquire_timeout` gets [`Error::PoolExhausted`]. The idle list
/// is only locked to push or pop; validation and closing happen outside it.
pub struct SimpleConnectionPool {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    idle: Mutex<Vec<PoolEntry>>,
    slots: Semaphore,
    open: AtomicUsize,
    counters: Counters,
    closed: AtomicBool,
    me: Weak<Self>,
}

impl SimpleConnectionPool {
    /// Build a pool and open `min_size` connections.
    ///
    /// A failure while opening the initial connections is logged; the pool
    /// then opens connections on demand.
    pub async fn new(config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Result<Arc<Self>> {
        if config.max_size == 0 {
            return Err(Error::config("pool max_size must be at least 1"));
        }

        let pool = Arc::new_cyclic(|me| Self {
            slots: Semaphore::new(config.max_size),
            idle: Mutex::new(Vec::with_capacity(config.max_size)),
            config,
            factory,
            open: AtomicUsize::new(0),
            counters: Counters::default(),
            closed: AtomicBool::new(false),
            me: me.clone(),
        });

        for _ in 0..pool.config.min_size.min(pool.config.max_size) {
            match pool.open_connection().await {
                Ok(conn) => {
                    let now = Instant::now();
                    pool.idle.lock().push(PoolEntry {
                        conn,
                        created_at: now,
                        parked_at: now,
                    });
                }
                Err(e) => {
                    warn!(error = %e, "could not open initial pool connections");
                    break;
                }
            }
        }

        Ok(pool)
    }

    /// Pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Connections parked and ready to lend
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    async fn open_connection(&self) -> Result<Box<dyn Connection>> {
        let conn = self.factory.connect(&self.config.connection).await?;
        self.open.fetch_add(1, Ordering::AcqRel);
        Counters::bump(&self.counters.opened);
        debug!(open = self.size(), "opened database connection");
        Ok(conn)
    }

    async fn retire(&self, conn: Box<dyn Connection>) {
        if let Err(e) = conn.close().await {
            debug!(error = %e, "error while closing database connection");
        }
        drop(conn);
        self.open.fetch_sub(1, Ordering::AcqRel);
        Counters::bump(&self.counters.closed);
        debug!(open = self.size(), "closed database connection");
    }

    fn expired(&self, entry: &PoolEntry) -> bool {
        entry.created_at.elapsed() > self.config.max_lifetime
            || entry.parked_at.elapsed() > self.config.idle_timeout
    }

    /// A parked connection that is fit to lend, or `None` once the idle list is empty
    async fn take_idle(&self) -> Option<(Box<dyn Connection>, Instant)> {
        loop {
            let entry = self.idle.lock().pop()?;

            if self.expired(&entry) {
                self.retire(entry.conn).await;
                continue;
            }
            if self.config.test_on_borrow && !entry.conn.is_valid().await {
                Counters::bump(&self.counters.failed_health_checks);
                self.retire(entry.conn).await;
                continue;
            }
            return Some((entry.conn, entry.created_at));
        }
    }
}

#[async_trait]
impl ConnectionPool for SimpleConnectionPool {
    async fn get(&self) -> Result<PooledConnection> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::pool_exhausted("pool is closed"));
        }

        let permit = match tokio::time::timeout(self.config.acquire_timeout, self.slots.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::pool_exhausted("pool is closed")),
            Err(_) => {
                Counters::bump(&self.counters.timed_out);
                let waited_ms = self.config.acquire_timeout.as_millis() as u64;
                warn!(waited_ms, max_size = self.config.max_size, "no database connection available");
                return Err(Error::pool_exhausted(format!(
                    "no connection available after {}ms",
                    waited_ms
                )));
            }
        };

        let pool: Arc<dyn ConnectionPool> = self
            .me
            .upgrade()
            .ok_or_else(|| Error::pool_exhausted("pool is closed"))?;

        // The permit goes back on any error below.
        let (conn, created_at) = match self.take_idle().await {
            Some(found) => found,
            None => (self.open_connection().await?, Instant::now()),
        };

        // Returned by `release`.
        permit.forget();
        Counters::bump(&self.counters.acquired);
        Ok(PooledConnection::new(conn, created_at, pool))
    }

    async fn release(&self, conn: Box<dyn Connection>, created_at: Instant, reuse: bool) {
        if !reuse {
            Counters::bump(&self.counters.abandoned_cursors);
            warn!("connection came back with an unclosed cursor, discarding it");
        }

        let leftover = if reuse {
            let mut idle = self.idle.lock();
            if self.closed.load(Ordering::Acquire) {
                Some(conn)
            } else {
                idle.push(PoolEntry {
                    conn,
                    created_at,
                    parked_at: Instant::now(),
                });
                None
            }
        } else {
            Some(conn)
        };

        if let Some(conn) = leftover {
            self.retire(conn).await;
        }
        self.slots.add_permits(1);
    }

    fn size(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }

    fn stats(&self) -> PoolStats {
        self.counters.snapshot()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.slots.close();

        let parked = std::mem::take(&mut *self.idle.lock());
        for entry in parked {
            self.retire(entry.conn).await;
        }
        Ok(())
    }
}
