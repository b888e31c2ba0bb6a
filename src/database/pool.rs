//! Database connection pooling.
//!
//! The pool bounds the number of live connections. A caller asking for a
//! connection while the pool is saturated simply waits; archive ingest must
//! not fail merely because of transient contention, so there is no
//! fail-fast mode. Callers that need a wait bound can wrap
//! [`ConnectionPool::connection`] in `tokio::time::timeout` themselves.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task;

use super::driver::{BoundArgs, DbConnection, DbDriver};
use crate::error::{ArchiveError, ArchiveResult};

pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    driver: Arc<dyn DbDriver>,

    /// Bounds connections checked out plus idle ones.
    permits: Arc<Semaphore>,

    /// Connections ready for reuse.
    idle: Mutex<Vec<Box<dyn DbConnection>>>,

    /// Statements run once on every newly created physical connection.
    session_sql: Vec<String>,

    opened: AtomicUsize,

    /// Once set, returning guards close their connection instead of
    /// re-idling it.
    closed: AtomicBool,
}

/// A connection checked out of the pool.
///
/// Dropping the guard returns the connection for reuse, unless it has been
/// marked for discard (e.g. after a communication failure), in which case
/// the physical connection is closed instead.
pub struct PooledConnection {
    conn: Option<Box<dyn DbConnection>>,
    pool: Arc<PoolInner>,
    discard: bool,
    _permit: OwnedSemaphorePermit,
}

impl ConnectionPool {
    pub fn new(
        driver: Arc<dyn DbDriver>,
        max_connections: usize,
        session_sql: Vec<String>,
    ) -> Self {
        tracing::info!(
            "Preparing database pool with {} connections. Initial SQL: {:?}",
            max_connections,
            session_sql
        );
        Self {
            inner: Arc::new(PoolInner {
                driver,
                permits: Arc::new(Semaphore::new(max_connections)),
                idle: Mutex::new(Vec::new()),
                session_sql,
                opened: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Returns a live connection, waiting for capacity if the configured
    /// maximum is already checked out.
    pub async fn connection(&self) -> ArchiveResult<PooledConnection> {
        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ArchiveError::DatabaseError(anyhow::anyhow!("connection pool is closed")))?;

        let reused = {
            let mut idle = self.inner.idle.lock().unwrap();
            idle.pop()
        };

        let conn = match reused {
            Some(conn) => conn,
            None => {
                let mut conn = self.inner.driver.connect().await?;
                for stmt in &self.inner.session_sql {
                    conn.execute(stmt, &BoundArgs::None).await?;
                }
                let opened = self.inner.opened.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!("Opened physical database connection #{}", opened);
                conn
            }
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: self.inner.clone(),
            discard: false,
            _permit: permit,
        })
    }

    /// Drains and closes all pooled connections; waiters get an error.
    ///
    /// Connections still checked out are closed when their guard drops.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.permits.close();
        let drained: Vec<_> = {
            let mut idle = self.inner.idle.lock().unwrap();
            idle.drain(..).collect()
        };
        for mut conn in drained {
            if let Err(e) = conn.close().await {
                tracing::warn!("Failed to close pooled connection: {}", e);
            }
        }
    }

    /// Number of physical connections created so far.
    pub fn opened(&self) -> usize {
        self.inner.opened.load(Ordering::Relaxed)
    }
}

impl PooledConnection {
    pub fn conn(&mut self) -> &mut dyn DbConnection {
        self.conn
            .as_mut()
            .expect("connection already returned to the pool")
            .as_mut()
    }

    /// Marks the physical connection as unfit for reuse.
    pub fn discard(&mut self) {
        self.discard = true;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            if self.discard || self.pool.closed.load(Ordering::SeqCst) {
                task::spawn(async move {
                    if let Err(e) = conn.close().await {
                        tracing::warn!("Failed to close discarded connection: {}", e);
                    }
                });
            } else {
                self.pool.idle.lock().unwrap().push(conn);
            }
        }
        // The permit is released when the guard is fully dropped.
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("driver", &self.inner.driver)
            .field("opened", &self.inner.opened.load(Ordering::Relaxed))
            .finish()
    }
}
