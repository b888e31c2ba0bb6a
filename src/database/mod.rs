//! Database access layer.
//!
//! [`Database`] is the single long-lived handle every component shares. It
//! owns the connection pool, the cumulative DB-time counter, the global
//! critical-section lock and the change-notification registry; none of
//! that state lives in hidden module-level globals.

pub mod driver;
pub mod param;
pub mod pool;
pub mod schema;


use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as SyncMutex};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio::task;

use crate::config::DatabaseConfig;
use crate::error::{ArchiveError, ArchiveResult};
use driver::{DbDriver, DriverError, SqlRow, SqlValue};
use param::ParamStyle;
use pool::{ConnectionPool, PooledConnection};
use schema::SchemaCatalog;

/// A database change notification.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// Optional free-form payload supplied by the committing party.
    pub payload: Option<String>,
}

#[derive(Debug, Default)]
struct ChangeNotifier {
    listeners: SyncMutex<Vec<mpsc::UnboundedSender<ChangeEvent>>>,
}

impl ChangeNotifier {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ChangeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().unwrap().push(tx);
        rx
    }

    fn notify(&self, payload: Option<String>) {
        let event = ChangeEvent { payload };
        let mut listeners = self.listeners.lock().unwrap();
        // Prune listeners whose receiving end is gone.
        listeners.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Handle to the metadata database.
#[derive(Debug, Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

#[derive(Debug)]
struct DatabaseInner {
    pool: ConnectionPool,
    style: ParamStyle,
    prepared_statements: bool,
    catalog: SchemaCatalog,

    /// Cumulative time spent executing statements, in microseconds.
    db_time_micros: AtomicU64,

    /// Serializes rare, cluster-wide-significant operations across
    /// otherwise-independent pooled connections.
    global_lock: Mutex<()>,

    notifier: ChangeNotifier,
}

impl Database {
    pub fn new(driver: Arc<dyn DbDriver>, config: &DatabaseConfig) -> Self {
        let style = driver.param_style();
        tracing::info!("Database parameter style: {}", style.as_str());

        Self {
            inner: Arc::new(DatabaseInner {
                pool: ConnectionPool::new(
                    driver,
                    config.max_connections,
                    config.session_sql.clone(),
                ),
                style,
                prepared_statements: config.prepared_statements,
                catalog: SchemaCatalog::new(config.use_file_ignore),
                db_time_micros: AtomicU64::new(0),
                global_lock: Mutex::new(()),
                notifier: ChangeNotifier::default(),
            }),
        }
    }

    pub fn catalog(&self) -> &SchemaCatalog {
        &self.inner.catalog
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    /// Begins a transaction on a pooled connection.
    pub async fn transaction(&self) -> ArchiveResult<Transaction> {
        let conn = self.inner.pool.connection().await?;
        Ok(Transaction {
            conn: Some(conn),
            db: self.clone(),
            mutated: false,
        })
    }

    /// Executes a single statement in its own transaction.
    ///
    /// Commits on success; on failure rolls back and propagates the
    /// original error unchanged.
    pub async fn query(&self, sql: &str, args: &[SqlValue]) -> ArchiveResult<Vec<SqlRow>> {
        let mut txn = self.transaction().await?;
        match txn.execute(sql, args).await {
            Ok(rows) => {
                txn.commit().await?;
                Ok(rows)
            }
            Err(e) => {
                txn.rollback().await;
                Err(e)
            }
        }
    }

    /// Opens a streaming cursor over a query, for scans too large to hold
    /// in memory at once.
    pub async fn cursor(&self, sql: &str, args: &[SqlValue]) -> ArchiveResult<DbCursor> {
        let (sql, bound) = self
            .inner
            .style
            .prepare(sql, args, self.inner.prepared_statements)?;
        tracing::debug!("Opening cursor: {} / {:?}", sql, bound);

        let mut conn = self.inner.pool.connection().await?;
        let started = Instant::now();
        let outcome = conn.conn().execute(&sql, &bound).await;
        self.record_db_time(&sql, started.elapsed());

        match outcome {
            Ok(has_rows) => Ok(DbCursor {
                conn: Some(conn),
                exhausted: !has_rows,
            }),
            Err(e) => {
                if matches!(e, DriverError::Communication(_)) {
                    conn.discard();
                }
                Err(e.into())
            }
        }
    }

    /// Acquires the global critical-section lock.
    ///
    /// Independent of the connection pool; hold it only around short,
    /// cluster-wide-significant sequences.
    pub async fn lock_global(&self) -> MutexGuard<'_, ()> {
        tracing::debug!("Taking global database lock");
        self.inner.global_lock.lock().await
    }

    /// Total time spent in statement execution since the last reset.
    pub fn db_time(&self) -> Duration {
        Duration::from_micros(self.inner.db_time_micros.load(Ordering::Relaxed))
    }

    pub fn reset_db_time(&self) {
        self.inner.db_time_micros.store(0, Ordering::Relaxed);
    }

    fn record_db_time(&self, sql: &str, elapsed: Duration) {
        self.inner
            .db_time_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        tracing::debug!(
            "DB-TIME: Time spent for DB query: |{}|: {:.6}s",
            sql,
            elapsed.as_secs_f64()
        );
    }

    /// Registers a listener signaled whenever a mutating query commits.
    pub fn subscribe_changes(&self) -> mpsc::UnboundedReceiver<ChangeEvent> {
        self.inner.notifier.subscribe()
    }

    /// Signals all change listeners, optionally carrying a payload.
    pub fn notify_change(&self, payload: Option<String>) {
        self.inner.notifier.notify(payload);
    }

    /// Checks whether a file version is recorded as archived.
    pub async fn file_in_db(
        &self,
        disk_id: &str,
        file_id: &str,
        file_version: u32,
    ) -> ArchiveResult<bool> {
        let sql = "SELECT file_id FROM ngas_files \
                   WHERE disk_id={0} AND file_id={1} AND file_version={2}";
        let rows = self
            .query(
                sql,
                &[
                    SqlValue::Text(disk_id.to_string()),
                    SqlValue::Text(file_id.to_string()),
                    SqlValue::Int(file_version as i64),
                ],
            )
            .await?;
        Ok(!rows.is_empty())
    }

    /// Accumulates per-disk write statistics after a successful promote.
    pub async fn update_disk_stats(
        &self,
        disk_id: &str,
        bytes_written: u64,
        write_time: Duration,
    ) -> ArchiveResult<()> {
        let sql = "UPDATE ngas_disks SET \
                   number_of_files=number_of_files+1, \
                   bytes_stored=bytes_stored+{0}, \
                   total_disk_write_time=total_disk_write_time+{1} \
                   WHERE disk_id={2}";
        self.query(
            sql,
            &[
                SqlValue::Int(bytes_written as i64),
                SqlValue::Float(write_time.as_secs_f64()),
                SqlValue::Text(disk_id.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    /// Returns the server list stored under `id`, if any.
    pub async fn srv_list_from_id(&self, id: i64) -> ArchiveResult<Option<String>> {
        let sql = "SELECT srv_list FROM ngas_srv_list WHERE srv_list_id={0}";
        let rows = self.query(sql, &[SqlValue::Int(id)]).await?;
        match rows.first().and_then(|r| r.first()) {
            Some(SqlValue::Text(list)) => Ok(Some(list.clone())),
            _ => Ok(None),
        }
    }

    /// Returns the ID registered for `srv_list`, allocating a fresh unique
    /// one if the list is not yet known.
    ///
    /// Allocation probes random candidate IDs under the global lock so two
    /// servers cannot race the same free ID through independent pooled
    /// connections.
    pub async fn srv_list_id(&self, srv_list: &str) -> ArchiveResult<i64> {
        let srv_list = clean_srv_list(srv_list);

        if let Some(id) = self.lookup_srv_list_id(&srv_list).await? {
            return Ok(id);
        }

        let _guard = self.lock_global().await;
        // Re-check under the lock: a concurrent caller may have registered
        // the same list between the lookup above and the lock acquisition.
        if let Some(id) = self.lookup_srv_list_id(&srv_list).await? {
            return Ok(id);
        }
        loop {
            let candidate = { rand::thread_rng().gen_range(1..i64::from(i32::MAX)) };
            if self.srv_list_from_id(candidate).await?.is_some() {
                continue;
            }
            let sql = "INSERT INTO ngas_srv_list \
                       (srv_list_id, srv_list, creation_date) VALUES ({0}, {1}, {2})";
            self.query(
                sql,
                &[
                    SqlValue::Int(candidate),
                    SqlValue::Text(srv_list.clone()),
                    SqlValue::Text(crate::model::to_iso8601(chrono::Utc::now())),
                ],
            )
            .await?;
            return Ok(candidate);
        }
    }

    async fn lookup_srv_list_id(&self, srv_list: &str) -> ArchiveResult<Option<i64>> {
        let sql = "SELECT srv_list_id FROM ngas_srv_list WHERE srv_list={0}";
        let rows = self
            .query(sql, &[SqlValue::Text(srv_list.to_string())])
            .await?;
        match rows.first().and_then(|r| r.first()) {
            Some(SqlValue::Int(id)) => Ok(Some(*id)),
            _ => Ok(None),
        }
    }

    /// Closes the connection pool.
    pub async fn close(&self) {
        self.inner.pool.close().await;
    }
}

/// Normalizes a `<host>:<port>,...` server list: whitespace stripped,
/// entries sorted.
pub fn clean_srv_list(srv_list: &str) -> String {
    let mut entries: Vec<&str> = srv_list
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();
    entries.sort_unstable();
    entries.join(",")
}

/// A transaction over one borrowed connection.
///
/// Consume with [`commit`](Self::commit) or [`rollback`](Self::rollback).
/// A transaction dropped without either is rolled back best-effort and its
/// connection is discarded.
pub struct Transaction {
    conn: Option<PooledConnection>,
    db: Database,
    mutated: bool,
}

impl Transaction {
    fn pooled(&mut self) -> &mut PooledConnection {
        self.conn.as_mut().expect("transaction already finished")
    }

    /// Executes one statement within the transaction.
    ///
    /// The template is adapted to the driver's parameter style first. A
    /// statement with no result-set descriptor yields an empty row vector
    /// and marks the transaction as mutating.
    pub async fn execute(&mut self, sql: &str, args: &[SqlValue]) -> ArchiveResult<Vec<SqlRow>> {
        let (sql, bound) =
            self.db
                .inner
                .style
                .prepare(sql, args, self.db.inner.prepared_statements)?;
        tracing::debug!("Performing SQL query with parameters: {} / {:?}", sql, bound);

        let started = Instant::now();
        let outcome = self.pooled().conn().execute(&sql, &bound).await;

        let has_rows = match outcome {
            Ok(has_rows) => has_rows,
            Err(e) => {
                self.db.record_db_time(&sql, started.elapsed());
                if matches!(e, DriverError::Communication(_)) {
                    self.pooled().discard();
                }
                return Err(e.into());
            }
        };

        let rows = if has_rows {
            let fetched = self.pooled().conn().fetch_all().await;
            match fetched {
                Ok(rows) => rows,
                Err(e) => {
                    self.db.record_db_time(&sql, started.elapsed());
                    if matches!(e, DriverError::Communication(_)) {
                        self.pooled().discard();
                    }
                    return Err(e.into());
                }
            }
        } else {
            self.mutated = true;
            Vec::new()
        };

        self.db.record_db_time(&sql, started.elapsed());
        Ok(rows)
    }

    /// Commits the transaction and returns the connection to the pool.
    ///
    /// A committed mutation signals the change listeners.
    pub async fn commit(mut self) -> ArchiveResult<()> {
        let mut conn = match self.conn.take() {
            Some(conn) => conn,
            None => return Ok(()),
        };
        match conn.conn().commit().await {
            Ok(()) => {
                if self.mutated {
                    self.db.notify_change(None);
                }
                Ok(())
            }
            Err(e) => {
                conn.discard();
                Err(e.into())
            }
        }
    }

    /// Rolls back the transaction.
    ///
    /// Rollback failures are logged, never propagated: the error that
    /// triggered the rollback is what the caller must see.
    pub async fn rollback(mut self) {
        if let Some(mut conn) = self.conn.take() {
            if let Err(e) = conn.conn().rollback().await {
                tracing::warn!("Failed to roll back transaction: {}", e);
                conn.discard();
            }
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            task::spawn(async move {
                tracing::debug!("Rolling back abandoned transaction");
                if conn.conn().rollback().await.is_err() {
                    conn.discard();
                }
            });
        }
    }
}

/// A streaming cursor bound to one pooled connection.
pub struct DbCursor {
    conn: Option<PooledConnection>,
    exhausted: bool,
}

impl DbCursor {
    /// Fetches at most `max` rows; an empty vector means exhaustion.
    pub async fn fetch(&mut self, max: usize) -> ArchiveResult<Vec<SqlRow>> {
        if self.exhausted {
            return Ok(Vec::new());
        }
        let conn = match self.conn.as_mut() {
            Some(conn) => conn,
            None => return Ok(Vec::new()),
        };
        let fetched = conn.conn().fetch_many(max).await;
        let rows = match fetched {
            Ok(rows) => rows,
            Err(e) => {
                if matches!(e, DriverError::Communication(_)) {
                    conn.discard();
                }
                return Err(e.into());
            }
        };
        if rows.is_empty() {
            self.exhausted = true;
        }
        Ok(rows)
    }
}

impl Drop for DbCursor {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            task::spawn(async move {
                if conn.conn().rollback().await.is_err() {
                    conn.discard();
                }
            });
        }
    }
}
