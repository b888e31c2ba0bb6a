//! Database driver abstraction.
//!
//! The archive core is agnostic of the concrete database engine. A driver
//! supplies physical connections and declares the parameter style its
//! engine expects; everything above this seam works with abstract SQL
//! templates and [`SqlValue`]s.

use async_trait::async_trait;
use displaydoc::Display;

use super::param::ParamStyle;
use crate::error::ArchiveError;

/// A single SQL value crossing the driver boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
}

/// One result row, positionally ordered.
pub type SqlRow = Vec<SqlValue>;

/// Arguments after parameter-style binding.
///
/// Positional styles keep the argument tuple as-is; named styles carry a
/// mapping keyed by the synthetic names generated by the adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundArgs {
    None,
    Positional(Vec<SqlValue>),
    Named(Vec<(String, SqlValue)>),
}

impl BoundArgs {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::None => true,
            Self::Positional(args) => args.is_empty(),
            Self::Named(args) => args.is_empty(),
        }
    }
}

/// An error reported by a driver.
#[derive(Debug, Clone, Display)]
pub enum DriverError {
    /// Lost contact with the database: {0}
    Communication(String),

    /// Unique constraint violated: {0}
    UniqueViolation(String),

    /// Statement execution failed: {0}
    Execution(String),
}

impl std::error::Error for DriverError {}

pub type DriverResult<T> = Result<T, DriverError>;

impl From<DriverError> for ArchiveError {
    fn from(error: DriverError) -> Self {
        match error {
            DriverError::Communication(_) => {
                ArchiveError::DbCommunicationFailure(anyhow::Error::new(error))
            }
            DriverError::UniqueViolation(_) => {
                ArchiveError::ConstraintViolation(anyhow::Error::new(error))
            }
            DriverError::Execution(_) => ArchiveError::DatabaseError(anyhow::Error::new(error)),
        }
    }
}

/// A database driver.
#[async_trait]
pub trait DbDriver: Send + Sync + std::fmt::Debug {
    /// The parameter style this driver's engine expects.
    fn param_style(&self) -> ParamStyle;

    /// Opens a new physical connection.
    async fn connect(&self) -> DriverResult<Box<dyn DbConnection>>;
}

/// A physical database connection.
///
/// Connections are single-owner: a connection is borrowed from the pool by
/// exactly one transaction or cursor at a time and returned (or discarded)
/// when that scope ends.
#[async_trait]
pub trait DbConnection: Send {
    /// Executes a statement with already-bound arguments.
    ///
    /// Returns `true` if the statement produced a result-set descriptor.
    /// Callers must not fetch from a statement that returned `false`; some
    /// engines error out when fetching from a non-SELECT.
    async fn execute(&mut self, sql: &str, args: &BoundArgs) -> DriverResult<bool>;

    /// Fetches all remaining rows of the last executed statement.
    async fn fetch_all(&mut self) -> DriverResult<Vec<SqlRow>>;

    /// Fetches at most `max` more rows of the last executed statement.
    ///
    /// An empty vector means the result set is exhausted.
    async fn fetch_many(&mut self, max: usize) -> DriverResult<Vec<SqlRow>>;

    /// Commits the current transaction.
    async fn commit(&mut self) -> DriverResult<()>;

    /// Rolls back the current transaction.
    async fn rollback(&mut self) -> DriverResult<()>;

    /// Closes the connection.
    async fn close(&mut self) -> DriverResult<()>;
}
