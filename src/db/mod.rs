//! Connection and transaction management.
//!
//! A case lives in one of two backends, chosen when it is opened:
//!
//! - [`BackendKind::Embedded`]: a single `SQLite` file with one writer at a
//!   time, guarded by a fair in-process lock ([`lock`]).
//! - [`BackendKind::Server`]: a `PostgreSQL` database shared by many clients
//!   (cargo feature `postgres`).
//!
//! Everything above this layer talks to a [`Connection`] using `?`
//! placeholders and [`SqlValue`] parameters, and receives [`Row`]s.

pub mod dialect;
pub mod lock;
pub mod pool;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod retry;
pub mod row;
pub mod session;
pub mod sqlite;

pub use dialect::BackendKind;
pub use lock::{StoreLock, UnitGuard};
pub use pool::{ConnectionPool, PooledConnection};
pub use retry::RetryPolicy;
pub use row::{FromSqlValue, Row, SqlValue};
pub use session::{CaseDbConnection, CaseDbTransaction};
pub use sqlite::SqliteConnection;

#[cfg(feature = "postgres")]
pub use self::postgres::PostgresConnection;

use crate::error::Result;

/// An open connection to either backend.
#[derive(Debug)]
pub enum Connection {
    /// Embedded `SQLite` connection.
    Sqlite(SqliteConnection),
    /// `PostgreSQL` client connection.
    #[cfg(feature = "postgres")]
    Postgres(PostgresConnection),
}

macro_rules! dispatch {
    ($self:ident, $conn:ident => $body:expr) => {
        match $self {
            Self::Sqlite($conn) => $body,
            #[cfg(feature = "postgres")]
            Self::Postgres($conn) => $body,
        }
    };
}

impl Connection {
    /// Backend this connection talks to.
    pub const fn backend(&self) -> BackendKind {
        match self {
            Self::Sqlite(_) => BackendKind::Embedded,
            #[cfg(feature = "postgres")]
            Self::Postgres(_) => BackendKind::Server,
        }
    }

    /// Executes one statement and returns the number of changed rows.
    pub fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<usize> {
        dispatch!(self, conn => conn.execute(sql, params))
    }

    /// Runs a query and collects every row.
    pub fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        dispatch!(self, conn => conn.query(sql, params))
    }

    /// Runs a query and returns its first row, if any.
    pub fn query_opt(&self, sql: &str, params: &[SqlValue]) -> Result<Option<Row>> {
        Ok(self.query(sql, params)?.into_iter().next())
    }

    /// Runs a single-column query and returns the first value, if any.
    pub fn query_value<T: FromSqlValue>(&self, sql: &str, params: &[SqlValue]) -> Result<Option<T>> {
        match self.query_opt(sql, params)? {
            Some(row) => row.get(0).map(Some),
            None => Ok(None),
        }
    }

    /// Executes an insert and returns the generated key in `id_column`.
    /// `SQLite` reports the rowid and ignores `id_column`.
    #[cfg_attr(not(feature = "postgres"), allow(unused_variables))]
    pub fn insert_returning_id(
        &self,
        sql: &str,
        params: &[SqlValue],
        id_column: &str,
    ) -> Result<i64> {
        match self {
            Self::Sqlite(conn) => conn.insert_returning_id(sql, params),
            #[cfg(feature = "postgres")]
            Self::Postgres(conn) => conn.insert_returning_id(sql, params, id_column),
        }
    }

    /// Executes several `;`-separated statements without parameters.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        dispatch!(self, conn => conn.execute_batch(sql))
    }

    /// Renders DDL type tokens for this backend and executes the batch.
    pub fn execute_ddl(&self, ddl: &str) -> Result<()> {
        self.execute_batch(&self.backend().render_ddl(ddl))
    }

    /// Starts a transaction.
    pub fn begin(&self) -> Result<()> {
        dispatch!(self, conn => conn.begin())
    }

    /// Commits the open transaction.
    pub fn commit(&self) -> Result<()> {
        dispatch!(self, conn => conn.commit())
    }

    /// Rolls back the open transaction, if any.
    pub fn rollback(&self) -> Result<()> {
        dispatch!(self, conn => conn.rollback())
    }

    /// Checks whether `table` exists.
    pub fn table_exists(&self, table: &str) -> Result<bool> {
        dispatch!(self, conn => conn.table_exists(table))
    }

    /// Checks whether `table` has `column`.
    pub fn column_exists(&self, table: &str, column: &str) -> Result<bool> {
        dispatch!(self, conn => conn.column_exists(table, column))
    }

    /// A connection left inside a transaction or with a dead socket must not
    /// be reused.
    pub fn is_broken(&self) -> bool {
        match self {
            Self::Sqlite(conn) => !conn.is_autocommit(),
            #[cfg(feature = "postgres")]
            Self::Postgres(conn) => !conn.is_autocommit() || conn.is_closed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_embedded_insert_reports_rowid() {
        let dir = TempDir::new().unwrap();
        let conn = Connection::Sqlite(
            SqliteConnection::create(&dir.path().join("case.db"), RetryPolicy::NONE).unwrap(),
        );
        conn.execute_batch("CREATE TABLE t (obj_id INTEGER PRIMARY KEY, name TEXT)")
            .unwrap();
        let first = conn
            .insert_returning_id("INSERT INTO t (name) VALUES (?)", crate::values!["a"], "obj_id")
            .unwrap();
        let second = conn
            .insert_returning_id("INSERT INTO t (name) VALUES (?)", crate::values!["b"], "ignored")
            .unwrap();
        assert_eq!((first, second), (1, 2));
        assert!(!conn.is_broken());
    }
}
