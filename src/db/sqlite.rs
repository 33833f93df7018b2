//! `SQLite` backend for embedded cases.
//!
//! One file, one writer. The in-process fair lock in [`super::lock`]
//! serializes units of work; this connection only retries the busy/locked
//! responses that still reach it.

use super::dialect::statement_context;
use super::retry::{RetryPolicy, with_retry};
use super::row::{Row, SqlValue};
use crate::error::{Error, Result, StorageError};
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{ErrorCode, OpenFlags, ToSql, params_from_iter};
use std::path::Path;
use std::time::Duration;

/// Prepared statements kept per connection.
const STATEMENT_CACHE_CAPACITY: usize = 128;

/// A single `SQLite` connection to a case file.
pub struct SqliteConnection {
    conn: rusqlite::Connection,
    retry: RetryPolicy,
}

impl std::fmt::Debug for SqliteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteConnection")
            .field("path", &self.conn.path())
            .field("retry", &self.retry)
            .finish()
    }
}

impl SqliteConnection {
    /// Opens an existing case file.
    pub fn open(path: &Path, retry: RetryPolicy) -> Result<Self> {
        Self::open_with_flags(path, retry, OpenFlags::SQLITE_OPEN_READ_WRITE)
    }

    /// Creates (or opens) a case file.
    pub fn create(path: &Path, retry: RetryPolicy) -> Result<Self> {
        Self::open_with_flags(
            path,
            retry,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
    }

    fn open_with_flags(path: &Path, retry: RetryPolicy, flags: OpenFlags) -> Result<Self> {
        let flags = flags | OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI;
        let conn = with_retry(retry, "open", || {
            rusqlite::Connection::open_with_flags(path, flags).map_err(|e| classify(e, "open"))
        })?;

        // Busy handling belongs to the retry policy, not SQLite's own timer.
        conn.busy_timeout(Duration::ZERO)
            .map_err(|e| classify(e, "busy_timeout"))?;
        conn.set_prepared_statement_cache_capacity(STATEMENT_CACHE_CAPACITY);

        let this = Self { conn, retry };
        this.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(this)
    }

    /// Executes one statement and returns the number of changed rows.
    pub fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<usize> {
        with_retry(self.retry, sql, || {
            let mut stmt = self
                .conn
                .prepare_cached(sql)
                .map_err(|e| classify(e, sql))?;
            stmt.execute(params_from_iter(params.iter()))
                .map_err(|e| classify(e, sql))
        })
    }

    /// Runs a query and collects every row.
    pub fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        with_retry(self.retry, sql, || {
            let mut stmt = self
                .conn
                .prepare_cached(sql)
                .map_err(|e| classify(e, sql))?;
            let column_count = stmt.column_count();
            let mut rows = stmt
                .query(params_from_iter(params.iter()))
                .map_err(|e| classify(e, sql))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(|e| classify(e, sql))? {
                let mut values = Vec::with_capacity(column_count);
                for index in 0..column_count {
                    let value = row.get_ref(index).map_err(|e| classify(e, sql))?;
                    values.push(from_value_ref(value));
                }
                out.push(Row::new(values));
            }
            Ok(out)
        })
    }

    /// Executes an insert and returns the new row id.
    pub fn insert_returning_id(&self, sql: &str, params: &[SqlValue]) -> Result<i64> {
        self.execute(sql, params)?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Executes several `;`-separated statements without parameters.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        with_retry(self.retry, sql, || {
            self.conn.execute_batch(sql).map_err(|e| classify(e, sql))
        })
    }

    /// Starts a write transaction, taking the file's reserved lock up front.
    pub fn begin(&self) -> Result<()> {
        self.execute_batch("BEGIN IMMEDIATE")
    }

    /// Commits the open transaction.
    pub fn commit(&self) -> Result<()> {
        self.execute_batch("COMMIT")
    }

    /// Rolls back the open transaction, if any.
    pub fn rollback(&self) -> Result<()> {
        if self.conn.is_autocommit() {
            return Ok(());
        }
        self.conn
            .execute_batch("ROLLBACK")
            .map_err(|e| classify(e, "ROLLBACK"))
    }

    /// Returns true when no transaction is open.
    pub fn is_autocommit(&self) -> bool {
        self.conn.is_autocommit()
    }

    /// Checks whether `table` exists.
    pub fn table_exists(&self, table: &str) -> Result<bool> {
        let rows = self.query(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?",
            &[SqlValue::from(table)],
        )?;
        Ok(!rows.is_empty())
    }

    /// Checks whether `table` has `column`.
    pub fn column_exists(&self, table: &str, column: &str) -> Result<bool> {
        let rows = self.query(
            "SELECT 1 FROM pragma_table_info(?) WHERE name = ?",
            &[SqlValue::from(table), SqlValue::from(column)],
        )?;
        Ok(!rows.is_empty())
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Borrowed(match self {
            Self::Null => ValueRef::Null,
            Self::Integer(v) => ValueRef::Integer(*v),
            Self::Real(v) => ValueRef::Real(*v),
            Self::Text(v) => ValueRef::Text(v.as_bytes()),
            Self::Blob(v) => ValueRef::Blob(v),
        }))
    }
}

fn from_value_ref(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(v) => SqlValue::Integer(v),
        ValueRef::Real(v) => SqlValue::Real(v),
        ValueRef::Text(v) => SqlValue::Text(String::from_utf8_lossy(v).into_owned()),
        ValueRef::Blob(v) => SqlValue::Blob(v.to_vec()),
    }
}

/// Maps a driver error onto the crate's error classes.
///
/// Busy/locked is transient, constraint failures are integrity violations,
/// everything else is a plain database error.
pub(crate) fn classify(err: rusqlite::Error, sql: &str) -> Error {
    match &err {
        rusqlite::Error::SqliteFailure(failure, message) => match failure.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                StorageError::Transient(err.to_string()).into()
            }
            ErrorCode::ConstraintViolation => Error::Integrity {
                operation: statement_context(sql),
                message: message.clone().unwrap_or_else(|| err.to_string()),
            },
            ErrorCode::NotADatabase => StorageError::NotACaseDatabase(err.to_string()).into(),
            _ => StorageError::Database(format!("{}: {err}", statement_context(sql))).into(),
        },
        _ => StorageError::Database(format!("{}: {err}", statement_context(sql))).into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, SqliteConnection) {
        let dir = TempDir::new().unwrap();
        let conn = SqliteConnection::create(&dir.path().join("case.db"), RetryPolicy::NONE).unwrap();
        (dir, conn)
    }

    #[test]
    fn test_execute_and_query() {
        let (_dir, conn) = open_temp();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT, data BLOB)")
            .unwrap();
        let id = conn
            .insert_returning_id(
                "INSERT INTO t (name, data) VALUES (?, ?)",
                crate::values!["a", vec![1_u8, 2, 3]],
            )
            .unwrap();
        assert_eq!(id, 1);

        let rows = conn
            .query("SELECT id, name, data FROM t WHERE id = ?", crate::values![id])
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get::<String>(1).unwrap(), "a");
        assert_eq!(rows[0].get::<Vec<u8>>(2).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_constraint_violation_is_integrity() {
        let (_dir, conn) = open_temp();
        conn.execute_batch("CREATE TABLE t (name TEXT UNIQUE)").unwrap();
        conn.execute("INSERT INTO t VALUES (?)", crate::values!["x"])
            .unwrap();
        let err = conn
            .execute("INSERT INTO t VALUES (?)", crate::values!["x"])
            .unwrap_err();
        assert!(err.is_integrity());
    }

    #[test]
    fn test_foreign_keys_enforced() {
        let (_dir, conn) = open_temp();
        conn.execute_batch(
            "CREATE TABLE p (id INTEGER PRIMARY KEY);
             CREATE TABLE c (id INTEGER PRIMARY KEY, p INTEGER REFERENCES p(id));",
        )
        .unwrap();
        let err = conn
            .execute("INSERT INTO c (p) VALUES (?)", crate::values![99_i64])
            .unwrap_err();
        assert!(err.is_integrity());
    }

    #[test]
    fn test_syntax_error_is_database_error() {
        let (_dir, conn) = open_temp();
        let err = conn.execute("SELEC nonsense", &[]).unwrap_err();
        assert!(matches!(err, Error::Storage(StorageError::Database(_))));
    }

    #[test]
    fn test_table_and_column_probes() {
        let (_dir, conn) = open_temp();
        conn.execute_batch("CREATE TABLE files (obj_id INTEGER, name TEXT)")
            .unwrap();
        assert!(conn.table_exists("files").unwrap());
        assert!(!conn.table_exists("reports").unwrap());
        assert!(conn.column_exists("files", "name").unwrap());
        assert!(!conn.column_exists("files", "mime_type").unwrap());
    }

    #[test]
    fn test_rollback_discards_writes() {
        let (_dir, conn) = open_temp();
        conn.execute_batch("CREATE TABLE t (v INTEGER)").unwrap();
        conn.begin().unwrap();
        assert!(!conn.is_autocommit());
        conn.execute("INSERT INTO t VALUES (1)", &[]).unwrap();
        conn.rollback().unwrap();
        assert!(conn.is_autocommit());
        let rows = conn.query("SELECT v FROM t", &[]).unwrap();
        assert!(rows.is_empty());
        // Rolling back with nothing open is a no-op.
        conn.rollback().unwrap();
    }

    #[test]
    fn test_open_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        assert!(SqliteConnection::open(&dir.path().join("absent.db"), RetryPolicy::NONE).is_err());
    }
}
