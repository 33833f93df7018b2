//! `PostgreSQL` backend for multi-user cases.
//!
//! No in-process lock: concurrency control is the server's job. Only lost or
//! refused connections are retried, and only outside a transaction, where a
//! fresh connection can transparently replace the dead one.

use super::dialect::{BackendKind, statement_context};
use super::retry::{RetryPolicy, with_retry};
use super::row::{Row, SqlValue};
use crate::config::ServerConfig;
use crate::error::{Error, Result, StorageError};
use bytes::BytesMut;
use ::postgres::error::SqlState;
use ::postgres::types::{IsNull, ToSql, Type, to_sql_checked};
use ::postgres::{Client, NoTls, Statement};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use tracing::{info, warn};

/// A single client connection with its prepared statement cache.
pub struct PostgresConnection {
    client: RefCell<Client>,
    statements: RefCell<HashMap<String, Statement>>,
    params: String,
    retry: RetryPolicy,
    in_transaction: Cell<bool>,
}

impl std::fmt::Debug for PostgresConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresConnection")
            .field("retry", &self.retry)
            .field("in_transaction", &self.in_transaction.get())
            .finish_non_exhaustive()
    }
}

fn connection_params(config: &ServerConfig, database: &str) -> String {
    format!(
        "host={} port={} user={} password={} dbname={}",
        config.host, config.port, config.user, config.password, database
    )
}

impl PostgresConnection {
    /// Connects to the case database named in `config`.
    pub fn connect(config: &ServerConfig, retry: RetryPolicy) -> Result<Self> {
        Self::connect_to(config, &config.database, retry)
    }

    /// Connects to the server's maintenance database, used to create cases.
    pub fn connect_maintenance(config: &ServerConfig, retry: RetryPolicy) -> Result<Self> {
        Self::connect_to(config, "postgres", retry)
    }

    fn connect_to(config: &ServerConfig, database: &str, retry: RetryPolicy) -> Result<Self> {
        let params = connection_params(config, database);
        let client = with_retry(retry, "connect", || {
            Client::connect(&params, NoTls).map_err(|e| classify(&e, "connect"))
        })?;
        Ok(Self {
            client: RefCell::new(client),
            statements: RefCell::new(HashMap::new()),
            params,
            retry,
            in_transaction: Cell::new(false),
        })
    }

    /// Returns true when the underlying socket has gone away.
    pub fn is_closed(&self) -> bool {
        self.client.borrow().is_closed()
    }

    fn reconnect_if_closed(&self) -> Result<()> {
        if !self.is_closed() {
            return Ok(());
        }
        if self.in_transaction.get() {
            return Err(StorageError::Transaction(
                "connection lost inside a transaction".to_string(),
            )
            .into());
        }
        let client = Client::connect(&self.params, NoTls).map_err(|e| classify(&e, "connect"))?;
        *self.client.borrow_mut() = client;
        self.statements.borrow_mut().clear();
        info!("reconnected to case database server");
        Ok(())
    }

    fn policy(&self) -> RetryPolicy {
        if self.in_transaction.get() {
            RetryPolicy::NONE
        } else {
            self.retry
        }
    }

    fn statement(&self, sql: &str) -> Result<Statement> {
        if let Some(stmt) = self.statements.borrow().get(sql) {
            return Ok(stmt.clone());
        }
        let rendered = BackendKind::Server.render_placeholders(sql);
        let stmt = self
            .client
            .borrow_mut()
            .prepare(&rendered)
            .map_err(|e| classify(&e, sql))?;
        self.statements
            .borrow_mut()
            .insert(sql.to_string(), stmt.clone());
        Ok(stmt)
    }

    fn run<T>(
        &self,
        sql: &str,
        mut op: impl FnMut(&mut Client, &Statement) -> std::result::Result<T, ::postgres::Error>,
    ) -> Result<T> {
        with_retry(self.policy(), sql, || {
            self.reconnect_if_closed()?;
            let stmt = self.statement(sql)?;
            let mut client = self.client.borrow_mut();
            op(&mut client, &stmt).map_err(|e| classify(&e, sql))
        })
    }

    /// Executes one statement and returns the number of changed rows.
    #[allow(clippy::cast_possible_truncation)]
    pub fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<usize> {
        let refs = param_refs(params);
        self.run(sql, |client, stmt| client.execute(stmt, &refs))
            .map(|n| n as usize)
    }

    /// Runs a query and collects every row.
    pub fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        let refs = param_refs(params);
        let rows = self.run(sql, |client, stmt| client.query(stmt, &refs))?;
        rows.iter().map(|row| convert_row(row, sql)).collect()
    }

    /// Executes an insert and returns the generated value of `id_column`.
    pub fn insert_returning_id(
        &self,
        sql: &str,
        params: &[SqlValue],
        id_column: &str,
    ) -> Result<i64> {
        let returning = format!("{sql} RETURNING {id_column}");
        let rows = self.query(&returning, params)?;
        rows.first()
            .ok_or_else(|| StorageError::Database(format!("{sql}: insert returned no id")))?
            .get(0)
    }

    /// Executes several `;`-separated statements without parameters.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        with_retry(self.policy(), sql, || {
            self.reconnect_if_closed()?;
            self.client
                .borrow_mut()
                .batch_execute(sql)
                .map_err(|e| classify(&e, sql))
        })
    }

    /// Starts a transaction.
    pub fn begin(&self) -> Result<()> {
        self.execute_batch("BEGIN")?;
        self.in_transaction.set(true);
        Ok(())
    }

    /// Commits the open transaction.
    pub fn commit(&self) -> Result<()> {
        let result = self
            .client
            .borrow_mut()
            .batch_execute("COMMIT")
            .map_err(|e| classify(&e, "COMMIT"));
        self.in_transaction.set(false);
        result
    }

    /// Rolls back the open transaction, if any.
    pub fn rollback(&self) -> Result<()> {
        if !self.in_transaction.get() {
            return Ok(());
        }
        self.in_transaction.set(false);
        if self.is_closed() {
            warn!("connection closed before rollback; server discards the transaction");
            return Ok(());
        }
        self.client
            .borrow_mut()
            .batch_execute("ROLLBACK")
            .map_err(|e| classify(&e, "ROLLBACK"))
    }

    /// Returns true when no transaction is open.
    pub fn is_autocommit(&self) -> bool {
        !self.in_transaction.get()
    }

    /// Checks whether `table` exists in the current schema.
    pub fn table_exists(&self, table: &str) -> Result<bool> {
        let rows = self.query(
            "SELECT 1 FROM information_schema.tables \
             WHERE table_schema = current_schema() AND table_name = ?",
            &[SqlValue::from(table)],
        )?;
        Ok(!rows.is_empty())
    }

    /// Checks whether `table` has `column`.
    pub fn column_exists(&self, table: &str, column: &str) -> Result<bool> {
        let rows = self.query(
            "SELECT 1 FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = ? AND column_name = ?",
            &[SqlValue::from(table), SqlValue::from(column)],
        )?;
        Ok(!rows.is_empty())
    }
}

fn param_refs(params: &[SqlValue]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

type BoxedError = Box<dyn std::error::Error + Sync + Send>;

impl ToSql for SqlValue {
    #[allow(clippy::cast_precision_loss)]
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxedError> {
        match self {
            Self::Null => Ok(IsNull::Yes),
            Self::Integer(v) => match *ty {
                Type::INT2 => i16::try_from(*v)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*v)?.to_sql(ty, out),
                Type::FLOAT4 | Type::FLOAT8 => (*v as f64).to_sql(ty, out),
                Type::BOOL => (*v != 0).to_sql(ty, out),
                Type::TEXT | Type::VARCHAR => v.to_string().to_sql(ty, out),
                _ => v.to_sql(ty, out),
            },
            Self::Real(v) => v.to_sql(ty, out),
            Self::Text(v) => v.as_str().to_sql(ty, out),
            Self::Blob(v) => v.as_slice().to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn convert_row(row: &::postgres::Row, sql: &str) -> Result<Row> {
    let mut values = Vec::with_capacity(row.len());
    for (index, column) in row.columns().iter().enumerate() {
        let value = match *column.type_() {
            Type::INT2 => get::<i16>(row, index, sql)?.map(|v| SqlValue::Integer(i64::from(v))),
            Type::INT4 => get::<i32>(row, index, sql)?.map(|v| SqlValue::Integer(i64::from(v))),
            Type::INT8 => get::<i64>(row, index, sql)?.map(SqlValue::Integer),
            Type::BOOL => get::<bool>(row, index, sql)?.map(SqlValue::from),
            Type::FLOAT4 => get::<f32>(row, index, sql)?.map(|v| SqlValue::Real(f64::from(v))),
            Type::FLOAT8 => get::<f64>(row, index, sql)?.map(SqlValue::Real),
            Type::BYTEA => get::<Vec<u8>>(row, index, sql)?.map(SqlValue::Blob),
            _ => get::<String>(row, index, sql)?.map(SqlValue::Text),
        };
        values.push(value.unwrap_or(SqlValue::Null));
    }
    Ok(Row::new(values))
}

fn get<'a, T: ::postgres::types::FromSql<'a>>(
    row: &'a ::postgres::Row,
    index: usize,
    sql: &str,
) -> Result<Option<T>> {
    row.try_get::<_, Option<T>>(index)
        .map_err(|e| StorageError::Database(format!("{}: {e}", statement_context(sql))).into())
}

/// Maps a driver error onto the crate's error classes.
fn classify(err: &::postgres::Error, sql: &str) -> Error {
    if err.is_closed() {
        return StorageError::Transient(err.to_string()).into();
    }
    match err.code() {
        Some(code) if is_connection_state(code) => StorageError::Transient(err.to_string()).into(),
        Some(code) if code.code().starts_with("23") => Error::Integrity {
            operation: statement_context(sql),
            message: err
                .as_db_error()
                .map_or_else(|| err.to_string(), |db| db.message().to_string()),
        },
        Some(_) => StorageError::Database(format!("{}: {err}", statement_context(sql))).into(),
        // No SQLSTATE: the failure happened on the wire.
        None => StorageError::Transient(err.to_string()).into(),
    }
}

fn is_connection_state(code: &SqlState) -> bool {
    code.code().starts_with("08")
        || *code == SqlState::ADMIN_SHUTDOWN
        || *code == SqlState::CRASH_SHUTDOWN
        || *code == SqlState::CANNOT_CONNECT_NOW
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_states_are_transient() {
        assert!(is_connection_state(&SqlState::CONNECTION_FAILURE));
        assert!(is_connection_state(&SqlState::ADMIN_SHUTDOWN));
        assert!(!is_connection_state(&SqlState::UNIQUE_VIOLATION));
        assert!(!is_connection_state(&SqlState::SYNTAX_ERROR));
    }

    #[test]
    fn test_connection_params() {
        let config = ServerConfig {
            host: "db.lab".to_string(),
            port: 5433,
            user: "examiner".to_string(),
            password: "pw".to_string(),
            database: "case_1".to_string(),
        };
        assert_eq!(
            connection_params(&config, &config.database),
            "host=db.lab port=5433 user=examiner password=pw dbname=case_1"
        );
    }
}
