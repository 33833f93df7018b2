//! Bounded connection pool.
//!
//! Connections are opened lazily up to the configured maximum and handed
//! out through [`PooledConnection`], which returns them on drop. Callers that
//! find the pool exhausted block until a connection comes back.

use super::Connection;
use crate::error::Result;
use parking_lot::{Condvar, Mutex};
use std::ops::Deref;
use tracing::debug;

type Factory = Box<dyn Fn() -> Result<Connection> + Send + Sync>;

struct PoolState {
    idle: Vec<Connection>,
    open: usize,
}

/// A fixed-capacity pool of backend connections.
pub struct ConnectionPool {
    state: Mutex<PoolState>,
    available: Condvar,
    max_connections: usize,
    factory: Factory,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ConnectionPool")
            .field("idle", &state.idle.len())
            .field("open", &state.open)
            .field("max_connections", &self.max_connections)
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    /// Creates an empty pool that opens connections with `factory`.
    pub fn new(
        max_connections: usize,
        factory: impl Fn() -> Result<Connection> + Send + Sync + 'static,
    ) -> Self {
        Self {
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                open: 0,
            }),
            available: Condvar::new(),
            max_connections: max_connections.max(1),
            factory: Box::new(factory),
        }
    }

    /// Creates a pool seeded with an already open connection.
    pub fn with_connection(
        max_connections: usize,
        first: Connection,
        factory: impl Fn() -> Result<Connection> + Send + Sync + 'static,
    ) -> Self {
        let pool = Self::new(max_connections, factory);
        {
            let mut state = pool.state.lock();
            state.idle.push(first);
            state.open = 1;
        }
        pool
    }

    /// Takes an idle connection, opens a new one, or waits for one.
    pub fn get(&self) -> Result<PooledConnection<'_>> {
        let mut state = self.state.lock();
        loop {
            if let Some(conn) = state.idle.pop() {
                return Ok(PooledConnection {
                    pool: self,
                    conn: Some(conn),
                });
            }
            if state.open < self.max_connections {
                state.open += 1;
                let open = state.open;
                drop(state);
                return match (self.factory)() {
                    Ok(conn) => {
                        debug!(open, max = self.max_connections, "opened pooled connection");
                        Ok(PooledConnection {
                            pool: self,
                            conn: Some(conn),
                        })
                    }
                    Err(err) => {
                        self.state.lock().open -= 1;
                        self.available.notify_one();
                        Err(err)
                    }
                };
            }
            self.available.wait(&mut state);
        }
    }

    /// Number of connections currently open (idle or in use).
    pub fn open_connections(&self) -> usize {
        self.state.lock().open
    }

    /// Closes every idle connection.
    pub fn close_idle(&self) {
        let mut state = self.state.lock();
        let closed = state.idle.len();
        state.idle.clear();
        state.open -= closed;
    }

    fn release(&self, conn: Connection) {
        let mut state = self.state.lock();
        if conn.is_broken() {
            state.open -= 1;
        } else {
            state.idle.push(conn);
        }
        drop(state);
        self.available.notify_one();
    }
}

/// A connection on loan from a [`ConnectionPool`].
pub struct PooledConnection<'a> {
    pool: &'a ConnectionPool,
    conn: Option<Connection>,
}

impl Deref for PooledConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match &self.conn {
            Some(conn) => conn,
            // Only `drop` takes the connection out.
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::retry::RetryPolicy;
    use crate::db::sqlite::SqliteConnection;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn pool(dir: &TempDir, max: usize, opened: Arc<AtomicUsize>) -> ConnectionPool {
        let path = dir.path().join("pool.db");
        ConnectionPool::new(max, move || {
            opened.fetch_add(1, Ordering::SeqCst);
            Ok(Connection::Sqlite(SqliteConnection::create(
                &path,
                RetryPolicy::NONE,
            )?))
        })
    }

    #[test]
    fn test_connections_are_reused() {
        let dir = TempDir::new().unwrap();
        let opened = Arc::new(AtomicUsize::new(0));
        let pool = pool(&dir, 2, Arc::clone(&opened));
        {
            let _conn = pool.get().unwrap();
        }
        {
            let _conn = pool.get().unwrap();
        }
        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert_eq!(pool.open_connections(), 1);
    }

    #[test]
    fn test_pool_grows_to_max() {
        let dir = TempDir::new().unwrap();
        let opened = Arc::new(AtomicUsize::new(0));
        let pool = pool(&dir, 2, Arc::clone(&opened));
        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        assert_eq!(pool.open_connections(), 2);
        drop(a);
        drop(b);
        pool.close_idle();
        assert_eq!(pool.open_connections(), 0);
    }

    #[test]
    fn test_exhausted_pool_waits_for_release() {
        let dir = TempDir::new().unwrap();
        let opened = Arc::new(AtomicUsize::new(0));
        let pool = Arc::new(pool(&dir, 1, Arc::clone(&opened)));
        let held = pool.get().unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || pool.get().map(|_| ()).is_ok())
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        drop(held);
        assert!(waiter.join().unwrap());
        assert_eq!(opened.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_open_frees_slot() {
        let pool = ConnectionPool::new(1, || {
            Err(crate::error::StorageError::Database("refused".to_string()).into())
        });
        assert!(pool.get().is_err());
        assert_eq!(pool.open_connections(), 0);
    }
}
