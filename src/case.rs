//! The open case: backend, pool, lock, caches and registries in one place.

use crate::blackboard::types::seed_builtin_types;
use crate::blackboard::{ArtifactIdSource, ArtifactType, AttributeType, TypeRegistry};
use crate::config::{BackendConfig, CaseDbConfig};
use crate::db::lock::UnitMarker;
use crate::db::{
    BackendKind, CaseDbConnection, CaseDbTransaction, Connection, ConnectionPool, RetryPolicy,
    SqliteConnection, StoreLock,
};
use crate::error::{Error, Result};
use crate::model::{ArtifactCategory, Content, ValueKind};
use crate::repository::cache::ContentCaches;
use crate::schema::{
    MigrationReport, SchemaVersion, create_schema, read_creation_version, read_version, upgrade,
};
use std::ffi::OsString;
use std::fs::{File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

#[cfg(feature = "postgres")]
use crate::config::ServerConfig;
#[cfg(feature = "postgres")]
use crate::db::PostgresConnection;

static NEXT_CASE_ID: AtomicU64 = AtomicU64::new(1);

/// An open case database.
///
/// Owns the connection pool, the store lock, every session cache and the
/// blackboard type registries. All work happens in units of work obtained
/// from [`read`](Self::read) or [`begin_transaction`](Self::begin_transaction).
///
/// # Examples
///
/// ```no_run
/// use casedb::{CaseDb, CaseDbConfig};
///
/// let case = CaseDb::create(&CaseDbConfig::embedded("case.db")).unwrap();
/// let sources = case.read().unwrap().get_data_sources().unwrap();
/// assert!(sources.is_empty());
/// ```
pub struct CaseDb {
    id: u64,
    location: String,
    backend: BackendKind,
    schema_version: SchemaVersion,
    creation_version: Option<SchemaVersion>,
    migration: Option<MigrationReport>,
    lock: StoreLock,
    pool: ConnectionPool,
    pub(crate) caches: ContentCaches,
    pub(crate) types: TypeRegistry,
    pub(crate) artifact_ids: ArtifactIdSource,
    _case_lock: Option<File>,
}

impl std::fmt::Debug for CaseDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaseDb")
            .field("location", &self.location)
            .field("backend", &self.backend)
            .field("schema_version", &self.schema_version)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

/// Path of the advisory lock file guarding an embedded case.
pub fn lock_path_for(db_path: &Path) -> PathBuf {
    let mut name = OsString::from(db_path.as_os_str());
    name.push(".lock");
    PathBuf::from(name)
}

fn lock_case_file(db_path: &Path) -> Result<File> {
    let lock_path = lock_path_for(db_path);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .map_err(|e| Error::io(&lock_path, &e))?;
    match file.try_lock() {
        Ok(()) => Ok(file),
        Err(TryLockError::WouldBlock) => Err(Error::CaseInUse {
            path: db_path.display().to_string(),
        }),
        Err(TryLockError::Error(e)) => Err(Error::io(&lock_path, &e)),
    }
}

fn in_transaction<T>(conn: &Connection, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
    conn.begin()?;
    match f(conn).and_then(|value| conn.commit().map(|()| value)) {
        Ok(value) => Ok(value),
        Err(err) => {
            if let Err(rollback_err) = conn.rollback() {
                warn!(error = %rollback_err, "rollback failed");
            }
            Err(err)
        }
    }
}

type Factory = Box<dyn Fn() -> Result<Connection> + Send + Sync>;

struct Parts {
    location: String,
    backend: BackendKind,
    conn: Connection,
    factory: Factory,
    case_lock: Option<File>,
    migration: Option<MigrationReport>,
}

impl CaseDb {
    /// Creates a new, empty case.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CaseExists`] when something already lives at the
    /// configured location, or any storage error raised while creating the
    /// schema.
    pub fn create(config: &CaseDbConfig) -> Result<Self> {
        config.validate()?;
        match &config.backend {
            BackendConfig::Embedded { path } => Self::create_embedded(config, path),
            BackendConfig::Server(server) => Self::create_server(config, server),
        }
    }

    /// Opens an existing case, upgrading its schema when needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CaseNotFound`], [`Error::CaseInUse`],
    /// [`Error::UnsupportedSchema`] (before anything is written) or
    /// [`Error::Migration`] when the upgrade failed and was rolled back.
    pub fn open(config: &CaseDbConfig) -> Result<Self> {
        config.validate()?;
        match &config.backend {
            BackendConfig::Embedded { path } => Self::open_embedded(config, path),
            BackendConfig::Server(server) => Self::open_server(config, server),
        }
    }

    fn embedded_factory(path: &Path, retry: RetryPolicy) -> Factory {
        let path = path.to_path_buf();
        Box::new(move || Ok(Connection::Sqlite(SqliteConnection::open(&path, retry)?)))
    }

    fn create_embedded(config: &CaseDbConfig, path: &Path) -> Result<Self> {
        if path.exists() {
            return Err(Error::CaseExists {
                location: path.display().to_string(),
            });
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, &e))?;
            }
        }
        let case_lock = lock_case_file(path)?;
        let retry = RetryPolicy::busy(&config.retry);
        let conn = Connection::Sqlite(SqliteConnection::create(path, retry)?);
        in_transaction(&conn, create_schema)?;
        info!(path = %path.display(), version = %SchemaVersion::CURRENT, "created case database");
        Self::assemble(
            config,
            Parts {
                location: path.display().to_string(),
                backend: BackendKind::Embedded,
                conn,
                factory: Self::embedded_factory(path, retry),
                case_lock: Some(case_lock),
                migration: None,
            },
        )
    }

    fn open_embedded(config: &CaseDbConfig, path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(Error::CaseNotFound {
                location: path.display().to_string(),
            });
        }
        let case_lock = lock_case_file(path)?;
        let retry = RetryPolicy::busy(&config.retry);
        let conn = Connection::Sqlite(SqliteConnection::open(path, retry)?);
        let migration = upgrade(&conn, Some(path))?;
        Self::assemble(
            config,
            Parts {
                location: path.display().to_string(),
                backend: BackendKind::Embedded,
                conn,
                factory: Self::embedded_factory(path, retry),
                case_lock: Some(case_lock),
                migration,
            },
        )
    }

    #[cfg(feature = "postgres")]
    fn server_factory(server: &ServerConfig, retry: RetryPolicy) -> Factory {
        let server = server.clone();
        Box::new(move || Ok(Connection::Postgres(PostgresConnection::connect(&server, retry)?)))
    }

    #[cfg(feature = "postgres")]
    fn database_exists(server: &ServerConfig, retry: RetryPolicy) -> Result<bool> {
        let admin = Connection::Postgres(PostgresConnection::connect_maintenance(server, retry)?);
        Ok(admin
            .query_opt(
                "SELECT 1 FROM pg_database WHERE datname = ?",
                crate::values![&server.database],
            )?
            .is_some())
    }

    #[cfg(feature = "postgres")]
    fn create_server(config: &CaseDbConfig, server: &ServerConfig) -> Result<Self> {
        if !server
            .database
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(Error::Config {
                message: format!("invalid database name: {}", server.database),
            });
        }
        let retry = RetryPolicy::connection(&config.retry);
        let location = config.location();
        if Self::database_exists(server, retry)? {
            return Err(Error::CaseExists { location });
        }
        PostgresConnection::connect_maintenance(server, retry)?
            .execute_batch(&format!("CREATE DATABASE \"{}\"", server.database))?;
        let conn = Connection::Postgres(PostgresConnection::connect(server, retry)?);
        in_transaction(&conn, create_schema)?;
        info!(location = %location, version = %SchemaVersion::CURRENT, "created case database");
        Self::assemble(
            config,
            Parts {
                location,
                backend: BackendKind::Server,
                conn,
                factory: Self::server_factory(server, retry),
                case_lock: None,
                migration: None,
            },
        )
    }

    #[cfg(feature = "postgres")]
    fn open_server(config: &CaseDbConfig, server: &ServerConfig) -> Result<Self> {
        let retry = RetryPolicy::connection(&config.retry);
        let location = config.location();
        if !Self::database_exists(server, retry)? {
            return Err(Error::CaseNotFound { location });
        }
        let conn = Connection::Postgres(PostgresConnection::connect(server, retry)?);
        let migration = upgrade(&conn, None)?;
        Self::assemble(
            config,
            Parts {
                location,
                backend: BackendKind::Server,
                conn,
                factory: Self::server_factory(server, retry),
                case_lock: None,
                migration,
            },
        )
    }

    #[cfg(not(feature = "postgres"))]
    fn create_server(_config: &CaseDbConfig, _server: &crate::config::ServerConfig) -> Result<Self> {
        Err(server_disabled())
    }

    #[cfg(not(feature = "postgres"))]
    fn open_server(_config: &CaseDbConfig, _server: &crate::config::ServerConfig) -> Result<Self> {
        Err(server_disabled())
    }

    fn assemble(config: &CaseDbConfig, parts: Parts) -> Result<Self> {
        let conn = parts.conn;
        if in_transaction(&conn, seed_builtin_types)? {
            debug!("restored missing built-in types");
        }
        let schema_version = read_version(&conn)?;
        let creation_version = read_creation_version(&conn)?;
        let types = TypeRegistry::load(&conn)?;
        let artifact_ids = ArtifactIdSource::for_connection(&conn)?;
        let caches = ContentCaches::default();
        caches.rebuild_children(&conn)?;

        let lock = match parts.backend {
            BackendKind::Embedded => StoreLock::embedded(),
            BackendKind::Server => StoreLock::unlocked(),
        };
        let pool = ConnectionPool::with_connection(config.pool.max_connections, conn, parts.factory);
        info!(
            location = %parts.location,
            backend = %parts.backend,
            version = %schema_version,
            upgraded = parts.migration.is_some(),
            "opened case database"
        );
        Ok(Self {
            id: NEXT_CASE_ID.fetch_add(1, Ordering::Relaxed),
            location: parts.location,
            backend: parts.backend,
            schema_version,
            creation_version,
            migration: parts.migration,
            lock,
            pool,
            caches,
            types,
            artifact_ids,
            _case_lock: parts.case_lock,
        })
    }

    /// Location the case was opened from.
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Backend of the case.
    pub const fn backend(&self) -> BackendKind {
        self.backend
    }

    /// Schema version after open (always current).
    pub const fn schema_version(&self) -> SchemaVersion {
        self.schema_version
    }

    /// Schema version the case was created with; `None` for cases created
    /// before that was recorded.
    pub const fn creation_version(&self) -> Option<SchemaVersion> {
        self.creation_version
    }

    /// What the upgrade did at open, if one ran.
    pub const fn migration_report(&self) -> Option<&MigrationReport> {
        self.migration.as_ref()
    }

    /// Starts a read unit of work.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if this thread already has a unit of
    /// work open on this case, or a storage error if no connection can be
    /// opened.
    pub fn read(&self) -> Result<CaseDbConnection<'_>> {
        let marker = UnitMarker::enter(self.id)?;
        let guard = self.lock.shared();
        let conn = self.pool.get()?;
        Ok(CaseDbConnection::new(self, conn, guard, marker, false))
    }

    /// Starts a write transaction, holding the store exclusively until it
    /// is committed or dropped.
    ///
    /// # Errors
    ///
    /// Same as [`read`](Self::read), plus failures to begin.
    pub fn begin_transaction(&self) -> Result<CaseDbTransaction<'_>> {
        let marker = UnitMarker::enter(self.id)?;
        let guard = self.lock.exclusive();
        let conn = self.pool.get()?;
        CaseDbTransaction::begin(CaseDbConnection::new(self, conn, guard, marker, true))
    }

    /// Runs `f` in a transaction, committing on success and rolling back
    /// on error.
    pub fn write<T>(&self, f: impl FnOnce(&CaseDbTransaction<'_>) -> Result<T>) -> Result<T> {
        let tx = self.begin_transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Rebuilds the has-children index with one scan of the object table.
    pub fn rebuild_children_index(&self) -> Result<()> {
        let unit = self.read()?;
        self.caches.rebuild_children(unit.connection())
    }

    /// Answers from the has-children index.
    pub fn has_children(&self, parent: i64) -> bool {
        self.caches.has_children(parent)
    }

    /// Resolves an object id in its own read unit.
    pub fn get_by_id(&self, id: i64) -> Result<Option<Content>> {
        self.read()?.get_by_id(id)
    }

    /// Children of `parent` in their own read unit.
    pub fn get_children(&self, parent: i64) -> Result<Vec<Content>> {
        self.read()?.get_children(parent)
    }

    /// Artifact type by id.
    pub fn artifact_type(&self, id: i64) -> Option<ArtifactType> {
        self.types.artifact_type(id)
    }

    /// Artifact type by name.
    pub fn artifact_type_by_name(&self, name: &str) -> Option<ArtifactType> {
        self.types.artifact_type_by_name(name)
    }

    /// Every artifact type, ordered by id.
    pub fn artifact_types(&self) -> Vec<ArtifactType> {
        self.types.artifact_types()
    }

    /// Attribute type by id.
    pub fn attribute_type(&self, id: i64) -> Option<AttributeType> {
        self.types.attribute_type(id)
    }

    /// Attribute type by name.
    pub fn attribute_type_by_name(&self, name: &str) -> Option<AttributeType> {
        self.types.attribute_type_by_name(name)
    }

    /// Every attribute type, ordered by id.
    pub fn attribute_types(&self) -> Vec<AttributeType> {
        self.types.attribute_types()
    }

    /// Registers an artifact type in its own transaction.
    pub fn register_artifact_type(
        &self,
        name: &str,
        display_name: &str,
        category: ArtifactCategory,
    ) -> Result<ArtifactType> {
        self.write(|tx| tx.register_artifact_type(name, display_name, category))
    }

    /// Registers an attribute type in its own transaction.
    pub fn register_attribute_type(
        &self,
        name: &str,
        display_name: &str,
        value_kind: ValueKind,
    ) -> Result<AttributeType> {
        self.write(|tx| tx.register_attribute_type(name, display_name, value_kind))
    }

    /// Closes the case, releasing every connection and the case lock.
    pub fn close(self) {
        self.pool.close_idle();
        info!(location = %self.location, "closed case database");
    }
}

#[cfg(not(feature = "postgres"))]
fn server_disabled() -> Error {
    crate::error::StorageError::Unsupported(
        "client/server cases need the `postgres` feature".to_string(),
    )
    .into()
}
