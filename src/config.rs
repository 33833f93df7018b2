//! Case database configuration.
//!
//! A [`CaseDbConfig`] selects the backend (embedded file or client/server
//! database) and carries the retry and pool settings the connection manager
//! enforces. Configurations deserialize from TOML:
//!
//! ```toml
//! [backend]
//! kind = "embedded"
//! path = "/cases/case-42/autopsy.db"
//!
//! [retry]
//! busy_max_attempts = 10
//! busy_delay_ms = 200
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default number of attempts for embedded busy/locked responses.
pub const DEFAULT_BUSY_MAX_ATTEMPTS: u32 = 10;

/// Default delay between embedded busy retries (ms).
pub const DEFAULT_BUSY_DELAY_MS: u64 = 200;

/// Default number of attempts for transient client/server connection errors.
pub const DEFAULT_CONNECTION_MAX_ATTEMPTS: u32 = 3;

/// Default delay between connection retries (ms).
pub const DEFAULT_CONNECTION_DELAY_MS: u64 = 2_000;

/// Default maximum number of pooled connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 4;

/// Default client/server port.
pub const DEFAULT_SERVER_PORT: u16 = 5432;

/// Full configuration for opening or creating a case database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseDbConfig {
    /// Backend selection.
    pub backend: BackendConfig,
    /// Retry discipline for transient failures.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Connection pool sizing.
    #[serde(default)]
    pub pool: PoolConfig,
}

/// Which backend holds the case.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Single-file, single-writer embedded store.
    Embedded {
        /// Path to the case database file.
        path: PathBuf,
    },
    /// Multi-writer networked store.
    Server(ServerConfig),
}

/// Connection settings for the client/server backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    /// Server host name or address.
    pub host: String,
    /// Server port.
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Login name.
    pub user: String,
    /// Password.
    #[serde(default)]
    pub password: String,
    /// Name of the database holding the case.
    pub database: String,
}

/// Retry discipline for transient failures.
///
/// Embedded stores retry busy/locked responses; client/server stores retry
/// lost or refused connections. Everything else propagates immediately.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    /// Attempts for embedded busy/locked responses.
    #[serde(default = "default_busy_max_attempts")]
    pub busy_max_attempts: u32,
    /// Fixed delay between embedded retries (ms).
    #[serde(default = "default_busy_delay_ms")]
    pub busy_delay_ms: u64,
    /// Attempts for transient connection errors.
    #[serde(default = "default_connection_max_attempts")]
    pub connection_max_attempts: u32,
    /// Fixed delay between connection retries (ms).
    #[serde(default = "default_connection_delay_ms")]
    pub connection_delay_ms: u64,
}

/// Connection pool sizing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum number of open connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

const fn default_server_port() -> u16 {
    DEFAULT_SERVER_PORT
}

const fn default_busy_max_attempts() -> u32 {
    DEFAULT_BUSY_MAX_ATTEMPTS
}

const fn default_busy_delay_ms() -> u64 {
    DEFAULT_BUSY_DELAY_MS
}

const fn default_connection_max_attempts() -> u32 {
    DEFAULT_CONNECTION_MAX_ATTEMPTS
}

const fn default_connection_delay_ms() -> u64 {
    DEFAULT_CONNECTION_DELAY_MS
}

const fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            busy_max_attempts: DEFAULT_BUSY_MAX_ATTEMPTS,
            busy_delay_ms: DEFAULT_BUSY_DELAY_MS,
            connection_max_attempts: DEFAULT_CONNECTION_MAX_ATTEMPTS,
            connection_delay_ms: DEFAULT_CONNECTION_DELAY_MS,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

impl RetryConfig {
    /// Delay between embedded busy retries.
    pub const fn busy_delay(&self) -> Duration {
        Duration::from_millis(self.busy_delay_ms)
    }

    /// Delay between connection retries.
    pub const fn connection_delay(&self) -> Duration {
        Duration::from_millis(self.connection_delay_ms)
    }
}

impl CaseDbConfig {
    /// Configuration for an embedded case at `path` with default settings.
    pub fn embedded(path: impl Into<PathBuf>) -> Self {
        Self {
            backend: BackendConfig::Embedded { path: path.into() },
            retry: RetryConfig::default(),
            pool: PoolConfig::default(),
        }
    }

    /// Configuration for a client/server case with default settings.
    pub fn server(server: ServerConfig) -> Self {
        Self {
            backend: BackendConfig::Server(server),
            retry: RetryConfig::default(),
            pool: PoolConfig::default(),
        }
    }

    /// Parses a configuration from TOML text and validates it.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a TOML configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, &e))?;
        Self::from_toml_str(&text)
    }

    /// Checks the invariants the connection manager relies on.
    pub fn validate(&self) -> Result<()> {
        if self.retry.busy_max_attempts == 0 || self.retry.connection_max_attempts == 0 {
            return Err(config_error("retry attempt counts must be at least 1"));
        }
        if self.pool.max_connections == 0 {
            return Err(config_error("pool.max_connections must be at least 1"));
        }
        match &self.backend {
            BackendConfig::Embedded { path } => {
                if path.as_os_str().is_empty() {
                    return Err(config_error("embedded backend path is empty"));
                }
            }
            BackendConfig::Server(server) => {
                if server.host.is_empty() || server.user.is_empty() || server.database.is_empty() {
                    return Err(config_error("server host, user and database are required"));
                }
            }
        }
        Ok(())
    }

    /// Human-readable location of the case, used in errors and logs.
    pub fn location(&self) -> String {
        match &self.backend {
            BackendConfig::Embedded { path } => path.display().to_string(),
            BackendConfig::Server(server) => {
                format!("{}@{}:{}/{}", server.user, server.host, server.port, server.database)
            }
        }
    }
}

fn config_error(message: &str) -> Error {
    Error::Config {
        message: message.to_string(),
    }
}
