//! Case database schema: versions, creation, and the upgrade chain.
//!
//! A store records its schema as `{major, minor}` in `schema_info` and, from
//! 8.0 on, as key/value rows in `schema_info_extended`. Stores older than
//! 7.1 have no minor column and read as `{major, 0}`.

pub mod create;
pub mod migration;
mod steps;

pub use create::create_schema;
pub use migration::{MigrationReport, backup_path_for, run_chain, upgrade};

use crate::db::{Connection, SqlValue};
use crate::error::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Extended-row key for the current major version.
pub const SCHEMA_MAJOR_KEY: &str = "SCHEMA_MAJOR_VERSION";
/// Extended-row key for the current minor version.
pub const SCHEMA_MINOR_KEY: &str = "SCHEMA_MINOR_VERSION";
/// Extended-row key for the major version the store was created at.
pub const CREATION_MAJOR_KEY: &str = "CREATION_SCHEMA_MAJOR_VERSION";
/// Extended-row key for the minor version the store was created at.
pub const CREATION_MINOR_KEY: &str = "CREATION_SCHEMA_MINOR_VERSION";

/// A `{major, minor}` schema version. Ordered by major, then minor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SchemaVersion {
    /// Incompatible layout changes.
    pub major: u32,
    /// Compatible additions within a major version.
    pub minor: u32,
}

impl SchemaVersion {
    /// Version this engine writes and reads natively.
    pub const CURRENT: Self = Self::new(8, 3);

    /// Oldest version the upgrade chain accepts.
    pub const OLDEST: Self = Self::new(2, 0);

    /// Creates a version.
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Returns true when this engine can open the store, possibly after an
    /// upgrade. Newer minor versions of the current major stay readable.
    pub fn is_supported(self) -> bool {
        self >= Self::OLDEST && self.major <= Self::CURRENT.major
    }

    /// Returns true when the upgrade chain has work to do.
    pub fn needs_upgrade(self) -> bool {
        self < Self::CURRENT
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

fn to_u32(value: i64, what: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| StorageError::NotACaseDatabase(format!("invalid {what} version {value}")).into())
}

/// Reads the stored schema version without modifying anything.
pub fn read_version(conn: &Connection) -> Result<SchemaVersion> {
    if !conn.table_exists("schema_info")? {
        return Err(StorageError::NotACaseDatabase("no schema_info table".to_string()).into());
    }
    let has_minor = conn.column_exists("schema_info", "minor")?;
    let sql = if has_minor {
        "SELECT major, minor FROM schema_info"
    } else {
        "SELECT major FROM schema_info"
    };
    let row = conn
        .query_opt(sql, &[])?
        .ok_or_else(|| StorageError::NotACaseDatabase("schema_info is empty".to_string()))?;
    let major = to_u32(row.get(0)?, "major")?;
    let minor = if has_minor {
        to_u32(row.get(1)?, "minor")?
    } else {
        0
    };
    Ok(SchemaVersion::new(major, minor))
}

/// Writes `version` to `schema_info` and, when present, to the extended
/// key/value rows.
pub fn write_version(conn: &Connection, version: SchemaVersion) -> Result<()> {
    if conn.column_exists("schema_info", "minor")? {
        conn.execute(
            "UPDATE schema_info SET major = ?, minor = ?",
            crate::values![version.major, version.minor],
        )?;
    } else {
        conn.execute("UPDATE schema_info SET major = ?", crate::values![version.major])?;
    }
    if conn.table_exists("schema_info_extended")? {
        upsert_extended(conn, SCHEMA_MAJOR_KEY, &version.major.to_string())?;
        upsert_extended(conn, SCHEMA_MINOR_KEY, &version.minor.to_string())?;
    }
    Ok(())
}

pub(crate) fn upsert_extended(conn: &Connection, name: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO schema_info_extended (name, value) VALUES (?, ?) \
         ON CONFLICT (name) DO UPDATE SET value = excluded.value",
        crate::values![name, value],
    )?;
    Ok(())
}

/// Inserts an extended row unless one with the same name exists.
pub(crate) fn insert_extended_if_absent(conn: &Connection, name: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO schema_info_extended (name, value) VALUES (?, ?) ON CONFLICT (name) DO NOTHING",
        crate::values![name, value],
    )?;
    Ok(())
}

/// Reads the version the store was created at.
///
/// `None` when the store predates the extended table or was created before
/// the creation version was recorded.
pub fn read_creation_version(conn: &Connection) -> Result<Option<SchemaVersion>> {
    if !conn.table_exists("schema_info_extended")? {
        return Ok(None);
    }
    let read = |name: &str| -> Result<Option<u32>> {
        let value: Option<String> = conn.query_value(
            "SELECT value FROM schema_info_extended WHERE name = ?",
            &[SqlValue::from(name)],
        )?;
        Ok(value.and_then(|v| v.trim().parse().ok()))
    };
    match (read(CREATION_MAJOR_KEY)?, read(CREATION_MINOR_KEY)?) {
        (Some(major), Some(minor)) if major > 0 => Ok(Some(SchemaVersion::new(major, minor))),
        _ => Ok(None),
    }
}
