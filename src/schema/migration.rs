//! In-place schema upgrade at open.
//!
//! [`upgrade`] reads the stored version, refuses unsupported stores before
//! touching them, backs up embedded files, and runs the whole step chain in
//! one transaction. The new version is written only if every step succeeds.

use super::steps::CHAIN;
use super::{SchemaVersion, read_version, write_version};
use crate::db::Connection;
use crate::error::{Error, Result, StorageError};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// What an upgrade did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Version before the upgrade.
    pub from: SchemaVersion,
    /// Version after the upgrade.
    pub to: SchemaVersion,
    /// Each step that changed the version, as `(before, after)`.
    pub steps: Vec<(SchemaVersion, SchemaVersion)>,
    /// Copy of the embedded file taken before the first change.
    pub backup_path: Option<PathBuf>,
}

/// Fails with [`Error::UnsupportedSchema`] for stores this engine cannot open.
pub fn ensure_supported(found: SchemaVersion) -> Result<()> {
    if found.is_supported() {
        Ok(())
    } else {
        Err(Error::UnsupportedSchema {
            found,
            oldest: SchemaVersion::OLDEST,
            supported: SchemaVersion::CURRENT,
        })
    }
}

/// Runs every step starting from `from` and returns the reached version with
/// the steps that applied.
///
/// Does not manage the transaction or write the version row.
pub fn run_chain(
    conn: &Connection,
    from: SchemaVersion,
) -> Result<(SchemaVersion, Vec<(SchemaVersion, SchemaVersion)>)> {
    let mut version = from;
    let mut applied = Vec::new();
    for step in CHAIN {
        let next = step(version, conn)?;
        if next != version {
            info!(from = %version, to = %next, "applied schema upgrade step");
            applied.push((version, next));
            version = next;
        }
    }
    if version.needs_upgrade() {
        return Err(StorageError::Database(format!(
            "no upgrade path from schema {version} to {}",
            SchemaVersion::CURRENT
        ))
        .into());
    }
    Ok((version, applied))
}

/// Sibling backup path for `db_path` at `version`, unique on disk.
///
/// `<file>.schemaVer<M>.<m>.backup`, or `<file>.schemaVer<M>.<m>_<n>.backup`
/// when that name is taken.
pub fn backup_path_for(db_path: &Path, version: SchemaVersion) -> PathBuf {
    let file_name = db_path
        .file_name()
        .map_or_else(|| "case.db".to_string(), |n| n.to_string_lossy().into_owned());
    let stem = format!("{file_name}.schemaVer{}.{}", version.major, version.minor);
    let mut candidate = db_path.with_file_name(format!("{stem}.backup"));
    let mut n = 1_u32;
    while candidate.exists() {
        candidate = db_path.with_file_name(format!("{stem}_{n}.backup"));
        n += 1;
    }
    candidate
}

fn backup(db_path: &Path, version: SchemaVersion) -> Result<PathBuf> {
    let target = backup_path_for(db_path, version);
    std::fs::copy(db_path, &target).map_err(|e| Error::io(&target, &e))?;
    info!(backup = %target.display(), "backed up case database before upgrade");
    Ok(target)
}

/// Brings the store up to [`SchemaVersion::CURRENT`].
///
/// Returns `None` when the store is already current; in that case nothing is
/// written. `embedded_path` is the case file for embedded stores, which are
/// copied aside before the first change; server stores pass `None`.
pub fn upgrade(conn: &Connection, embedded_path: Option<&Path>) -> Result<Option<MigrationReport>> {
    let from = read_version(conn)?;
    ensure_supported(from)?;
    if !from.needs_upgrade() {
        return Ok(None);
    }

    let backup_path = embedded_path.map(|p| backup(p, from)).transpose()?;
    info!(from = %from, to = %SchemaVersion::CURRENT, "upgrading case database schema");

    conn.begin().map_err(|e| Error::Migration {
        from,
        source: Box::new(e),
    })?;
    let outcome = run_chain(conn, from).and_then(|(to, steps)| {
        write_version(conn, to)?;
        conn.commit()?;
        Ok((to, steps))
    });

    match outcome {
        Ok((to, steps)) => Ok(Some(MigrationReport {
            from,
            to,
            steps,
            backup_path,
        })),
        Err(err) => {
            if let Err(rollback_err) = conn.rollback() {
                warn!(error = %rollback_err, "rollback after failed upgrade also failed");
            }
            Err(Error::Migration {
                from,
                source: Box::new(err),
            })
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! A minimal 2.0 store written with the 2.0 layout.

    use crate::db::{Connection, RetryPolicy, SqliteConnection};
    use tempfile::TempDir;

    pub(crate) const LEGACY_V2_DDL: &str = r"
    CREATE TABLE schema_info (major INTEGER NOT NULL);
    INSERT INTO schema_info VALUES (2);

    CREATE TABLE objects (obj_id INTEGER PRIMARY KEY, par_obj_id INTEGER REFERENCES objects(obj_id), type INTEGER NOT NULL);
    CREATE TABLE image_info (obj_id INTEGER PRIMARY KEY, type INTEGER, ssize INTEGER, tzone TEXT, size INTEGER, md5 TEXT);
    CREATE TABLE image_names (obj_id INTEGER NOT NULL, name TEXT NOT NULL, sequence INTEGER NOT NULL);
    CREATE TABLE volume_system_info (obj_id INTEGER PRIMARY KEY, vs_type INTEGER NOT NULL, img_offset INTEGER NOT NULL, block_size INTEGER NOT NULL);
    CREATE TABLE volume_info (obj_id INTEGER PRIMARY KEY, addr INTEGER NOT NULL, start INTEGER NOT NULL, length INTEGER NOT NULL, description TEXT, flags INTEGER NOT NULL);
    CREATE TABLE file_system_info (obj_id INTEGER PRIMARY KEY, img_offset INTEGER NOT NULL, fs_type INTEGER NOT NULL, block_size INTEGER NOT NULL, block_count INTEGER NOT NULL, root_inum INTEGER NOT NULL, first_inum INTEGER NOT NULL, last_inum INTEGER NOT NULL);
    CREATE TABLE files (obj_id INTEGER PRIMARY KEY, fs_obj_id INTEGER, type INTEGER, name TEXT NOT NULL, meta_addr INTEGER, dir_type INTEGER, meta_type INTEGER, dir_flags INTEGER, meta_flags INTEGER, size INTEGER, ctime INTEGER, crtime INTEGER, atime INTEGER, mtime INTEGER, mode INTEGER, uid INTEGER, gid INTEGER, md5 TEXT, known INTEGER, parent_path TEXT);
    CREATE TABLE file_layout (obj_id INTEGER NOT NULL, byte_start INTEGER NOT NULL, byte_len INTEGER NOT NULL, sequence INTEGER NOT NULL);
    CREATE TABLE artifact_types (artifact_type_id INTEGER PRIMARY KEY, type_name TEXT NOT NULL UNIQUE, display_name TEXT);
    CREATE TABLE attribute_types (attribute_type_id INTEGER PRIMARY KEY, type_name TEXT NOT NULL UNIQUE, display_name TEXT);
    CREATE TABLE artifacts (artifact_id INTEGER PRIMARY KEY, obj_id INTEGER NOT NULL, artifact_type_id INTEGER NOT NULL);
    CREATE TABLE attributes (artifact_id INTEGER NOT NULL, source TEXT, context TEXT, attribute_type_id INTEGER NOT NULL, value_type INTEGER NOT NULL, value_byte BLOB, value_text TEXT, value_int32 INTEGER, value_int64 INTEGER, value_double REAL);

    INSERT INTO objects VALUES (1, NULL, 0), (2, 1, 3), (3, 2, 4), (4, 3, 4), (5, NULL, 0);
    INSERT INTO image_info VALUES (1, 1, 512, 'UTC', 4096, NULL), (5, 1, 512, 'UTC', 1024, NULL);
    INSERT INTO image_names VALUES (1, '/evidence/disk.raw', 0), (5, '/evidence/usb.raw', 0);
    INSERT INTO file_system_info VALUES (2, 0, 1, 512, 8, 2, 2, 16);
    INSERT INTO files VALUES (3, 2, 0, '', 2, 3, 2, 1, 5, 0, 0, 0, 0, 0, 0, 0, 0, NULL, 0, '/');
    INSERT INTO files VALUES (4, 2, 0, 'a.txt', 3, 5, 1, 1, 5, 10, 0, 0, 0, 0, 0, 0, 0, NULL, 0, '/');
    INSERT INTO artifact_types VALUES (1, 'TSK_GEN_INFO', 'General Info'), (9, 'TSK_KEYWORD_HIT', 'Keyword Hits');
    INSERT INTO attribute_types VALUES (1, 'TSK_URL', 'URL'), (10, 'TSK_KEYWORD', 'Keyword'), (29, 'TSK_ENTROPY', 'Entropy');
    INSERT INTO artifacts VALUES (-9223372036854775808, 4, 9), (-9223372036854775807, 1, 1);
    INSERT INTO attributes VALUES (-9223372036854775808, 'keyword', '', 10, 0, NULL, 'secret', NULL, NULL, NULL);
    INSERT INTO attributes VALUES (-9223372036854775807, 'entropy', '', 29, 3, NULL, NULL, NULL, NULL, 7.5);
    ";

    pub(crate) fn legacy_v2() -> (TempDir, Connection) {
        let dir = TempDir::new().unwrap();
        let conn = Connection::Sqlite(
            SqliteConnection::create(&dir.path().join("legacy.db"), RetryPolicy::NONE).unwrap(),
        );
        conn.execute_batch(LEGACY_V2_DDL).unwrap();
        (dir, conn)
    }

    pub(crate) fn db_path(dir: &TempDir) -> std::path::PathBuf {
        dir.path().join("legacy.db")
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::{db_path, legacy_v2};
    use super::*;
    use crate::schema::create::create_schema;
    use crate::schema::read_creation_version;
    use crate::db::{RetryPolicy, SqliteConnection};
    use std::collections::BTreeSet;
    use tempfile::TempDir;
    use test_case::test_case;

    /// Brings a fresh 2.0 fixture to `target` and records that version.
    fn store_at(target: SchemaVersion) -> (TempDir, Connection) {
        let (dir, conn) = legacy_v2();
        let mut version = SchemaVersion::OLDEST;
        for step in CHAIN {
            if version == target {
                break;
            }
            version = step(version, &conn).unwrap();
        }
        assert_eq!(version, target);
        write_version(&conn, target).unwrap();
        (dir, conn)
    }

    fn columns(conn: &Connection) -> BTreeSet<(String, String)> {
        let mut out = BTreeSet::new();
        let tables = conn
            .query(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
                &[],
            )
            .unwrap();
        for table in tables {
            let table: String = table.get(0).unwrap();
            for column in conn
                .query("SELECT name FROM pragma_table_info(?)", crate::values![table.as_str()])
                .unwrap()
            {
                out.insert((table.clone(), column.get::<String>(0).unwrap()));
            }
        }
        out
    }

    #[test_case(2, 0 ; "from 2.0")]
    #[test_case(3, 0 ; "from 3.0")]
    #[test_case(4, 0 ; "from 4.0")]
    #[test_case(5, 0 ; "from 5.0")]
    #[test_case(6, 0 ; "from 6.0")]
    #[test_case(7, 0 ; "from 7.0")]
    #[test_case(7, 1 ; "from 7.1")]
    #[test_case(7, 2 ; "from 7.2")]
    #[test_case(8, 0 ; "from 8.0")]
    #[test_case(8, 1 ; "from 8.1")]
    #[test_case(8, 2 ; "from 8.2")]
    fn test_historical_version_upgrades_to_current(major: u32, minor: u32) {
        let start = SchemaVersion::new(major, minor);
        let (dir, conn) = store_at(start);

        let report = upgrade(&conn, Some(&db_path(&dir))).unwrap().unwrap();
        assert_eq!(report.from, start);
        assert_eq!(report.to, SchemaVersion::CURRENT);
        assert_eq!(read_version(&conn).unwrap(), SchemaVersion::CURRENT);
        let backup = report.backup_path.unwrap();
        assert!(backup.exists());
        assert!(
            backup
                .to_string_lossy()
                .ends_with(&format!("legacy.db.schemaVer{major}.{minor}.backup"))
        );
    }

    #[test]
    fn test_upgraded_store_has_every_current_column() {
        let (_dir, legacy) = store_at(SchemaVersion::OLDEST);
        upgrade(&legacy, None).unwrap();

        let fresh_dir = TempDir::new().unwrap();
        let fresh = Connection::Sqlite(
            SqliteConnection::create(&fresh_dir.path().join("fresh.db"), RetryPolicy::NONE)
                .unwrap(),
        );
        create_schema(&fresh).unwrap();

        let missing: Vec<_> = columns(&fresh).difference(&columns(&legacy)).cloned().collect();
        assert!(missing.is_empty(), "columns missing after upgrade: {missing:?}");
    }

    #[test]
    fn test_current_store_is_left_alone() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("current.db");
        let conn =
            Connection::Sqlite(SqliteConnection::create(&path, RetryPolicy::NONE).unwrap());
        create_schema(&conn).unwrap();
        assert!(upgrade(&conn, Some(&path)).unwrap().is_none());
        assert!(!backup_path_for(&path, SchemaVersion::CURRENT).exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_chain_replay_is_idempotent() {
        let (_dir, conn) = legacy_v2();
        run_chain(&conn, SchemaVersion::OLDEST).unwrap();
        let count = |sql: &str| -> i64 { conn.query_value(sql, &[]).unwrap().unwrap() };
        let objects = count("SELECT COUNT(*) FROM objects");
        let statuses = count("SELECT COUNT(*) FROM review_statuses");
        let sources = count("SELECT COUNT(*) FROM data_source_info");
        let before = columns(&conn);

        run_chain(&conn, SchemaVersion::OLDEST).unwrap();
        assert_eq!(count("SELECT COUNT(*) FROM objects"), objects);
        assert_eq!(count("SELECT COUNT(*) FROM review_statuses"), statuses);
        assert_eq!(count("SELECT COUNT(*) FROM data_source_info"), sources);
        assert_eq!(columns(&conn), before);
    }

    #[test]
    fn test_newer_major_rejected_without_writes() {
        let (dir, conn) = legacy_v2();
        conn.execute("UPDATE schema_info SET major = 9", &[]).unwrap();
        let path = db_path(&dir);
        let err = upgrade(&conn, Some(&path)).unwrap_err();
        assert!(err.is_unsupported_schema());
        assert!(!conn.column_exists("attributes", "artifact_type_id").unwrap());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_too_old_rejected() {
        let (_dir, conn) = legacy_v2();
        conn.execute("UPDATE schema_info SET major = 1", &[]).unwrap();
        assert!(upgrade(&conn, None).unwrap_err().is_unsupported_schema());
    }

    #[test]
    fn test_upgraded_store_has_unknown_creation_version() {
        let (_dir, conn) = legacy_v2();
        upgrade(&conn, None).unwrap();
        assert_eq!(read_creation_version(&conn).unwrap(), None);
    }

    #[test]
    fn test_denormalized_columns_populated() {
        let (_dir, conn) = legacy_v2();
        upgrade(&conn, None).unwrap();
        let value = |sql: &str| -> Option<i64> { conn.query_value(sql, &[]).unwrap() };
        assert_eq!(value("SELECT data_source_id FROM files WHERE obj_id = 4"), Some(1));
        assert_eq!(value("SELECT data_source_id FROM file_system_info WHERE obj_id = 2"), Some(1));
        assert_eq!(
            value("SELECT artifact_type_id FROM attributes WHERE source = 'keyword'"),
            Some(9)
        );
        assert_eq!(
            value("SELECT data_source_obj_id FROM artifacts WHERE obj_id = 4"),
            Some(1)
        );
        // Entropy attributes were stored as doubles.
        assert_eq!(
            value("SELECT value_type FROM attribute_types WHERE attribute_type_id = 29"),
            Some(3)
        );
        // Unused types fall back to strings.
        assert_eq!(
            value("SELECT value_type FROM attribute_types WHERE attribute_type_id = 1"),
            Some(0)
        );
        assert_eq!(
            value("SELECT category_type FROM artifact_types WHERE artifact_type_id = 9"),
            Some(1)
        );
        assert_eq!(value("SELECT COUNT(*) FROM data_source_info"), Some(2));
    }

    #[test]
    fn test_failed_upgrade_rolls_back() {
        let (_dir, conn) = legacy_v2();
        // A trigger that aborts the 7.1 -> 7.2 minting makes the chain fail late.
        conn.execute_batch(
            "CREATE TRIGGER block_artifact_objects BEFORE INSERT ON objects \
             WHEN NEW.type = 5 BEGIN SELECT RAISE(ABORT, 'blocked'); END;",
        )
        .unwrap();
        let err = upgrade(&conn, None).unwrap_err();
        assert!(matches!(err, Error::Migration { .. }));
        assert_eq!(read_version(&conn).unwrap(), SchemaVersion::OLDEST);
        assert!(!conn.column_exists("files", "mime_type").unwrap());
        assert!(!conn.table_exists("review_statuses").unwrap());
    }

    #[test]
    fn test_backup_path_is_unique() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("autopsy.db");
        let first = backup_path_for(&db, SchemaVersion::new(7, 1));
        assert_eq!(first, dir.path().join("autopsy.db.schemaVer7.1.backup"));
        std::fs::write(&first, b"x").unwrap();
        let second = backup_path_for(&db, SchemaVersion::new(7, 1));
        assert_eq!(second, dir.path().join("autopsy.db.schemaVer7.1_1.backup"));
    }
}
