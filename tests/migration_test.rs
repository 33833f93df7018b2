//! Opening stores written by older (and newer) releases.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use casedb::{AttributeValue, CaseDb, CaseDbConfig, Content, Error, SchemaVersion};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A small store in the 2.0 layout: one image with a file system holding
/// `/a.txt`, a second bare image, one keyword hit and one entropy value.
const LEGACY_V2: &str = r"
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

fn write_legacy(dir: &TempDir, major: u32) -> PathBuf {
    let path = dir.path().join("legacy.db");
    let conn = rusqlite::Connection::open(&path).expect("Failed to create legacy store");
    conn.execute_batch(LEGACY_V2).expect("Failed to write legacy layout");
    conn.execute("UPDATE schema_info SET major = ?1", [major])
        .expect("Failed to set version");
    path
}

fn backups(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.to_string_lossy().ends_with(".backup"))
        .collect()
}

#[test]
fn test_legacy_store_is_backed_up_and_upgraded() {
    let dir = TempDir::new().unwrap();
    let path = write_legacy(&dir, 2);
    let original = std::fs::read(&path).unwrap();

    let case = CaseDb::open(&CaseDbConfig::embedded(&path)).expect("open failed");
    assert_eq!(case.schema_version(), SchemaVersion::CURRENT);
    assert_eq!(case.creation_version(), None);

    let report = case.migration_report().expect("an upgrade should have run");
    assert_eq!(report.from, SchemaVersion::new(2, 0));
    assert_eq!(report.to, SchemaVersion::CURRENT);
    let backup = report.backup_path.clone().expect("embedded upgrades back up");
    assert!(backup.to_string_lossy().ends_with("legacy.db.schemaVer2.0.backup"));
    assert_eq!(std::fs::read(&backup).unwrap(), original);
    assert_eq!(backups(dir.path()), vec![backup]);
}

#[test]
fn test_upgraded_store_serves_legacy_rows() {
    let dir = TempDir::new().unwrap();
    let path = write_legacy(&dir, 2);
    let case = CaseDb::open(&CaseDbConfig::embedded(&path)).unwrap();
    let unit = case.read().unwrap();

    let file = unit.get_by_id(4).unwrap().expect("legacy file");
    assert!(matches!(file, Content::File(_)));
    let file = file.as_file().unwrap();
    assert_eq!(file.extension, "txt");
    assert_eq!(file.data_source_id, 1);

    assert_eq!(unit.get_data_sources().unwrap().len(), 2);
    assert_eq!(unit.get_image(1).unwrap().paths, vec!["/evidence/disk.raw".to_string()]);

    let hits = unit.get_artifacts_by_type(9).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].artifact_id, i64::MIN);
    assert_eq!(hits[0].source_object_id, 4);

    let attributes = unit.get_attributes(i64::MIN).unwrap();
    assert_eq!(attributes.len(), 1);
    assert_eq!(attributes[0].value, AttributeValue::String("secret".to_string()));
    assert_eq!(attributes[0].sources, vec!["keyword".to_string()]);
}

#[test]
fn test_new_artifacts_continue_after_legacy_ids() {
    let dir = TempDir::new().unwrap();
    let path = write_legacy(&dir, 2);
    let case = CaseDb::open(&CaseDbConfig::embedded(&path)).unwrap();

    let artifact = case.write(|tx| tx.new_artifact(9, 4)).unwrap();
    assert_eq!(artifact.artifact_id, i64::MIN + 2);
    assert_eq!(artifact.data_source_object_id, 1);
}

#[test]
fn test_second_open_of_upgraded_store_does_nothing() {
    let dir = TempDir::new().unwrap();
    let path = write_legacy(&dir, 2);
    CaseDb::open(&CaseDbConfig::embedded(&path)).unwrap().close();

    let case = CaseDb::open(&CaseDbConfig::embedded(&path)).unwrap();
    assert!(case.migration_report().is_none());
    assert_eq!(backups(dir.path()).len(), 1);
}

#[test]
fn test_newer_major_is_rejected_untouched() {
    let dir = TempDir::new().unwrap();
    let path = write_legacy(&dir, 9);
    let original = std::fs::read(&path).unwrap();

    let err = CaseDb::open(&CaseDbConfig::embedded(&path)).unwrap_err();
    assert!(matches!(err, Error::UnsupportedSchema { .. }));
    assert_eq!(std::fs::read(&path).unwrap(), original);
    assert!(backups(dir.path()).is_empty());
}
