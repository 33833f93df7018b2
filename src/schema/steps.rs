//! The fixed historical upgrade steps.
//!
//! Each step leaves the store alone unless it is exactly at the step's
//! precondition version. Inside a step every change is guarded by an
//! existence probe, a create-if-absent, an insert-if-absent or an
//! `IS NULL` filter, so replaying a step over an upgraded store changes
//! nothing.

use super::create::{
    ARTIFACT_OBJECT_INDEX_DDL, INDEX_DDL, REVIEW_STATUSES, seed_ingest_types,
};
use super::{CREATION_MAJOR_KEY, CREATION_MINOR_KEY, SchemaVersion, insert_extended_if_absent};
use crate::blackboard::types::BUILTIN_ARTIFACT_TYPES;
use crate::db::{Connection, SqlValue};
use crate::error::Result;
use crate::model::{ArtifactCategory, ObjectType, ValueKind, file_extension};
use std::collections::HashMap;
use tracing::debug;

/// One upgrade step: `(version, connection) -> new version`.
pub type Step = fn(SchemaVersion, &Connection) -> Result<SchemaVersion>;

/// Every step, oldest first.
pub const CHAIN: &[Step] = &[
    v2_0_to_v3_0,
    v3_0_to_v4_0,
    v4_0_to_v5_0,
    v5_0_to_v6_0,
    v6_0_to_v7_0,
    v7_0_to_v7_1,
    v7_1_to_v7_2,
    v7_2_to_v8_0,
    v8_0_to_v8_1,
    v8_1_to_v8_2,
    v8_2_to_v8_3,
];

const fn v(major: u32, minor: u32) -> SchemaVersion {
    SchemaVersion::new(major, minor)
}

fn add_column(conn: &Connection, table: &str, column: &str, decl: &str) -> Result<()> {
    if conn.column_exists(table, column)? {
        return Ok(());
    }
    debug!(table, column, "adding column");
    conn.execute_ddl(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"))
}

/// Maps every object id to the id of its root (its data source).
fn data_source_map(conn: &Connection) -> Result<HashMap<i64, i64>> {
    let mut parents = HashMap::new();
    for row in conn.query("SELECT obj_id, par_obj_id FROM objects", &[])? {
        parents.insert(row.get::<i64>(0)?, row.get::<Option<i64>>(1)?);
    }

    let mut roots: HashMap<i64, i64> = HashMap::with_capacity(parents.len());
    for &start in parents.keys() {
        if roots.contains_key(&start) {
            continue;
        }
        let mut path = vec![start];
        let mut current = start;
        let root = loop {
            if let Some(&known) = roots.get(&current) {
                break known;
            }
            match parents.get(&current).copied().flatten() {
                // A dangling or cyclic parent ends the walk at the last good node.
                Some(parent) if parents.contains_key(&parent) && !path.contains(&parent) => {
                    path.push(parent);
                    current = parent;
                }
                _ => break current,
            }
        };
        for id in path {
            roots.insert(id, root);
        }
    }
    Ok(roots)
}

fn populate_data_source(
    conn: &Connection,
    roots: &HashMap<i64, i64>,
    select: &str,
    update: &str,
) -> Result<usize> {
    let mut updated = 0;
    for row in conn.query(select, &[])? {
        let id: i64 = row.get(0)?;
        let key: i64 = row.get(1)?;
        if let Some(&root) = roots.get(&key) {
            updated += conn.execute(update, crate::values![root, id])?;
        }
    }
    Ok(updated)
}

// ---------------------------------------------------------------------------

const TAG_TABLES_V3: &str = r"
CREATE TABLE IF NOT EXISTS tag_names (
    tag_name_id $PK,
    display_name TEXT UNIQUE,
    description TEXT NOT NULL,
    color TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS content_tags (
    tag_id $PK,
    obj_id $BIGINT NOT NULL REFERENCES objects(obj_id),
    tag_name_id $BIGINT NOT NULL REFERENCES tag_names(tag_name_id),
    comment TEXT NOT NULL,
    begin_byte_offset $BIGINT NOT NULL,
    end_byte_offset $BIGINT NOT NULL
);

CREATE TABLE IF NOT EXISTS artifact_tags (
    tag_id $PK,
    artifact_id $BIGINT NOT NULL REFERENCES artifacts(artifact_id),
    tag_name_id $BIGINT NOT NULL REFERENCES tag_names(tag_name_id),
    comment TEXT NOT NULL
);
";

fn v2_0_to_v3_0(from: SchemaVersion, conn: &Connection) -> Result<SchemaVersion> {
    if from != v(2, 0) {
        return Ok(from);
    }
    conn.execute_ddl(TAG_TABLES_V3)?;
    add_column(conn, "attributes", "artifact_type_id", "$BIGINT")?;
    conn.execute(
        "UPDATE attributes SET artifact_type_id = \
         (SELECT artifact_type_id FROM artifacts WHERE artifacts.artifact_id = attributes.artifact_id) \
         WHERE artifact_type_id IS NULL",
        &[],
    )?;
    Ok(v(3, 0))
}

const TABLES_V4: &str = r"
CREATE TABLE IF NOT EXISTS reports (
    obj_id $BIGINT PRIMARY KEY REFERENCES objects(obj_id),
    path TEXT NOT NULL,
    crtime $BIGINT NOT NULL,
    src_module_name TEXT NOT NULL,
    report_name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS files_path (
    obj_id $BIGINT PRIMARY KEY REFERENCES files(obj_id),
    path TEXT NOT NULL
);
";

fn v3_0_to_v4_0(from: SchemaVersion, conn: &Connection) -> Result<SchemaVersion> {
    if from != v(3, 0) {
        return Ok(from);
    }
    add_column(conn, "files", "mime_type", "TEXT")?;
    add_column(conn, "files", "data_source_id", "$BIGINT")?;
    add_column(conn, "file_system_info", "data_source_id", "$BIGINT")?;

    let roots = data_source_map(conn)?;
    populate_data_source(
        conn,
        &roots,
        "SELECT obj_id, obj_id FROM files WHERE data_source_id IS NULL",
        "UPDATE files SET data_source_id = ? WHERE obj_id = ?",
    )?;
    populate_data_source(
        conn,
        &roots,
        "SELECT obj_id, obj_id FROM file_system_info WHERE data_source_id IS NULL",
        "UPDATE file_system_info SET data_source_id = ? WHERE obj_id = ?",
    )?;

    conn.execute_ddl(TABLES_V4)?;
    Ok(v(4, 0))
}

const TABLES_V5: &str = r"
CREATE TABLE IF NOT EXISTS review_statuses (
    review_status_id $INT PRIMARY KEY,
    review_status_name TEXT NOT NULL,
    display_name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ingest_module_types (
    type_id $INT PRIMARY KEY,
    type_name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ingest_job_status_types (
    type_id $INT PRIMARY KEY,
    type_name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ingest_modules (
    ingest_module_id $PK,
    display_name TEXT NOT NULL,
    unique_name TEXT UNIQUE NOT NULL,
    type_id $INT NOT NULL,
    version TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ingest_jobs (
    ingest_job_id $PK,
    host_name TEXT NOT NULL,
    start_date_time $BIGINT NOT NULL,
    end_date_time $BIGINT NOT NULL,
    status_id $INT NOT NULL,
    settings_dir TEXT
);

CREATE TABLE IF NOT EXISTS ingest_job_modules (
    ingest_job_id $BIGINT NOT NULL,
    ingest_module_id $BIGINT NOT NULL,
    pipeline_position $INT NOT NULL,
    PRIMARY KEY (ingest_job_id, ingest_module_id)
);
";

fn v4_0_to_v5_0(from: SchemaVersion, conn: &Connection) -> Result<SchemaVersion> {
    if from != v(4, 0) {
        return Ok(from);
    }
    conn.execute_ddl(TABLES_V5)?;
    for (id, name, display) in REVIEW_STATUSES {
        conn.execute(
            "INSERT INTO review_statuses (review_status_id, review_status_name, display_name) \
             VALUES (?, ?, ?) ON CONFLICT (review_status_id) DO NOTHING",
            crate::values![*id, *name, *display],
        )?;
    }
    add_column(conn, "artifacts", "review_status_id", "$INT NOT NULL DEFAULT 0")?;
    seed_ingest_types(conn)?;
    Ok(v(5, 0))
}

const EXAMINERS_V6: &str = r"
CREATE TABLE IF NOT EXISTS examiners (
    examiner_id $PK,
    login_name TEXT NOT NULL UNIQUE,
    display_name TEXT
);
";

fn v5_0_to_v6_0(from: SchemaVersion, conn: &Connection) -> Result<SchemaVersion> {
    if from != v(5, 0) {
        return Ok(from);
    }
    add_column(conn, "attribute_types", "value_type", "$INT")?;
    // Declared kind: whatever stored attributes of the type use; String when unused.
    conn.execute(
        "UPDATE attribute_types SET value_type = \
         (SELECT MIN(value_type) FROM attributes \
          WHERE attributes.attribute_type_id = attribute_types.attribute_type_id) \
         WHERE value_type IS NULL",
        &[],
    )?;
    conn.execute(
        "UPDATE attribute_types SET value_type = ? WHERE value_type IS NULL",
        crate::values![ValueKind::String.code()],
    )?;

    conn.execute_ddl(EXAMINERS_V6)?;
    add_column(conn, "content_tags", "examiner_id", "$BIGINT")?;
    add_column(conn, "artifact_tags", "examiner_id", "$BIGINT")?;
    Ok(v(6, 0))
}

fn v6_0_to_v7_0(from: SchemaVersion, conn: &Connection) -> Result<SchemaVersion> {
    if from != v(6, 0) {
        return Ok(from);
    }
    add_column(conn, "files", "extension", "TEXT")?;
    for row in conn.query("SELECT obj_id, name FROM files WHERE extension IS NULL", &[])? {
        let id: i64 = row.get(0)?;
        let name: String = row.get(1)?;
        conn.execute(
            "UPDATE files SET extension = ? WHERE obj_id = ?",
            crate::values![file_extension(&name), id],
        )?;
    }

    add_column(conn, "artifacts", "data_source_obj_id", "$BIGINT")?;
    let roots = data_source_map(conn)?;
    populate_data_source(
        conn,
        &roots,
        "SELECT artifact_id, obj_id FROM artifacts WHERE data_source_obj_id IS NULL",
        "UPDATE artifacts SET data_source_obj_id = ? WHERE artifact_id = ?",
    )?;
    Ok(v(7, 0))
}

fn v7_0_to_v7_1(from: SchemaVersion, conn: &Connection) -> Result<SchemaVersion> {
    if from != v(7, 0) {
        return Ok(from);
    }
    add_column(conn, "schema_info", "minor", "$INT NOT NULL DEFAULT 0")?;
    conn.execute_batch(INDEX_DDL)?;
    Ok(v(7, 1))
}

fn v7_1_to_v7_2(from: SchemaVersion, conn: &Connection) -> Result<SchemaVersion> {
    if from != v(7, 1) {
        return Ok(from);
    }
    add_column(
        conn,
        "artifacts",
        "artifact_obj_id",
        "$BIGINT REFERENCES objects(obj_id)",
    )?;
    let pending = conn.query(
        "SELECT artifact_id, obj_id FROM artifacts WHERE artifact_obj_id IS NULL ORDER BY artifact_id",
        &[],
    )?;
    for row in &pending {
        let artifact_id: i64 = row.get(0)?;
        let source_id: i64 = row.get(1)?;
        let object_id = conn.insert_returning_id(
            "INSERT INTO objects (par_obj_id, type) VALUES (?, ?)",
            crate::values![source_id, ObjectType::Artifact.code()],
            "obj_id",
        )?;
        conn.execute(
            "UPDATE artifacts SET artifact_obj_id = ? WHERE artifact_id = ?",
            crate::values![object_id, artifact_id],
        )?;
    }
    debug!(minted = pending.len(), "minted artifact objects");
    conn.execute_batch(ARTIFACT_OBJECT_INDEX_DDL)?;
    Ok(v(7, 2))
}

const EXTENDED_V8: &str = r"
CREATE TABLE IF NOT EXISTS schema_info_extended (
    name TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

fn v7_2_to_v8_0(from: SchemaVersion, conn: &Connection) -> Result<SchemaVersion> {
    if from != v(7, 2) {
        return Ok(from);
    }
    conn.execute_ddl(EXTENDED_V8)?;
    // Upgraded stores never learn their creation version.
    insert_extended_if_absent(conn, CREATION_MAJOR_KEY, "0")?;
    insert_extended_if_absent(conn, CREATION_MINOR_KEY, "0")?;

    add_column(
        conn,
        "artifact_types",
        "category_type",
        "$INT NOT NULL DEFAULT 0",
    )?;
    for builtin in BUILTIN_ARTIFACT_TYPES
        .iter()
        .filter(|t| t.category == ArtifactCategory::AnalysisResult)
    {
        conn.execute(
            "UPDATE artifact_types SET category_type = ? WHERE artifact_type_id = ?",
            &[
                SqlValue::from(ArtifactCategory::AnalysisResult.code()),
                SqlValue::from(builtin.id),
            ],
        )?;
    }
    Ok(v(8, 0))
}

const TAG_SETS_V8_1: &str = r"
CREATE TABLE IF NOT EXISTS tag_sets (
    tag_set_id $PK,
    name TEXT NOT NULL UNIQUE
);
";

fn v8_0_to_v8_1(from: SchemaVersion, conn: &Connection) -> Result<SchemaVersion> {
    if from != v(8, 0) {
        return Ok(from);
    }
    conn.execute_ddl(TAG_SETS_V8_1)?;
    add_column(conn, "tag_names", "tag_set_id", "$BIGINT")?;
    add_column(conn, "tag_names", "rank", "$INT")?;
    Ok(v(8, 1))
}

const DATA_SOURCE_INFO_V8_2: &str = r"
CREATE TABLE IF NOT EXISTS data_source_info (
    obj_id $BIGINT PRIMARY KEY REFERENCES objects(obj_id),
    device_id TEXT NOT NULL,
    time_zone TEXT NOT NULL
);
";

fn v8_1_to_v8_2(from: SchemaVersion, conn: &Connection) -> Result<SchemaVersion> {
    if from != v(8, 1) {
        return Ok(from);
    }
    add_column(conn, "image_info", "sha1", "TEXT")?;
    add_column(conn, "image_info", "sha256", "TEXT")?;
    add_column(conn, "file_system_info", "display_name", "TEXT")?;

    conn.execute_ddl(DATA_SOURCE_INFO_V8_2)?;
    let roots = conn.query(
        "SELECT o.obj_id, i.tzone FROM objects o \
         LEFT JOIN image_info i ON i.obj_id = o.obj_id \
         LEFT JOIN data_source_info d ON d.obj_id = o.obj_id \
         WHERE o.par_obj_id IS NULL AND d.obj_id IS NULL",
        &[],
    )?;
    for row in &roots {
        let id: i64 = row.get(0)?;
        let time_zone: Option<String> = row.get(1)?;
        conn.execute(
            "INSERT INTO data_source_info (obj_id, device_id, time_zone) VALUES (?, ?, ?) \
             ON CONFLICT (obj_id) DO NOTHING",
            crate::values![
                id,
                uuid::Uuid::new_v4().to_string(),
                time_zone.unwrap_or_default()
            ],
        )?;
    }
    Ok(v(8, 2))
}

fn v8_2_to_v8_3(from: SchemaVersion, conn: &Connection) -> Result<SchemaVersion> {
    if from != v(8, 2) {
        return Ok(from);
    }
    add_column(conn, "files", "sha256", "TEXT")?;
    add_column(conn, "ingest_jobs", "data_source_id", "$BIGINT")?;
    Ok(v(8, 3))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::migration::fixtures::legacy_v2;

    #[test]
    fn test_chain_is_contiguous() {
        let (_dir, conn) = legacy_v2();
        let mut version = SchemaVersion::OLDEST;
        for step in CHAIN {
            let next = step(version, &conn).unwrap();
            assert!(next > version, "step from {version} made no progress");
            version = next;
        }
        assert_eq!(version, SchemaVersion::CURRENT);
    }

    #[test]
    fn test_step_ignores_other_versions() {
        let (_dir, conn) = legacy_v2();
        // Not at 3.0, so the 3.0 step must not touch the store.
        assert_eq!(v3_0_to_v4_0(v(2, 0), &conn).unwrap(), v(2, 0));
        assert!(!conn.column_exists("files", "mime_type").unwrap());
    }

    #[test]
    fn test_data_source_map_walks_to_root() {
        let (_dir, conn) = legacy_v2();
        let roots = data_source_map(&conn).unwrap();
        // Fixture: 1 image <- 2 fs <- 3 root dir <- 4 file, 5 second image.
        assert_eq!(roots.get(&4), Some(&1));
        assert_eq!(roots.get(&2), Some(&1));
        assert_eq!(roots.get(&5), Some(&5));
    }

    #[test]
    fn test_v6_populates_extensions() {
        let (_dir, conn) = legacy_v2();
        let mut version = SchemaVersion::OLDEST;
        for step in &CHAIN[..5] {
            version = step(version, &conn).unwrap();
        }
        assert_eq!(version, v(7, 0));
        let ext: Option<String> = conn
            .query_value("SELECT extension FROM files WHERE obj_id = 4", &[])
            .unwrap();
        assert_eq!(ext.as_deref(), Some("txt"));
    }

    #[test]
    fn test_v7_2_mints_artifact_objects_once() {
        let (_dir, conn) = legacy_v2();
        let mut version = SchemaVersion::OLDEST;
        for step in &CHAIN[..7] {
            version = step(version, &conn).unwrap();
        }
        assert_eq!(version, v(7, 2));
        let count = |sql: &str| -> i64 { conn.query_value(sql, &[]).unwrap().unwrap() };
        let objects = count("SELECT COUNT(*) FROM objects");
        assert_eq!(
            count("SELECT COUNT(*) FROM artifacts WHERE artifact_obj_id IS NULL"),
            0
        );

        // Replaying the step finds nothing left to mint.
        v7_1_to_v7_2(v(7, 1), &conn).unwrap();
        assert_eq!(count("SELECT COUNT(*) FROM objects"), objects);
    }
}
