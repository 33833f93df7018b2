//! Schema for newly created cases.
//!
//! New stores are created directly at [`SchemaVersion::CURRENT`]. DDL uses
//! the dialect tokens of [`crate::db::BackendKind::render_ddl`].

use super::{
    CREATION_MAJOR_KEY, CREATION_MINOR_KEY, SchemaVersion, insert_extended_if_absent,
    write_version,
};
use crate::db::{BackendKind, Connection};
use crate::error::Result;

/// Full current schema.
pub const SCHEMA_DDL: &str = r"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_info (
    major $INT NOT NULL,
    minor $INT NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS schema_info_extended (
    name TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Object identity forest; roots are data sources
CREATE TABLE IF NOT EXISTS objects (
    obj_id $PK,
    par_obj_id $BIGINT REFERENCES objects(obj_id),
    type $INT NOT NULL
);

CREATE TABLE IF NOT EXISTS image_info (
    obj_id $BIGINT PRIMARY KEY REFERENCES objects(obj_id),
    type $INT,
    ssize $INT,
    tzone TEXT,
    size $BIGINT,
    md5 TEXT,
    sha1 TEXT,
    sha256 TEXT
);

CREATE TABLE IF NOT EXISTS image_names (
    obj_id $BIGINT NOT NULL REFERENCES image_info(obj_id),
    name TEXT NOT NULL,
    sequence $INT NOT NULL
);

CREATE TABLE IF NOT EXISTS data_source_info (
    obj_id $BIGINT PRIMARY KEY REFERENCES objects(obj_id),
    device_id TEXT NOT NULL,
    time_zone TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS volume_system_info (
    obj_id $BIGINT PRIMARY KEY REFERENCES objects(obj_id),
    vs_type $INT NOT NULL,
    img_offset $BIGINT NOT NULL,
    block_size $BIGINT NOT NULL
);

CREATE TABLE IF NOT EXISTS volume_info (
    obj_id $BIGINT PRIMARY KEY REFERENCES objects(obj_id),
    addr $BIGINT NOT NULL,
    start $BIGINT NOT NULL,
    length $BIGINT NOT NULL,
    description TEXT,
    flags $INT NOT NULL
);

CREATE TABLE IF NOT EXISTS file_system_info (
    obj_id $BIGINT PRIMARY KEY REFERENCES objects(obj_id),
    img_offset $BIGINT NOT NULL,
    fs_type $INT NOT NULL,
    block_size $BIGINT NOT NULL,
    block_count $BIGINT NOT NULL,
    root_inum $BIGINT NOT NULL,
    first_inum $BIGINT NOT NULL,
    last_inum $BIGINT NOT NULL,
    data_source_id $BIGINT,
    display_name TEXT
);

CREATE TABLE IF NOT EXISTS files (
    obj_id $BIGINT PRIMARY KEY REFERENCES objects(obj_id),
    fs_obj_id $BIGINT REFERENCES file_system_info(obj_id),
    type $INT,
    name TEXT NOT NULL,
    meta_addr $BIGINT,
    dir_type $INT,
    meta_type $INT,
    dir_flags $INT,
    meta_flags $INT,
    size $BIGINT,
    ctime $BIGINT,
    crtime $BIGINT,
    atime $BIGINT,
    mtime $BIGINT,
    mode $INT,
    uid $INT,
    gid $INT,
    md5 TEXT,
    known $INT,
    parent_path TEXT,
    data_source_id $BIGINT,
    mime_type TEXT,
    extension TEXT,
    sha256 TEXT
);

CREATE TABLE IF NOT EXISTS files_path (
    obj_id $BIGINT PRIMARY KEY REFERENCES files(obj_id),
    path TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS file_layout (
    obj_id $BIGINT NOT NULL REFERENCES objects(obj_id),
    byte_start $BIGINT NOT NULL,
    byte_len $BIGINT NOT NULL,
    sequence $INT NOT NULL
);

CREATE TABLE IF NOT EXISTS reports (
    obj_id $BIGINT PRIMARY KEY REFERENCES objects(obj_id),
    path TEXT NOT NULL,
    crtime $BIGINT NOT NULL,
    src_module_name TEXT NOT NULL,
    report_name TEXT NOT NULL
);

-- Blackboard
CREATE TABLE IF NOT EXISTS artifact_types (
    artifact_type_id $BIGINT PRIMARY KEY,
    type_name TEXT NOT NULL UNIQUE,
    display_name TEXT,
    category_type $INT NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS attribute_types (
    attribute_type_id $BIGINT PRIMARY KEY,
    type_name TEXT NOT NULL UNIQUE,
    display_name TEXT,
    value_type $INT NOT NULL
);

CREATE TABLE IF NOT EXISTS review_statuses (
    review_status_id $INT PRIMARY KEY,
    review_status_name TEXT NOT NULL,
    display_name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS artifacts (
    artifact_id $BIGINT PRIMARY KEY,
    obj_id $BIGINT NOT NULL REFERENCES objects(obj_id),
    artifact_obj_id $BIGINT REFERENCES objects(obj_id),
    data_source_obj_id $BIGINT,
    artifact_type_id $BIGINT NOT NULL REFERENCES artifact_types(artifact_type_id),
    review_status_id $INT NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS attributes (
    artifact_id $BIGINT NOT NULL REFERENCES artifacts(artifact_id),
    artifact_type_id $BIGINT,
    source TEXT,
    context TEXT,
    attribute_type_id $BIGINT NOT NULL REFERENCES attribute_types(attribute_type_id),
    value_type $INT NOT NULL,
    value_byte $BLOB,
    value_text TEXT,
    value_int32 $INT,
    value_int64 $BIGINT,
    value_double $DOUBLE
);

-- Tags
CREATE TABLE IF NOT EXISTS tag_sets (
    tag_set_id $PK,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS tag_names (
    tag_name_id $PK,
    display_name TEXT UNIQUE,
    description TEXT NOT NULL,
    color TEXT NOT NULL,
    tag_set_id $BIGINT,
    rank $INT
);

CREATE TABLE IF NOT EXISTS examiners (
    examiner_id $PK,
    login_name TEXT NOT NULL UNIQUE,
    display_name TEXT
);

CREATE TABLE IF NOT EXISTS content_tags (
    tag_id $PK,
    obj_id $BIGINT NOT NULL REFERENCES objects(obj_id),
    tag_name_id $BIGINT NOT NULL REFERENCES tag_names(tag_name_id),
    comment TEXT NOT NULL,
    begin_byte_offset $BIGINT NOT NULL,
    end_byte_offset $BIGINT NOT NULL,
    examiner_id $BIGINT
);

CREATE TABLE IF NOT EXISTS artifact_tags (
    tag_id $PK,
    artifact_id $BIGINT NOT NULL REFERENCES artifacts(artifact_id),
    tag_name_id $BIGINT NOT NULL REFERENCES tag_names(tag_name_id),
    comment TEXT NOT NULL,
    examiner_id $BIGINT
);

-- Ingest bookkeeping
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
    settings_dir TEXT,
    data_source_id $BIGINT
);

CREATE TABLE IF NOT EXISTS ingest_job_modules (
    ingest_job_id $BIGINT NOT NULL,
    ingest_module_id $BIGINT NOT NULL,
    pipeline_position $INT NOT NULL,
    PRIMARY KEY (ingest_job_id, ingest_module_id)
);
";

/// Indexes shared by new stores and the 7.0 to 7.1 upgrade.
pub const INDEX_DDL: &str = r"
CREATE INDEX IF NOT EXISTS parObjId ON objects(par_obj_id);
CREATE INDEX IF NOT EXISTS layout_objID ON file_layout(obj_id);
CREATE INDEX IF NOT EXISTS artifact_objID ON artifacts(obj_id);
CREATE INDEX IF NOT EXISTS artifact_typeID ON artifacts(artifact_type_id);
CREATE INDEX IF NOT EXISTS attrsArtifactID ON attributes(artifact_id);
CREATE INDEX IF NOT EXISTS files_name ON files(name);
";

/// Index on the artifact object column, added once that column exists.
pub const ARTIFACT_OBJECT_INDEX_DDL: &str =
    "CREATE INDEX IF NOT EXISTS artifact_artifact_objID ON artifacts(artifact_obj_id);";

/// Rows of `review_statuses`.
pub const REVIEW_STATUSES: &[(i64, &str, &str)] = &[
    (0, "undecided", "Undecided"),
    (1, "approved", "Approved"),
    (2, "rejected", "Rejected"),
];

/// Rows of `ingest_module_types`.
pub const INGEST_MODULE_TYPES: &[(i64, &str)] = &[(0, "Data Source Level"), (1, "File Level")];

/// Rows of `ingest_job_status_types`.
pub const INGEST_JOB_STATUS_TYPES: &[(i64, &str)] =
    &[(0, "Started"), (1, "Cancelled"), (2, "Completed")];

/// Name of the server-side artifact id sequence.
pub const ARTIFACT_ID_SEQUENCE: &str = "artifact_id_seq";

/// Inserts the fixed lookup rows, leaving existing rows alone.
pub(crate) fn seed_lookup_tables(conn: &Connection) -> Result<()> {
    for (id, name, display) in REVIEW_STATUSES {
        conn.execute(
            "INSERT INTO review_statuses (review_status_id, review_status_name, display_name) \
             VALUES (?, ?, ?) ON CONFLICT (review_status_id) DO NOTHING",
            crate::values![*id, *name, *display],
        )?;
    }
    seed_ingest_types(conn)
}

pub(crate) fn seed_ingest_types(conn: &Connection) -> Result<()> {
    for (id, name) in INGEST_MODULE_TYPES {
        conn.execute(
            "INSERT INTO ingest_module_types (type_id, type_name) VALUES (?, ?) \
             ON CONFLICT (type_id) DO NOTHING",
            crate::values![*id, *name],
        )?;
    }
    for (id, name) in INGEST_JOB_STATUS_TYPES {
        conn.execute(
            "INSERT INTO ingest_job_status_types (type_id, type_name) VALUES (?, ?) \
             ON CONFLICT (type_id) DO NOTHING",
            crate::values![*id, *name],
        )?;
    }
    Ok(())
}

/// Creates the server-side artifact id sequence, starting at `i64::MIN`.
pub(crate) fn create_artifact_sequence(conn: &Connection) -> Result<()> {
    if conn.backend() == BackendKind::Server {
        conn.execute_batch(&format!(
            "CREATE SEQUENCE IF NOT EXISTS {ARTIFACT_ID_SEQUENCE} \
             MINVALUE {min} START WITH {min}",
            min = i64::MIN
        ))?;
    }
    Ok(())
}

/// Creates every table of the current schema and records the version.
///
/// Runs inside the caller's transaction.
pub fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_ddl(SCHEMA_DDL)?;
    conn.execute_batch(INDEX_DDL)?;
    conn.execute_batch(ARTIFACT_OBJECT_INDEX_DDL)?;
    seed_lookup_tables(conn)?;
    create_artifact_sequence(conn)?;

    let current = SchemaVersion::CURRENT;
    conn.execute(
        "INSERT INTO schema_info (major, minor) VALUES (?, ?)",
        crate::values![current.major, current.minor],
    )?;
    write_version(conn, current)?;
    insert_extended_if_absent(conn, CREATION_MAJOR_KEY, &current.major.to_string())?;
    insert_extended_if_absent(conn, CREATION_MINOR_KEY, &current.minor.to_string())?;
    Ok(())
}
