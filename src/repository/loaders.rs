//! Type-specific loaders, dispatched on the object type.

use crate::db::{Connection, Row};
use crate::error::Result;
use crate::model::{
    AbstractFile, Artifact, Content, DirFlag, FileDbType, FileKnown, FileSystem, Image, MetaFlags,
    MetaType, NameType, ObjectRecord, ObjectType, Report, ReviewStatus, Volume, VolumeSystem,
    file_extension,
};
use std::path::Path;

pub(crate) const OBJECT_SELECT: &str = "SELECT obj_id, par_obj_id, type FROM objects";

pub(crate) const FILE_SELECT: &str = "SELECT f.obj_id, o.par_obj_id, f.fs_obj_id, \
    f.data_source_id, f.type, f.name, f.meta_addr, f.dir_type, f.meta_type, f.dir_flags, \
    f.meta_flags, f.size, f.ctime, f.crtime, f.atime, f.mtime, f.mode, f.uid, f.gid, f.md5, \
    f.sha256, f.mime_type, f.known, f.parent_path, f.extension, p.path \
    FROM files f JOIN objects o ON o.obj_id = f.obj_id \
    LEFT JOIN files_path p ON p.obj_id = f.obj_id";

pub(crate) const ARTIFACT_SELECT: &str = "SELECT artifact_id, artifact_obj_id, obj_id, \
    data_source_obj_id, artifact_type_id, review_status_id FROM artifacts";

pub(crate) fn object_from_row(row: &Row) -> Result<ObjectRecord> {
    Ok(ObjectRecord {
        object_id: row.get(0)?,
        parent_id: row.get(1)?,
        object_type: ObjectType::from_code(row.get(2)?)?,
    })
}

pub(crate) fn load_object(conn: &Connection, id: i64) -> Result<Option<ObjectRecord>> {
    conn.query_opt(&format!("{OBJECT_SELECT} WHERE obj_id = ?"), crate::values![id])?
        .as_ref()
        .map(object_from_row)
        .transpose()
}

fn opt_i64(row: &Row, index: usize) -> Result<i64> {
    Ok(row.get::<Option<i64>>(index)?.unwrap_or(0))
}

/// Maps one [`FILE_SELECT`] row. Columns added by upgrades may be NULL on
/// rows the upgrade could not fill; those fall back to neutral values.
pub(crate) fn file_from_row(row: &Row) -> Result<AbstractFile> {
    let name: String = row.get(5)?;
    let extension = match row.get::<Option<String>>(24)? {
        Some(ext) => ext,
        None => file_extension(&name),
    };
    Ok(AbstractFile {
        object_id: row.get(0)?,
        parent_id: row.get(1)?,
        fs_object_id: row.get(2)?,
        data_source_id: opt_i64(row, 3)?,
        db_type: FileDbType::from_code(opt_i64(row, 4)?)?,
        name,
        meta_addr: opt_i64(row, 6)?,
        dir_type: NameType::from_code(opt_i64(row, 7)?)?,
        meta_type: MetaType::from_code(opt_i64(row, 8)?)?,
        dir_flag: match row.get::<Option<i64>>(9)? {
            Some(code) => DirFlag::from_code(code)?,
            None => DirFlag::Alloc,
        },
        meta_flags: MetaFlags::from_bits(opt_i64(row, 10)?),
        size: opt_i64(row, 11)?,
        ctime: opt_i64(row, 12)?,
        crtime: opt_i64(row, 13)?,
        atime: opt_i64(row, 14)?,
        mtime: opt_i64(row, 15)?,
        mode: opt_i64(row, 16)?,
        uid: opt_i64(row, 17)?,
        gid: opt_i64(row, 18)?,
        md5: row.get(19)?,
        sha256: row.get(20)?,
        mime_type: row.get(21)?,
        known: FileKnown::from_code(opt_i64(row, 22)?)?,
        parent_path: row.get::<Option<String>>(23)?.unwrap_or_else(|| "/".to_string()),
        extension,
        local_path: row.get(25)?,
    })
}

pub(crate) fn load_file(conn: &Connection, id: i64) -> Result<Option<AbstractFile>> {
    conn.query_opt(&format!("{FILE_SELECT} WHERE f.obj_id = ?"), crate::values![id])?
        .as_ref()
        .map(file_from_row)
        .transpose()
}

pub(crate) fn artifact_from_row(row: &Row) -> Result<Artifact> {
    Ok(Artifact {
        artifact_id: row.get(0)?,
        object_id: row.get(1)?,
        source_object_id: row.get(2)?,
        data_source_object_id: opt_i64(row, 3)?,
        artifact_type_id: row.get(4)?,
        review_status: ReviewStatus::from_code(opt_i64(row, 5)?)?,
    })
}

fn load_image(conn: &Connection, id: i64) -> Result<Option<Image>> {
    let Some(row) = conn.query_opt(
        "SELECT type, ssize, tzone, size, md5, sha1, sha256 FROM image_info WHERE obj_id = ?",
        crate::values![id],
    )?
    else {
        return Ok(None);
    };
    let paths = conn
        .query(
            "SELECT name FROM image_names WHERE obj_id = ? ORDER BY sequence",
            crate::values![id],
        )?
        .iter()
        .map(|r| r.get::<String>(0))
        .collect::<Result<Vec<_>>>()?;
    let device_id = conn.query_value::<String>(
        "SELECT device_id FROM data_source_info WHERE obj_id = ?",
        crate::values![id],
    )?;
    let name = paths
        .first()
        .and_then(|p| Path::new(p).file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(Some(Image {
        object_id: id,
        name,
        image_type: opt_i64(&row, 0)?,
        sector_size: opt_i64(&row, 1)?,
        time_zone: row.get::<Option<String>>(2)?.unwrap_or_default(),
        size: opt_i64(&row, 3)?,
        md5: row.get(4)?,
        sha1: row.get(5)?,
        sha256: row.get(6)?,
        paths,
        device_id,
    }))
}

fn load_volume_system(conn: &Connection, record: ObjectRecord) -> Result<Option<VolumeSystem>> {
    let row = conn.query_opt(
        "SELECT vs_type, img_offset, block_size FROM volume_system_info WHERE obj_id = ?",
        crate::values![record.object_id],
    )?;
    row.map(|row| {
        Ok(VolumeSystem {
            object_id: record.object_id,
            parent_id: record.parent_id.unwrap_or_default(),
            vs_type: row.get(0)?,
            img_offset: row.get(1)?,
            block_size: row.get(2)?,
        })
    })
    .transpose()
}

fn load_volume(conn: &Connection, record: ObjectRecord) -> Result<Option<Volume>> {
    let row = conn.query_opt(
        "SELECT addr, start, length, description, flags FROM volume_info WHERE obj_id = ?",
        crate::values![record.object_id],
    )?;
    row.map(|row| {
        Ok(Volume {
            object_id: record.object_id,
            parent_id: record.parent_id.unwrap_or_default(),
            addr: row.get(0)?,
            start: row.get(1)?,
            length: row.get(2)?,
            description: row.get::<Option<String>>(3)?.unwrap_or_default(),
            flags: row.get(4)?,
        })
    })
    .transpose()
}

fn load_file_system(conn: &Connection, record: ObjectRecord) -> Result<Option<FileSystem>> {
    let row = conn.query_opt(
        "SELECT img_offset, fs_type, block_size, block_count, root_inum, first_inum, last_inum, \
         data_source_id, display_name FROM file_system_info WHERE obj_id = ?",
        crate::values![record.object_id],
    )?;
    row.map(|row| {
        Ok(FileSystem {
            object_id: record.object_id,
            parent_id: record.parent_id.unwrap_or_default(),
            img_offset: row.get(0)?,
            fs_type: row.get(1)?,
            block_size: row.get(2)?,
            block_count: row.get(3)?,
            root_inum: row.get(4)?,
            first_inum: row.get(5)?,
            last_inum: row.get(6)?,
            data_source_id: opt_i64(&row, 7)?,
            display_name: row.get(8)?,
        })
    })
    .transpose()
}

fn load_report(conn: &Connection, record: ObjectRecord) -> Result<Option<Report>> {
    let row = conn.query_opt(
        "SELECT path, crtime, src_module_name, report_name FROM reports WHERE obj_id = ?",
        crate::values![record.object_id],
    )?;
    row.map(|row| {
        Ok(Report {
            object_id: record.object_id,
            parent_id: record.parent_id,
            path: row.get(0)?,
            created: row.get(1)?,
            module_name: row.get(2)?,
            report_name: row.get(3)?,
        })
    })
    .transpose()
}

/// Loads the node an identity row points at. `None` when the type table
/// has no matching row.
pub(crate) fn load_content(conn: &Connection, record: ObjectRecord) -> Result<Option<Content>> {
    let id = record.object_id;
    Ok(match record.object_type {
        ObjectType::Image => load_image(conn, id)?.map(Content::Image),
        ObjectType::VolumeSystem => load_volume_system(conn, record)?.map(Content::VolumeSystem),
        ObjectType::Volume => load_volume(conn, record)?.map(Content::Volume),
        ObjectType::FileSystem => load_file_system(conn, record)?.map(Content::FileSystem),
        ObjectType::AbstractFile => load_file(conn, id)?.map(Content::from_file),
        ObjectType::Artifact => conn
            .query_opt(
                &format!("{ARTIFACT_SELECT} WHERE artifact_obj_id = ?"),
                crate::values![id],
            )?
            .as_ref()
            .map(artifact_from_row)
            .transpose()?
            .map(Content::Artifact),
        ObjectType::Report => load_report(conn, record)?.map(Content::Report),
    })
}
