//! File-like inserts and single-column updates.

use crate::db::{CaseDbTransaction, SqlValue};
use crate::error::{Error, Result};
use crate::model::{
    AbstractFile, ByteRange, Content, DirFlag, FileDbType, FileKnown, MetaFlags, MetaType,
    NameType, ObjectType, Report, child_parent_path, file_extension,
};
use crate::repository::cache::CacheUndo;
use tracing::debug;

/// A file or directory parsed from a file system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFile {
    /// Parent directory (or the file system for the root directory).
    pub parent_id: i64,
    /// File system the entry belongs to.
    pub fs_object_id: i64,
    /// Entry name; empty for the root directory.
    pub name: String,
    /// Metadata address.
    pub meta_addr: i64,
    /// Directory entry type.
    pub dir_type: NameType,
    /// Metadata type.
    pub meta_type: MetaType,
    /// Directory entry allocation.
    pub dir_flag: DirFlag,
    /// Metadata flags.
    pub meta_flags: MetaFlags,
    /// Size in bytes.
    pub size: i64,
    /// Change time.
    pub ctime: i64,
    /// Creation time.
    pub crtime: i64,
    /// Access time.
    pub atime: i64,
    /// Modification time.
    pub mtime: i64,
    /// Mode bits.
    pub mode: i64,
    /// Owner id.
    pub uid: i64,
    /// Group id.
    pub gid: i64,
    /// Precomputed MD5.
    pub md5: Option<String>,
    /// Hash-set classification.
    pub known: FileKnown,
    /// Stores the entry as the slack space of a file.
    pub slack: bool,
}

impl NewFile {
    /// An allocated regular file.
    pub fn file(parent_id: i64, fs_object_id: i64, name: impl Into<String>, size: i64) -> Self {
        Self {
            parent_id,
            fs_object_id,
            name: name.into(),
            meta_addr: 0,
            dir_type: NameType::Reg,
            meta_type: MetaType::Reg,
            dir_flag: DirFlag::Alloc,
            meta_flags: MetaFlags::ALLOC | MetaFlags::USED,
            size,
            ctime: 0,
            crtime: 0,
            atime: 0,
            mtime: 0,
            mode: 0,
            uid: 0,
            gid: 0,
            md5: None,
            known: FileKnown::Unknown,
            slack: false,
        }
    }

    /// An allocated directory.
    pub fn directory(parent_id: i64, fs_object_id: i64, name: impl Into<String>) -> Self {
        Self {
            dir_type: NameType::Dir,
            meta_type: MetaType::Dir,
            ..Self::file(parent_id, fs_object_id, name, 0)
        }
    }
}

/// A file stored on the examiner's disk, added as a local or derived file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLocalFile {
    /// File name.
    pub name: String,
    /// Path on disk.
    pub local_path: String,
    /// Size in bytes.
    pub size: i64,
    /// Change time.
    pub ctime: i64,
    /// Creation time.
    pub crtime: i64,
    /// Access time.
    pub atime: i64,
    /// Modification time.
    pub mtime: i64,
    /// Precomputed MD5.
    pub md5: Option<String>,
    /// Hash-set classification.
    pub known: FileKnown,
    /// Detected MIME type.
    pub mime_type: Option<String>,
}

impl NewLocalFile {
    /// A file with no timestamps or hashes.
    pub fn new(name: impl Into<String>, local_path: impl Into<String>, size: i64) -> Self {
        Self {
            name: name.into(),
            local_path: local_path.into(),
            size,
            ctime: 0,
            crtime: 0,
            atime: 0,
            mtime: 0,
            md5: None,
            known: FileKnown::Unknown,
            mime_type: None,
        }
    }
}

/// A file made of image byte ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLayoutFile {
    /// File name.
    pub name: String,
    /// Size in bytes.
    pub size: i64,
    /// Backing ranges, in file order.
    pub ranges: Vec<ByteRange>,
    /// One of the layout-backed file types.
    pub kind: FileDbType,
}

/// A generated report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReport {
    /// Object the report is about, if any.
    pub parent_id: Option<i64>,
    /// Report location.
    pub path: String,
    /// Creation time (seconds since the epoch).
    pub created: i64,
    /// Module that generated it.
    pub module_name: String,
    /// Report name.
    pub report_name: String,
}

/// Checks a layout description before anything is written.
pub(crate) fn validate_layout(name: &str, size: i64, ranges: &[ByteRange]) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid_argument("layout file name must not be empty"));
    }
    if size < 0 {
        return Err(Error::invalid_argument(format!("{name}: negative size {size}")));
    }
    if ranges.is_empty() {
        return Err(Error::invalid_argument(format!("{name}: no byte ranges")));
    }
    if let Some(bad) = ranges.iter().find(|r| r.start < 0 || r.length <= 0) {
        return Err(Error::invalid_argument(format!(
            "{name}: invalid byte range start={} length={}",
            bad.start, bad.length
        )));
    }
    Ok(())
}

impl CaseDbTransaction<'_> {
    /// Allocates an object under `parent_id` and fills in everything a file
    /// inherits from its parent.
    fn child_file(&self, parent_id: i64, db_type: FileDbType, name: &str) -> Result<AbstractFile> {
        let parent = self.get_content(parent_id)?;
        let data_source_id = self.get_data_source_id(parent_id)?;
        let fs_object_id = match &parent {
            Content::FileSystem(fs) => Some(fs.object_id),
            other => other.as_file().and_then(|f| f.fs_object_id),
        };
        let object_id = self.add_object(Some(parent_id), ObjectType::AbstractFile)?;
        Ok(AbstractFile {
            object_id,
            parent_id: Some(parent_id),
            fs_object_id,
            data_source_id,
            db_type,
            name: name.to_string(),
            meta_addr: 0,
            dir_type: NameType::Reg,
            meta_type: MetaType::Reg,
            dir_flag: DirFlag::Alloc,
            meta_flags: MetaFlags::ALLOC | MetaFlags::USED,
            size: 0,
            ctime: 0,
            crtime: 0,
            atime: 0,
            mtime: 0,
            mode: 0,
            uid: 0,
            gid: 0,
            md5: None,
            sha256: None,
            mime_type: None,
            known: FileKnown::Unknown,
            parent_path: child_parent_path(&parent),
            extension: file_extension(name),
            local_path: None,
        })
    }

    fn insert_file(&self, file: &AbstractFile) -> Result<()> {
        let conn = self.connection();
        conn.execute(
            "INSERT INTO files (obj_id, fs_obj_id, type, name, meta_addr, dir_type, meta_type, \
             dir_flags, meta_flags, size, ctime, crtime, atime, mtime, mode, uid, gid, md5, known, \
             parent_path, data_source_id, mime_type, extension, sha256) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            &[
                SqlValue::from(file.object_id),
                SqlValue::from(file.fs_object_id),
                SqlValue::from(file.db_type.code()),
                SqlValue::from(&file.name),
                SqlValue::from(file.meta_addr),
                SqlValue::from(file.dir_type.code()),
                SqlValue::from(file.meta_type.code()),
                SqlValue::from(file.dir_flag.code()),
                SqlValue::from(file.meta_flags.bits()),
                SqlValue::from(file.size),
                SqlValue::from(file.ctime),
                SqlValue::from(file.crtime),
                SqlValue::from(file.atime),
                SqlValue::from(file.mtime),
                SqlValue::from(file.mode),
                SqlValue::from(file.uid),
                SqlValue::from(file.gid),
                SqlValue::from(file.md5.clone()),
                SqlValue::from(file.known.code()),
                SqlValue::from(&file.parent_path),
                SqlValue::from(file.data_source_id),
                SqlValue::from(file.mime_type.clone()),
                SqlValue::from(&file.extension),
                SqlValue::from(file.sha256.clone()),
            ],
        )?;
        if let Some(path) = &file.local_path {
            conn.execute(
                "INSERT INTO files_path (obj_id, path) VALUES (?, ?)",
                crate::values![file.object_id, path],
            )?;
        }
        self.remember(&Content::from_file(file.clone()));
        Ok(())
    }

    /// Adds a file, directory or slack entry parsed from a file system.
    pub fn add_file(&self, new: NewFile) -> Result<AbstractFile> {
        match self.get_by_id(new.fs_object_id)? {
            Some(Content::FileSystem(_)) => {}
            _ => {
                return Err(Error::NotFound {
                    entity: "file system",
                    id: new.fs_object_id,
                });
            }
        }
        let db_type = if new.slack {
            FileDbType::Slack
        } else {
            FileDbType::Fs
        };
        let mut file = self.child_file(new.parent_id, db_type, &new.name)?;
        file.fs_object_id = Some(new.fs_object_id);
        file.meta_addr = new.meta_addr;
        file.dir_type = new.dir_type;
        file.meta_type = new.meta_type;
        file.dir_flag = new.dir_flag;
        file.meta_flags = new.meta_flags;
        file.size = new.size;
        file.ctime = new.ctime;
        file.crtime = new.crtime;
        file.atime = new.atime;
        file.mtime = new.mtime;
        file.mode = new.mode;
        file.uid = new.uid;
        file.gid = new.gid;
        file.md5 = new.md5;
        file.known = new.known;
        self.insert_file(&file)?;
        Ok(file)
    }

    /// Adds a virtual directory under `parent_id`.
    pub fn add_virtual_directory(&self, parent_id: i64, name: &str) -> Result<AbstractFile> {
        let mut dir = self.child_file(parent_id, FileDbType::VirtualDir, name)?;
        dir.dir_type = NameType::VirtDir;
        dir.meta_type = MetaType::VirtDir;
        dir.extension = String::new();
        self.insert_file(&dir)?;
        debug!(id = dir.object_id, parent_id, name, "added virtual directory");
        Ok(dir)
    }

    /// Adds a local-files data source: a parentless virtual directory.
    pub fn add_local_files_data_source(
        &self,
        name: &str,
        device_id: Option<&str>,
        time_zone: &str,
    ) -> Result<AbstractFile> {
        let object_id = self.add_object(None, ObjectType::AbstractFile)?;
        let device_id = device_id.map_or_else(|| uuid::Uuid::new_v4().to_string(), str::to_string);
        self.connection().execute(
            "INSERT INTO data_source_info (obj_id, device_id, time_zone) VALUES (?, ?, ?)",
            crate::values![object_id, device_id, time_zone],
        )?;
        let root = AbstractFile {
            object_id,
            parent_id: None,
            fs_object_id: None,
            data_source_id: object_id,
            db_type: FileDbType::VirtualDir,
            name: name.to_string(),
            meta_addr: 0,
            dir_type: NameType::VirtDir,
            meta_type: MetaType::VirtDir,
            dir_flag: DirFlag::Alloc,
            meta_flags: MetaFlags::ALLOC | MetaFlags::USED,
            size: 0,
            ctime: 0,
            crtime: 0,
            atime: 0,
            mtime: 0,
            mode: 0,
            uid: 0,
            gid: 0,
            md5: None,
            sha256: None,
            mime_type: None,
            known: FileKnown::Unknown,
            parent_path: "/".to_string(),
            extension: String::new(),
            local_path: None,
        };
        self.insert_file(&root)?;
        debug!(id = object_id, name, "added local files data source");
        Ok(root)
    }

    /// Adds a directory from the local disk.
    pub fn add_local_directory(&self, parent_id: i64, name: &str) -> Result<AbstractFile> {
        let mut dir = self.child_file(parent_id, FileDbType::LocalDir, name)?;
        dir.dir_type = NameType::Dir;
        dir.meta_type = MetaType::Dir;
        dir.extension = String::new();
        self.insert_file(&dir)?;
        Ok(dir)
    }

    fn add_on_disk_file(
        &self,
        parent_id: i64,
        db_type: FileDbType,
        new: NewLocalFile,
    ) -> Result<AbstractFile> {
        if new.local_path.is_empty() {
            return Err(Error::invalid_argument(format!(
                "{}: local path must not be empty",
                new.name
            )));
        }
        let mut file = self.child_file(parent_id, db_type, &new.name)?;
        file.size = new.size;
        file.ctime = new.ctime;
        file.crtime = new.crtime;
        file.atime = new.atime;
        file.mtime = new.mtime;
        file.md5 = new.md5;
        file.known = new.known;
        file.mime_type = new.mime_type;
        file.local_path = Some(new.local_path);
        self.insert_file(&file)?;
        Ok(file)
    }

    /// Adds a file from the local disk.
    pub fn add_local_file(&self, parent_id: i64, new: NewLocalFile) -> Result<AbstractFile> {
        self.add_on_disk_file(parent_id, FileDbType::Local, new)
    }

    /// Adds a file derived from `parent_id` (extracted, decompressed) and
    /// stored on the local disk.
    pub fn add_derived_file(&self, parent_id: i64, new: NewLocalFile) -> Result<AbstractFile> {
        self.add_on_disk_file(parent_id, FileDbType::Derived, new)
    }

    /// Adds a file defined by image byte ranges.
    pub fn add_layout_file(&self, parent_id: i64, new: NewLayoutFile) -> Result<AbstractFile> {
        if !matches!(
            new.kind,
            FileDbType::Carved
                | FileDbType::UnallocBlocks
                | FileDbType::UnusedBlocks
                | FileDbType::LayoutFile
        ) {
            return Err(Error::invalid_argument(format!(
                "{:?} is not a layout file type",
                new.kind
            )));
        }
        validate_layout(&new.name, new.size, &new.ranges)?;
        let mut file = self.child_file(parent_id, new.kind, &new.name)?;
        file.size = new.size;
        if new.kind != FileDbType::LayoutFile {
            file.dir_flag = DirFlag::Unalloc;
            file.meta_flags = MetaFlags::UNALLOC;
        }
        self.insert_file(&file)?;
        for (sequence, range) in new.ranges.iter().enumerate() {
            self.connection().execute(
                "INSERT INTO file_layout (obj_id, byte_start, byte_len, sequence) VALUES (?, ?, ?, ?)",
                &[
                    SqlValue::from(file.object_id),
                    SqlValue::from(range.start),
                    SqlValue::from(range.length),
                    SqlValue::Integer(i64::try_from(sequence).unwrap_or(i64::MAX)),
                ],
            )?;
        }
        Ok(file)
    }

    /// Adds a report, optionally attached to an object.
    pub fn add_report(&self, new: NewReport) -> Result<Report> {
        let object_id = self.add_object(new.parent_id, ObjectType::Report)?;
        self.connection().execute(
            "INSERT INTO reports (obj_id, path, crtime, src_module_name, report_name) \
             VALUES (?, ?, ?, ?, ?)",
            crate::values![object_id, &new.path, new.created, &new.module_name, &new.report_name],
        )?;
        Ok(Report {
            object_id,
            parent_id: new.parent_id,
            path: new.path,
            created: new.created,
            module_name: new.module_name,
            report_name: new.report_name,
        })
    }

    fn update_file(
        &self,
        id: i64,
        sql: &str,
        params: &[SqlValue],
        apply: impl FnOnce(&mut AbstractFile),
    ) -> Result<()> {
        if self.connection().execute(sql, params)? == 0 {
            return Err(Error::NotFound { entity: "file", id });
        }
        let cached = self.case().caches.update_hot(id, |content| {
            if let Some(file) = content.as_file_mut() {
                apply(file);
            }
        });
        if cached {
            self.record(CacheUndo::Hot(id));
        }
        Ok(())
    }

    /// Records the MD5 of a file.
    pub fn set_md5(&self, id: i64, md5: &str) -> Result<()> {
        self.update_file(
            id,
            "UPDATE files SET md5 = ? WHERE obj_id = ?",
            crate::values![md5, id],
            |f| f.md5 = Some(md5.to_string()),
        )
    }

    /// Records the SHA-256 of a file.
    pub fn set_sha256(&self, id: i64, sha256: &str) -> Result<()> {
        self.update_file(
            id,
            "UPDATE files SET sha256 = ? WHERE obj_id = ?",
            crate::values![sha256, id],
            |f| f.sha256 = Some(sha256.to_string()),
        )
    }

    /// Records the detected MIME type of a file.
    pub fn set_mime_type(&self, id: i64, mime_type: &str) -> Result<()> {
        self.update_file(
            id,
            "UPDATE files SET mime_type = ? WHERE obj_id = ?",
            crate::values![mime_type, id],
            |f| f.mime_type = Some(mime_type.to_string()),
        )
    }

    /// Records the hash-set classification of a file.
    pub fn set_known(&self, id: i64, known: FileKnown) -> Result<()> {
        self.update_file(
            id,
            "UPDATE files SET known = ? WHERE obj_id = ?",
            crate::values![known.code(), id],
            |f| f.known = known,
        )
    }

    /// Renames a file; the extension follows the new name.
    pub fn set_name(&self, id: i64, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::invalid_argument("file name must not be empty"));
        }
        let extension = file_extension(name);
        self.update_file(
            id,
            "UPDATE files SET name = ?, extension = ? WHERE obj_id = ?",
            crate::values![name, &extension, id],
            |f| {
                f.name = name.to_string();
                f.extension = extension.clone();
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("", 1, vec![ByteRange::new(0, 1)] ; "empty name")]
    #[test_case("f.jpg", -1, vec![ByteRange::new(0, 1)] ; "negative size")]
    #[test_case("f.jpg", 1, vec![] ; "no ranges")]
    #[test_case("f.jpg", 1, vec![ByteRange::new(0, 0)] ; "zero length range")]
    #[test_case("f.jpg", 1, vec![ByteRange::new(-4, 2)] ; "negative start")]
    fn test_layout_rejected(name: &str, size: i64, ranges: Vec<ByteRange>) {
        let err = validate_layout(name, size, &ranges).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[test]
    fn test_layout_accepted() {
        validate_layout("f.jpg", 1024, &[ByteRange::new(0, 512), ByteRange::new(4096, 512)])
            .unwrap();
    }

    #[test]
    fn test_directory_constructor() {
        let dir = NewFile::directory(3, 2, "docs");
        assert_eq!(dir.meta_type, MetaType::Dir);
        assert_eq!(dir.dir_type, NameType::Dir);
        assert_eq!(dir.size, 0);
        assert!(!dir.slack);
    }
}
