//! Carved files.
//!
//! Carved files of one file system, volume or image all land in a single
//! `$CarvedFiles` virtual directory:
//!
//! - under the root directory for a file system
//! - directly under the volume or image otherwise
//!
//! The directory is looked up or created once per root and memoized for the
//! session.

use crate::case::CaseDb;
use crate::db::CaseDbTransaction;
use crate::error::Result;
use crate::model::{AbstractFile, ByteRange, Content, FileDbType};
use crate::repository::NewLayoutFile;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Name of the virtual directory holding carved files.
pub const CARVED_FILES_DIR: &str = "$CarvedFiles";

/// One carved file, as reported by a carver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarvedFile {
    /// File name.
    pub name: String,
    /// Size in bytes.
    pub size: i64,
    /// Image byte ranges, in file order.
    pub ranges: Vec<ByteRange>,
}

impl CarvedFile {
    /// A carved file backed by one contiguous run.
    pub fn contiguous(name: impl Into<String>, start: i64, length: i64) -> Self {
        Self {
            name: name.into(),
            size: length,
            ranges: vec![ByteRange::new(start, length)],
        }
    }
}

impl CaseDbTransaction<'_> {
    /// Adds carved files found under `parent_id`, in order.
    pub fn add_carved_files(
        &self,
        parent_id: i64,
        files: &[CarvedFile],
    ) -> Result<Vec<AbstractFile>> {
        let root = self.carving_root(parent_id)?;
        let dir = self.carved_files_dir(root)?;
        let mut added = Vec::with_capacity(files.len());
        for file in files {
            added.push(self.add_layout_file(
                dir,
                NewLayoutFile {
                    name: file.name.clone(),
                    size: file.size,
                    ranges: file.ranges.clone(),
                    kind: FileDbType::Carved,
                },
            )?);
        }
        debug!(parent_id, root, dir, count = added.len(), "added carved files");
        Ok(added)
    }

    /// Nearest ancestor that owns a `$CarvedFiles` directory. Falls back to
    /// `parent_id` itself when no file system, volume or image is found.
    fn carving_root(&self, parent_id: i64) -> Result<i64> {
        let mut current = Some(parent_id);
        while let Some(id) = current {
            if let Some(fs_id) = self.case().caches.file_system(id) {
                if fs_id != id {
                    current = Some(fs_id);
                    continue;
                }
            }
            let content = self.get_content(id)?;
            match content {
                Content::FileSystem(fs) => {
                    return Ok(self
                        .get_root_directory(fs.object_id)?
                        .map_or(fs.object_id, |root| root.object_id));
                }
                Content::Volume(_) | Content::Image(_) => return Ok(id),
                other => current = other.parent_id(),
            }
        }
        Ok(parent_id)
    }

    fn carved_files_dir(&self, root: i64) -> Result<i64> {
        if let Some(dir) = self.case().caches.carved_dir(root) {
            return Ok(dir);
        }
        let existing: Option<i64> = self.connection().query_value(
            "SELECT f.obj_id FROM files f JOIN objects o ON o.obj_id = f.obj_id \
             WHERE o.par_obj_id = ? AND f.name = ? AND f.type = ? ORDER BY f.obj_id LIMIT 1",
            crate::values![root, CARVED_FILES_DIR, FileDbType::VirtualDir.code()],
        )?;
        let dir = match existing {
            Some(dir) => dir,
            None => {
                let dir = self.add_virtual_directory(root, CARVED_FILES_DIR)?;
                info!(root, dir = dir.object_id, "created carved files directory");
                dir.object_id
            }
        };
        self.cache_carved_dir(root, dir);
        Ok(dir)
    }
}

impl CaseDb {
    /// Adds a batch of carved files in one transaction.
    pub fn add_carved_files(&self, parent_id: i64, files: &[CarvedFile]) -> Result<Vec<AbstractFile>> {
        self.write(|tx| tx.add_carved_files(parent_id, files))
    }
}
