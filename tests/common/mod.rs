//! Shared fixtures for the integration tests.

#![allow(dead_code, clippy::expect_used)]

use casedb::model::{FileSystem, Image};
use casedb::{AbstractFile, CaseDb, CaseDbConfig, NewFile, NewFileSystem, NewImage};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Size of the synthetic raw image.
pub const IMAGE_SIZE: usize = 64 * 1024;

/// Offset of the marker bytes inside the image.
pub const MARKER_OFFSET: usize = 4096;

/// Marker written at [`MARKER_OFFSET`].
pub const MARKER: &[u8] = b"0123456789";

/// A fresh embedded case in its own directory.
pub fn create_case() -> (CaseDb, TempDir) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let case = CaseDb::create(&CaseDbConfig::embedded(case_path(&dir))).expect("Failed to create case");
    (case, dir)
}

/// Path of the case file inside `dir`.
pub fn case_path(dir: &TempDir) -> PathBuf {
    dir.path().join("case.db")
}

/// Writes a raw image with [`MARKER`] at [`MARKER_OFFSET`].
pub fn write_raw_image(dir: &Path) -> PathBuf {
    let mut bytes = vec![0u8; IMAGE_SIZE];
    bytes[MARKER_OFFSET..MARKER_OFFSET + MARKER.len()].copy_from_slice(MARKER);
    let path = dir.join("disk.raw");
    std::fs::write(&path, bytes).expect("Failed to write image");
    path
}

/// An image holding one file system with a root directory.
pub struct Evidence {
    pub image: Image,
    pub fs: FileSystem,
    pub root: AbstractFile,
}

/// Adds the raw image, a file system at offset 0 and its root directory.
pub fn add_evidence(case: &CaseDb, dir: &Path) -> Evidence {
    let image_path = write_raw_image(dir);
    case.write(|tx| {
        let image = tx.add_image(NewImage::raw(
            vec![image_path.display().to_string()],
            IMAGE_SIZE as i64,
        ))?;
        let fs = tx.add_file_system(NewFileSystem {
            parent_id: image.object_id,
            img_offset: 0,
            fs_type: 1,
            block_size: 512,
            block_count: (IMAGE_SIZE / 512) as i64,
            root_inum: 2,
            first_inum: 0,
            last_inum: 64,
            display_name: None,
        })?;
        let root = tx.add_file(NewFile {
            meta_addr: 2,
            ..NewFile::directory(fs.object_id, fs.object_id, "")
        })?;
        Ok(Evidence { image, fs, root })
    })
    .expect("Failed to add evidence")
}
