//! Image ingest: data sources and the volume/file-system layers above them.

use crate::case::CaseDb;
use crate::db::{CaseDbTransaction, SqlValue};
use crate::error::{Error, Result};
use crate::model::{Content, FileSystem, Image, ObjectType, Volume, VolumeSystem};
use std::path::Path;
use tracing::info;

/// Hook for the external image parser.
///
/// Runs inside the transaction that inserted the image, so everything it
/// adds commits or rolls back together with the image.
pub trait ImageProcessor {
    /// Populates the object tree under a freshly inserted image.
    ///
    /// # Errors
    ///
    /// Any error aborts the whole ingest.
    fn process(&mut self, tx: &CaseDbTransaction<'_>, image: &Image) -> Result<()>;
}

/// A disk image to register as a data source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewImage {
    /// Image format code.
    pub image_type: i64,
    /// Sector size in bytes.
    pub sector_size: i64,
    /// Time zone of the evidence.
    pub time_zone: String,
    /// Total size in bytes.
    pub size: i64,
    /// MD5 of the whole image.
    pub md5: Option<String>,
    /// SHA-1 of the whole image.
    pub sha1: Option<String>,
    /// SHA-256 of the whole image.
    pub sha256: Option<String>,
    /// Segment paths, in order.
    pub paths: Vec<String>,
    /// Device id; a random UUID when absent.
    pub device_id: Option<String>,
}

impl NewImage {
    /// A raw image with 512-byte sectors in UTC.
    pub fn raw(paths: Vec<String>, size: i64) -> Self {
        Self {
            image_type: 0,
            sector_size: 512,
            time_zone: "UTC".to_string(),
            size,
            md5: None,
            sha1: None,
            sha256: None,
            paths,
            device_id: None,
        }
    }
}

/// A partition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewVolumeSystem {
    /// Image holding the table.
    pub parent_id: i64,
    /// Partition table type code.
    pub vs_type: i64,
    /// Byte offset inside the image.
    pub img_offset: i64,
    /// Block size in bytes.
    pub block_size: i64,
}

/// A partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewVolume {
    /// Volume system holding the partition.
    pub parent_id: i64,
    /// Partition address within the table.
    pub addr: i64,
    /// First block.
    pub start: i64,
    /// Length in blocks.
    pub length: i64,
    /// Partition description.
    pub description: String,
    /// Partition flags.
    pub flags: i64,
}

/// A file system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFileSystem {
    /// Image or volume holding the file system.
    pub parent_id: i64,
    /// Byte offset inside the image.
    pub img_offset: i64,
    /// File system type code.
    pub fs_type: i64,
    /// Block size in bytes.
    pub block_size: i64,
    /// Number of blocks.
    pub block_count: i64,
    /// Metadata address of the root directory.
    pub root_inum: i64,
    /// First metadata address.
    pub first_inum: i64,
    /// Last metadata address.
    pub last_inum: i64,
    /// Optional display name.
    pub display_name: Option<String>,
}

impl CaseDbTransaction<'_> {
    /// Registers an image data source with its segment paths.
    pub fn add_image(&self, new: NewImage) -> Result<Image> {
        if new.paths.is_empty() {
            return Err(Error::invalid_argument("an image needs at least one path"));
        }
        let conn = self.connection();
        let object_id = self.add_object(None, ObjectType::Image)?;
        conn.execute(
            "INSERT INTO image_info (obj_id, type, ssize, tzone, size, md5, sha1, sha256) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            &[
                SqlValue::from(object_id),
                SqlValue::from(new.image_type),
                SqlValue::from(new.sector_size),
                SqlValue::from(&new.time_zone),
                SqlValue::from(new.size),
                SqlValue::from(new.md5.clone()),
                SqlValue::from(new.sha1.clone()),
                SqlValue::from(new.sha256.clone()),
            ],
        )?;
        for (sequence, path) in new.paths.iter().enumerate() {
            conn.execute(
                "INSERT INTO image_names (obj_id, name, sequence) VALUES (?, ?, ?)",
                &[
                    SqlValue::from(object_id),
                    SqlValue::from(path),
                    SqlValue::Integer(i64::try_from(sequence).unwrap_or(i64::MAX)),
                ],
            )?;
        }
        let device_id = new
            .device_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        conn.execute(
            "INSERT INTO data_source_info (obj_id, device_id, time_zone) VALUES (?, ?, ?)",
            crate::values![object_id, &device_id, &new.time_zone],
        )?;

        let name = new
            .paths
            .first()
            .and_then(|p| Path::new(p).file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let image = Image {
            object_id,
            name,
            image_type: new.image_type,
            sector_size: new.sector_size,
            time_zone: new.time_zone,
            size: new.size,
            md5: new.md5,
            sha1: new.sha1,
            sha256: new.sha256,
            paths: new.paths,
            device_id: Some(device_id),
        };
        self.remember(&Content::Image(image.clone()));
        info!(id = object_id, name = %image.name, "added image");
        Ok(image)
    }

    /// Adds a partition table under an image.
    pub fn add_volume_system(&self, new: NewVolumeSystem) -> Result<VolumeSystem> {
        match self.get_by_id(new.parent_id)? {
            Some(Content::Image(_)) => {}
            Some(_) => {
                return Err(Error::invalid_argument(format!(
                    "volume system parent {} is not an image",
                    new.parent_id
                )));
            }
            None => {
                return Err(Error::NotFound {
                    entity: "image",
                    id: new.parent_id,
                });
            }
        }
        let data_source_id = self.get_data_source_id(new.parent_id)?;
        let object_id = self.add_object(Some(new.parent_id), ObjectType::VolumeSystem)?;
        self.connection().execute(
            "INSERT INTO volume_system_info (obj_id, vs_type, img_offset, block_size) \
             VALUES (?, ?, ?, ?)",
            crate::values![object_id, new.vs_type, new.img_offset, new.block_size],
        )?;
        let vs = VolumeSystem {
            object_id,
            parent_id: new.parent_id,
            vs_type: new.vs_type,
            img_offset: new.img_offset,
            block_size: new.block_size,
        };
        self.remember(&Content::VolumeSystem(vs.clone()));
        self.cache_data_source(object_id, data_source_id);
        Ok(vs)
    }

    /// Adds a partition under a volume system.
    pub fn add_volume(&self, new: NewVolume) -> Result<Volume> {
        match self.get_by_id(new.parent_id)? {
            Some(Content::VolumeSystem(_)) => {}
            Some(_) => {
                return Err(Error::invalid_argument(format!(
                    "volume parent {} is not a volume system",
                    new.parent_id
                )));
            }
            None => {
                return Err(Error::NotFound {
                    entity: "volume system",
                    id: new.parent_id,
                });
            }
        }
        let data_source_id = self.get_data_source_id(new.parent_id)?;
        let object_id = self.add_object(Some(new.parent_id), ObjectType::Volume)?;
        self.connection().execute(
            "INSERT INTO volume_info (obj_id, addr, start, length, description, flags) \
             VALUES (?, ?, ?, ?, ?, ?)",
            crate::values![
                object_id,
                new.addr,
                new.start,
                new.length,
                &new.description,
                new.flags
            ],
        )?;
        let volume = Volume {
            object_id,
            parent_id: new.parent_id,
            addr: new.addr,
            start: new.start,
            length: new.length,
            description: new.description,
            flags: new.flags,
        };
        self.remember(&Content::Volume(volume.clone()));
        self.cache_data_source(object_id, data_source_id);
        Ok(volume)
    }

    /// Adds a file system under an image or volume.
    pub fn add_file_system(&self, new: NewFileSystem) -> Result<FileSystem> {
        match self.get_by_id(new.parent_id)? {
            Some(Content::Image(_) | Content::Volume(_)) => {}
            Some(_) => {
                return Err(Error::invalid_argument(format!(
                    "file system parent {} is neither an image nor a volume",
                    new.parent_id
                )));
            }
            None => {
                return Err(Error::NotFound {
                    entity: "object",
                    id: new.parent_id,
                });
            }
        }
        let data_source_id = self.get_data_source_id(new.parent_id)?;
        let object_id = self.add_object(Some(new.parent_id), ObjectType::FileSystem)?;
        self.connection().execute(
            "INSERT INTO file_system_info (obj_id, img_offset, fs_type, block_size, block_count, \
             root_inum, first_inum, last_inum, data_source_id, display_name) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            &[
                SqlValue::from(object_id),
                SqlValue::from(new.img_offset),
                SqlValue::from(new.fs_type),
                SqlValue::from(new.block_size),
                SqlValue::from(new.block_count),
                SqlValue::from(new.root_inum),
                SqlValue::from(new.first_inum),
                SqlValue::from(new.last_inum),
                SqlValue::from(data_source_id),
                SqlValue::from(new.display_name.clone()),
            ],
        )?;
        let fs = FileSystem {
            object_id,
            parent_id: new.parent_id,
            data_source_id,
            img_offset: new.img_offset,
            fs_type: new.fs_type,
            block_size: new.block_size,
            block_count: new.block_count,
            root_inum: new.root_inum,
            first_inum: new.first_inum,
            last_inum: new.last_inum,
            display_name: new.display_name,
        };
        self.remember(&Content::FileSystem(fs.clone()));
        Ok(fs)
    }
}

impl CaseDb {
    /// Adds an image and lets `processor` populate it, all in one
    /// transaction, then rebuilds the has-children index.
    pub fn add_image(
        &self,
        new: NewImage,
        processor: Option<&mut dyn ImageProcessor>,
    ) -> Result<Image> {
        let image = self.write(|tx| {
            let image = tx.add_image(new)?;
            if let Some(processor) = processor {
                processor.process(tx, &image)?;
            }
            Ok(image)
        })?;
        self.rebuild_children_index()?;
        Ok(image)
    }
}
