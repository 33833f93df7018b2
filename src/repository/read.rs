//! Reading the bytes behind a content node.
//!
//! Images are read through an [`ImageReader`]. The bundled
//! [`RawImageReader`] memory-maps raw and split-raw images; other formats
//! plug in through [`CaseDbConnection::read_content_with`].

use crate::db::CaseDbConnection;
use crate::error::{Error, Result, StorageError};
use crate::model::{AbstractFile, Content, Image};
use memmap2::Mmap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Random access to the bytes of one image.
pub trait ImageReader: Send + Sync {
    /// Total size in bytes.
    fn size(&self) -> u64;

    /// Reads up to `buf.len()` bytes at `offset`. Returns the number of
    /// bytes read; 0 at or past the end.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage cannot be read.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;
}

struct Segment {
    start: u64,
    len: u64,
    map: Option<Mmap>,
}

/// Memory-mapped raw image, possibly split over several segment files.
pub struct RawImageReader {
    paths: Vec<PathBuf>,
    segments: Vec<Segment>,
    size: u64,
}

impl std::fmt::Debug for RawImageReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawImageReader")
            .field("paths", &self.paths)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl RawImageReader {
    /// Maps every segment, in order.
    ///
    /// # Errors
    ///
    /// Returns an error if there are no segments or one cannot be mapped.
    pub fn open<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        if paths.is_empty() {
            return Err(Error::invalid_argument("raw image has no segments"));
        }
        let mut segments = Vec::with_capacity(paths.len());
        let mut size = 0u64;
        for path in paths {
            let path = path.as_ref();
            let file = File::open(path).map_err(|e| Error::io(path, &e))?;
            let len = file.metadata().map_err(|e| Error::io(path, &e))?.len();
            let map = if len == 0 {
                None
            } else {
                // Safety: the segment is only read; images are not modified while a case is open
                Some(unsafe { Mmap::map(&file).map_err(|e| Error::io(path, &e))? })
            };
            segments.push(Segment {
                start: size,
                len,
                map,
            });
            size += len;
        }
        debug!(segments = segments.len(), size, "mapped raw image");
        Ok(Self {
            paths: paths.iter().map(|p| p.as_ref().to_path_buf()).collect(),
            segments,
            size,
        })
    }
}

impl ImageReader for RawImageReader {
    fn size(&self) -> u64 {
        self.size
    }

    #[allow(clippy::cast_possible_truncation)]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut done = 0usize;
        let mut position = offset;
        for segment in &self.segments {
            if done == buf.len() {
                break;
            }
            let end = segment.start + segment.len;
            if position >= end || position < segment.start {
                continue;
            }
            let Some(map) = &segment.map else { continue };
            let local = (position - segment.start) as usize;
            let n = (buf.len() - done).min(map.len() - local);
            buf[done..done + n].copy_from_slice(&map[local..local + n]);
            done += n;
            position += n as u64;
        }
        Ok(done)
    }
}

fn to_u64(value: i64, what: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| Error::InvalidState {
        message: format!("negative {what}: {value}"),
    })
}

#[allow(clippy::cast_possible_truncation)]
fn read_window(
    reader: &dyn ImageReader,
    base: u64,
    len: u64,
    offset: u64,
    buf: &mut [u8],
) -> Result<usize> {
    if offset >= len {
        return Ok(0);
    }
    let n = (len - offset).min(buf.len() as u64) as usize;
    reader.read_at(base + offset, &mut buf[..n])
}

#[allow(clippy::cast_possible_truncation)]
fn read_local(file: &AbstractFile, offset: u64, buf: &mut [u8]) -> Result<usize> {
    let Some(path) = file.local_path.as_deref() else {
        return Err(StorageError::Unsupported(format!("{} has no local path", file.name)).into());
    };
    let size = to_u64(file.size, "file size")?;
    if offset >= size {
        return Ok(0);
    }
    let want = (size - offset).min(buf.len() as u64) as usize;
    let mut handle = File::open(path).map_err(|e| Error::io(path, &e))?;
    handle
        .seek(SeekFrom::Start(offset))
        .map_err(|e| Error::io(path, &e))?;
    let mut done = 0;
    while done < want {
        match handle.read(&mut buf[done..want]) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(Error::io(path, &e)),
        }
    }
    Ok(done)
}

impl CaseDbConnection<'_> {
    fn raw_reader(&self, image: &Image) -> Result<Arc<RawImageReader>> {
        let caches = &self.case().caches;
        if let Some(reader) = caches.image_reader(image.object_id) {
            return Ok(reader);
        }
        let reader = Arc::new(RawImageReader::open(image.paths.as_slice())?);
        if !self.is_writable() {
            caches.insert_image_reader(image.object_id, Arc::clone(&reader));
        }
        Ok(reader)
    }

    /// Reads bytes of `content` at `offset`, opening its image as raw.
    pub fn read_content(&self, content: &Content, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if let Content::LocalFile(file) | Content::DerivedFile(file) = content {
            return read_local(file, offset, buf);
        }
        let data_source = self.get_data_source_id(content.id())?;
        let image = self.get_image(data_source)?;
        let reader = self.raw_reader(&image)?;
        self.read_content_with(reader.as_ref(), content, offset, buf)
    }

    /// Reads bytes of `content` at `offset` through `reader`, which must
    /// serve the image `content` belongs to.
    #[allow(clippy::cast_possible_truncation)]
    pub fn read_content_with(
        &self,
        reader: &dyn ImageReader,
        content: &Content,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        match content {
            Content::Image(_) => read_window(reader, 0, reader.size(), offset, buf),
            Content::Volume(volume) => {
                let Content::VolumeSystem(vs) = self.get_content(volume.parent_id)? else {
                    return Err(Error::InvalidState {
                        message: format!("volume {} has no volume system", volume.object_id),
                    });
                };
                let base = to_u64(vs.img_offset, "volume system offset")?
                    + to_u64(volume.start, "volume start")? * to_u64(vs.block_size, "block size")?;
                let len = to_u64(volume.length, "volume length")? * to_u64(vs.block_size, "block size")?;
                read_window(reader, base, len, offset, buf)
            }
            Content::FileSystem(fs) => {
                let base = to_u64(fs.img_offset, "file system offset")?;
                let len = to_u64(fs.block_count, "block count")? * to_u64(fs.block_size, "block size")?;
                read_window(reader, base, len, offset, buf)
            }
            Content::LayoutFile(file) => {
                let ranges = self.get_file_ranges(file.object_id)?;
                let size = to_u64(file.size, "file size")?;
                let mut done = 0usize;
                let mut range_offset = 0u64;
                for range in ranges {
                    let start = to_u64(range.start, "range start")?;
                    let len = to_u64(range.length, "range length")?;
                    let position = offset + done as u64;
                    if done == buf.len() || position >= size {
                        break;
                    }
                    if position < range_offset + len {
                        let within = position - range_offset;
                        let limit = (size - position).min((buf.len() - done) as u64) as usize;
                        let n = read_window(reader, start, len, within, &mut buf[done..done + limit])?;
                        done += n;
                        if n == 0 {
                            break;
                        }
                        if (within + n as u64) < len {
                            // short read inside a range: image ended
                            break;
                        }
                    }
                    range_offset += len;
                }
                Ok(done)
            }
            Content::LocalFile(file) | Content::DerivedFile(file) => read_local(file, offset, buf),
            other => Err(StorageError::Unsupported(format!(
                "reading {:?} content needs an image parser",
                other.object_type()
            ))
            .into()),
        }
    }
}
