//! Content nodes: the closed set of things an object id can resolve to.

use super::{DirFlag, FileDbType, FileKnown, MetaFlags, MetaType, NameType, ObjectType, ReviewStatus};
use serde::{Deserialize, Serialize};

/// A disk image data source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    /// Object id.
    pub object_id: i64,
    /// Display name (file name of the first segment).
    pub name: String,
    /// Image format code, as reported by the image parser.
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
    /// Device identifier recorded for the data source.
    pub device_id: Option<String>,
}

/// A partition table inside an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSystem {
    /// Object id.
    pub object_id: i64,
    /// Parent (the image).
    pub parent_id: i64,
    /// Partition table type code.
    pub vs_type: i64,
    /// Byte offset inside the image.
    pub img_offset: i64,
    /// Block size in bytes.
    pub block_size: i64,
}

/// A partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Object id.
    pub object_id: i64,
    /// Parent (the volume system).
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

/// A file system inside an image or volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSystem {
    /// Object id.
    pub object_id: i64,
    /// Parent (image or volume).
    pub parent_id: i64,
    /// Owning data source.
    pub data_source_id: i64,
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

/// Columns shared by every file-like node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbstractFile {
    /// Object id.
    pub object_id: i64,
    /// Parent object, if any.
    pub parent_id: Option<i64>,
    /// File system the file lives in, if any.
    pub fs_object_id: Option<i64>,
    /// Owning data source.
    pub data_source_id: i64,
    /// Origin of the row.
    pub db_type: FileDbType,
    /// File name.
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
    /// MD5, once computed.
    pub md5: Option<String>,
    /// SHA-256, once computed.
    pub sha256: Option<String>,
    /// Detected MIME type.
    pub mime_type: Option<String>,
    /// Hash-set classification.
    pub known: FileKnown,
    /// Path of the parent directory, ending with `/`.
    pub parent_path: String,
    /// Lower-case extension, empty when the name has none.
    pub extension: String,
    /// On-disk path for local and derived files.
    pub local_path: Option<String>,
}

impl AbstractFile {
    /// Full path of the file.
    pub fn path(&self) -> String {
        format!("{}{}", self.parent_path, self.name)
    }

    /// Returns true for directory-like nodes.
    pub const fn is_dir(&self) -> bool {
        matches!(self.meta_type, MetaType::Dir | MetaType::VirtDir)
            || matches!(self.db_type, FileDbType::VirtualDir | FileDbType::LocalDir)
    }

    /// Returns true for the root directory of a file system.
    pub fn is_root(&self) -> bool {
        self.db_type == FileDbType::Fs
            && self.meta_type == MetaType::Dir
            && self.fs_object_id.is_some()
            && self.parent_id == self.fs_object_id
    }
}

/// A generated report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    /// Object id.
    pub object_id: i64,
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

/// A blackboard artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Artifact id (separate space from object ids).
    pub artifact_id: i64,
    /// Object id minted for the artifact itself.
    pub object_id: i64,
    /// Object the artifact was found in.
    pub source_object_id: i64,
    /// Data source of the source object.
    pub data_source_object_id: i64,
    /// Artifact type.
    pub artifact_type_id: i64,
    /// Review state.
    pub review_status: ReviewStatus,
}

/// One row of the object forest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    /// Object id.
    pub object_id: i64,
    /// Parent object; `None` for data sources.
    pub parent_id: Option<i64>,
    /// Kind of node.
    pub object_type: ObjectType,
}

/// A run of image bytes backing part of a layout file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    /// Offset inside the image.
    pub start: i64,
    /// Length in bytes.
    pub length: i64,
}

impl ByteRange {
    /// Creates a range.
    pub const fn new(start: i64, length: i64) -> Self {
        Self { start, length }
    }
}

/// Anything an object id can resolve to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Content {
    /// Disk image.
    Image(Image),
    /// Partition table.
    VolumeSystem(VolumeSystem),
    /// Partition.
    Volume(Volume),
    /// File system.
    FileSystem(FileSystem),
    /// File from a file system.
    File(AbstractFile),
    /// Directory from a file system.
    Directory(AbstractFile),
    /// Virtual directory (`$CarvedFiles`, local data source roots).
    VirtualDirectory(AbstractFile),
    /// Directory added from the local disk.
    LocalDirectory(AbstractFile),
    /// File added from the local disk.
    LocalFile(AbstractFile),
    /// File derived from another file.
    DerivedFile(AbstractFile),
    /// File defined by byte ranges (carved, unallocated blocks).
    LayoutFile(AbstractFile),
    /// File slack space.
    SlackFile(AbstractFile),
    /// Blackboard artifact.
    Artifact(Artifact),
    /// Report.
    Report(Report),
}

impl Content {
    /// Object id.
    pub const fn id(&self) -> i64 {
        match self {
            Self::Image(c) => c.object_id,
            Self::VolumeSystem(c) => c.object_id,
            Self::Volume(c) => c.object_id,
            Self::FileSystem(c) => c.object_id,
            Self::Artifact(c) => c.object_id,
            Self::Report(c) => c.object_id,
            Self::File(f)
            | Self::Directory(f)
            | Self::VirtualDirectory(f)
            | Self::LocalDirectory(f)
            | Self::LocalFile(f)
            | Self::DerivedFile(f)
            | Self::LayoutFile(f)
            | Self::SlackFile(f) => f.object_id,
        }
    }

    /// Parent object id; `None` for data sources.
    pub const fn parent_id(&self) -> Option<i64> {
        match self {
            Self::Image(_) => None,
            Self::VolumeSystem(c) => Some(c.parent_id),
            Self::Volume(c) => Some(c.parent_id),
            Self::FileSystem(c) => Some(c.parent_id),
            Self::Artifact(c) => Some(c.source_object_id),
            Self::Report(c) => c.parent_id,
            Self::File(f)
            | Self::Directory(f)
            | Self::VirtualDirectory(f)
            | Self::LocalDirectory(f)
            | Self::LocalFile(f)
            | Self::DerivedFile(f)
            | Self::LayoutFile(f)
            | Self::SlackFile(f) => f.parent_id,
        }
    }

    /// Display name.
    pub fn name(&self) -> &str {
        match self {
            Self::Image(c) => &c.name,
            Self::VolumeSystem(_) | Self::Artifact(_) => "",
            Self::Volume(c) => &c.description,
            Self::FileSystem(c) => c.display_name.as_deref().unwrap_or(""),
            Self::Report(c) => &c.report_name,
            Self::File(f)
            | Self::Directory(f)
            | Self::VirtualDirectory(f)
            | Self::LocalDirectory(f)
            | Self::LocalFile(f)
            | Self::DerivedFile(f)
            | Self::LayoutFile(f)
            | Self::SlackFile(f) => &f.name,
        }
    }

    /// Kind stored in `objects.type`.
    pub const fn object_type(&self) -> ObjectType {
        match self {
            Self::Image(_) => ObjectType::Image,
            Self::VolumeSystem(_) => ObjectType::VolumeSystem,
            Self::Volume(_) => ObjectType::Volume,
            Self::FileSystem(_) => ObjectType::FileSystem,
            Self::Artifact(_) => ObjectType::Artifact,
            Self::Report(_) => ObjectType::Report,
            _ => ObjectType::AbstractFile,
        }
    }

    /// File columns, for file-like variants.
    pub const fn as_file(&self) -> Option<&AbstractFile> {
        match self {
            Self::File(f)
            | Self::Directory(f)
            | Self::VirtualDirectory(f)
            | Self::LocalDirectory(f)
            | Self::LocalFile(f)
            | Self::DerivedFile(f)
            | Self::LayoutFile(f)
            | Self::SlackFile(f) => Some(f),
            _ => None,
        }
    }

    pub(crate) const fn as_file_mut(&mut self) -> Option<&mut AbstractFile> {
        match self {
            Self::File(f)
            | Self::Directory(f)
            | Self::VirtualDirectory(f)
            | Self::LocalDirectory(f)
            | Self::LocalFile(f)
            | Self::DerivedFile(f)
            | Self::LayoutFile(f)
            | Self::SlackFile(f) => Some(f),
            _ => None,
        }
    }

    /// Wraps file columns in the variant their type and metadata call for.
    pub fn from_file(file: AbstractFile) -> Self {
        match file.db_type {
            FileDbType::Fs if file.meta_type == MetaType::Dir => Self::Directory(file),
            FileDbType::Fs => Self::File(file),
            FileDbType::Carved
            | FileDbType::UnallocBlocks
            | FileDbType::UnusedBlocks
            | FileDbType::LayoutFile => Self::LayoutFile(file),
            FileDbType::Derived => Self::DerivedFile(file),
            FileDbType::Local => Self::LocalFile(file),
            FileDbType::VirtualDir => Self::VirtualDirectory(file),
            FileDbType::Slack => Self::SlackFile(file),
            FileDbType::LocalDir => Self::LocalDirectory(file),
        }
    }

    /// Nodes that stay cached for the whole session.
    pub fn is_hot(&self) -> bool {
        match self {
            Self::Image(_) | Self::VolumeSystem(_) | Self::Volume(_) | Self::FileSystem(_) => true,
            Self::VirtualDirectory(_) => true,
            Self::Directory(f) => f.is_root(),
            _ => false,
        }
    }

    /// Returns true for data source roots.
    pub const fn is_data_source(&self) -> bool {
        match self {
            Self::Image(_) => true,
            Self::VirtualDirectory(f) | Self::LocalDirectory(f) => f.parent_id.is_none(),
            _ => false,
        }
    }
}

/// Lower-case extension of `name`, or empty.
///
/// Dot-files, names ending in a dot, and "extensions" containing whitespace
/// have none.
pub fn file_extension(name: &str) -> String {
    match name.rfind('.') {
        Some(dot) if dot > 0 && dot + 1 < name.len() => {
            let ext = &name[dot + 1..];
            if ext.chars().any(char::is_whitespace) {
                String::new()
            } else {
                ext.to_lowercase()
            }
        }
        _ => String::new(),
    }
}

/// `parent_path` for a new child of `parent`.
pub fn child_parent_path(parent: &Content) -> String {
    match parent.as_file() {
        Some(dir) if dir.name.is_empty() => "/".to_string(),
        Some(dir) => format!("{}{}/", dir.parent_path, dir.name),
        None => "/".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_file(db_type: FileDbType, meta_type: MetaType, name: &str) -> AbstractFile {
        AbstractFile {
            object_id: 4,
            parent_id: Some(3),
            fs_object_id: Some(2),
            data_source_id: 1,
            db_type,
            name: name.to_string(),
            meta_addr: 0,
            dir_type: NameType::Reg,
            meta_type,
            dir_flag: DirFlag::Alloc,
            meta_flags: MetaFlags::ALLOC,
            size: 10,
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
            parent_path: "/docs/".to_string(),
            extension: file_extension(name),
            local_path: None,
        }
    }

    #[test]
    fn test_extension_rules() {
        assert_eq!(file_extension("a.TXT"), "txt");
        assert_eq!(file_extension("archive.tar.gz"), "gz");
        assert_eq!(file_extension(".bashrc"), "");
        assert_eq!(file_extension("trailing."), "");
        assert_eq!(file_extension("noext"), "");
        assert_eq!(file_extension("odd.ex t"), "");
    }

    #[test]
    fn test_from_file_dispatch() {
        let dir = sample_file(FileDbType::Fs, MetaType::Dir, "docs");
        assert!(matches!(Content::from_file(dir), Content::Directory(_)));
        let carved = sample_file(FileDbType::Carved, MetaType::Reg, "f0001.jpg");
        assert!(matches!(Content::from_file(carved), Content::LayoutFile(_)));
        let slack = sample_file(FileDbType::Slack, MetaType::Reg, "a.txt-slack");
        assert!(matches!(Content::from_file(slack), Content::SlackFile(_)));
    }

    #[test]
    fn test_parent_path_rules() {
        let mut root = sample_file(FileDbType::Fs, MetaType::Dir, "");
        root.parent_path = "/".to_string();
        assert_eq!(child_parent_path(&Content::Directory(root)), "/");

        let docs = sample_file(FileDbType::Fs, MetaType::Dir, "docs");
        assert_eq!(child_parent_path(&Content::Directory(docs)), "/docs/docs/");

        let vs = Content::VolumeSystem(VolumeSystem {
            object_id: 2,
            parent_id: 1,
            vs_type: 1,
            img_offset: 0,
            block_size: 512,
        });
        assert_eq!(child_parent_path(&vs), "/");
    }

    #[test]
    fn test_root_directory_is_hot() {
        let mut root = sample_file(FileDbType::Fs, MetaType::Dir, "");
        root.parent_id = Some(2);
        assert!(root.is_root());
        assert!(Content::Directory(root).is_hot());
        let file = sample_file(FileDbType::Fs, MetaType::Reg, "a.txt");
        assert!(!Content::File(file).is_hot());
    }

    #[test]
    fn test_path_joins_parent_path() {
        let file = sample_file(FileDbType::Fs, MetaType::Reg, "a.txt");
        assert_eq!(file.path(), "/docs/a.txt");
    }

    proptest! {
        #[test]
        fn prop_extension_is_lowercase_suffix(stem in "[a-zA-Z0-9_]{1,12}", ext in "[a-zA-Z0-9]{1,6}") {
            let name = format!("{stem}.{ext}");
            let found = file_extension(&name);
            prop_assert_eq!(found.clone(), ext.to_lowercase());
            prop_assert!(name.to_lowercase().ends_with(&found));
        }

        #[test]
        fn prop_dotfiles_have_no_extension(rest in "[a-z]{1,10}") {
            let name = format!(".{rest}");
            prop_assert_eq!(file_extension(&name), "");
        }
    }
}
