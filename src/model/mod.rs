//! Data model shared by the repository, blackboard and carving code.
//!
//! Stored discriminators are small integers; each enum here maps them both
//! ways and rejects unknown codes with [`StorageError::UnknownCode`].

pub mod content;

pub use content::{
    AbstractFile, Artifact, ByteRange, Content, FileSystem, Image, ObjectRecord, Report, Volume,
    VolumeSystem, child_parent_path, file_extension,
};

use crate::error::{Result, StorageError};
use serde::{Deserialize, Serialize};

macro_rules! coded_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident = $code:expr),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            /// Every variant, in code order.
            pub const ALL: &'static [Self] = &[$(Self::$variant),+];

            /// Stored discriminator.
            pub const fn code(self) -> i64 {
                match self {
                    $(Self::$variant => $code),+
                }
            }

            /// Maps a stored discriminator back to a variant.
            pub fn from_code(code: i64) -> Result<Self> {
                match code {
                    $(c if c == $code => Ok(Self::$variant),)+
                    _ => Err(StorageError::UnknownCode {
                        kind: stringify!($name),
                        code,
                    }
                    .into()),
                }
            }
        }
    };
}

coded_enum! {
    /// Kind of node in the object forest (`objects.type`).
    pub enum ObjectType {
        /// Disk image data source.
        Image = 0,
        /// Partition table.
        VolumeSystem = 1,
        /// Partition.
        Volume = 2,
        /// File system.
        FileSystem = 3,
        /// Any file-like node; see [`FileDbType`].
        AbstractFile = 4,
        /// Blackboard artifact.
        Artifact = 5,
        /// Generated report.
        Report = 6,
    }
}

coded_enum! {
    /// Origin of a file row (`files.type`).
    pub enum FileDbType {
        /// Parsed from a file system.
        Fs = 0,
        /// Carved from unallocated space.
        Carved = 1,
        /// Derived from another file (extracted, decoded).
        Derived = 2,
        /// Local file added outside any image.
        Local = 3,
        /// Unallocated blocks of a file system.
        UnallocBlocks = 4,
        /// Unused blocks of a volume system.
        UnusedBlocks = 5,
        /// Virtual directory.
        VirtualDir = 6,
        /// File slack space.
        Slack = 7,
        /// Local directory.
        LocalDir = 8,
        /// File defined only by byte ranges.
        LayoutFile = 9,
    }
}

coded_enum! {
    /// Directory entry type (`files.dir_type`).
    pub enum NameType {
        /// Unknown.
        Undef = 0,
        /// Named pipe.
        Fifo = 1,
        /// Character device.
        Chr = 2,
        /// Directory.
        Dir = 3,
        /// Block device.
        Blk = 4,
        /// Regular file.
        Reg = 5,
        /// Symbolic link.
        Lnk = 6,
        /// Socket.
        Sock = 7,
        /// Shadow inode.
        Shad = 8,
        /// Whiteout.
        Wht = 9,
        /// Virtual file.
        Virt = 10,
        /// Virtual directory.
        VirtDir = 11,
    }
}

coded_enum! {
    /// Metadata type (`files.meta_type`).
    pub enum MetaType {
        /// Unknown.
        Undef = 0,
        /// Regular file.
        Reg = 1,
        /// Directory.
        Dir = 2,
        /// Named pipe.
        Fifo = 3,
        /// Character device.
        Chr = 4,
        /// Block device.
        Blk = 5,
        /// Symbolic link.
        Lnk = 6,
        /// Shadow inode.
        Shad = 7,
        /// Socket.
        Sock = 8,
        /// Whiteout.
        Wht = 9,
        /// Virtual file.
        Virt = 10,
        /// Virtual directory.
        VirtDir = 11,
    }
}

coded_enum! {
    /// Allocation state of the directory entry (`files.dir_flags`).
    pub enum DirFlag {
        /// Entry is allocated.
        Alloc = 1,
        /// Entry is unallocated.
        Unalloc = 2,
    }
}

coded_enum! {
    /// Hash-set classification (`files.known`).
    pub enum FileKnown {
        /// Not looked up.
        Unknown = 0,
        /// In a known-good set.
        Known = 1,
        /// In a notable set.
        Notable = 2,
    }
}

coded_enum! {
    /// Examiner review state of an artifact.
    pub enum ReviewStatus {
        /// Not reviewed.
        Undecided = 0,
        /// Confirmed.
        Approved = 1,
        /// Dismissed; hidden from default queries.
        Rejected = 2,
    }
}

coded_enum! {
    /// Declared value kind of an attribute type.
    pub enum ValueKind {
        /// UTF-8 text.
        String = 0,
        /// 32-bit integer.
        Integer = 1,
        /// 64-bit integer.
        Long = 2,
        /// Double-precision float.
        Double = 3,
        /// Raw bytes.
        Bytes = 4,
        /// Seconds since the epoch.
        DateTime = 5,
        /// JSON document.
        Json = 6,
    }
}

coded_enum! {
    /// Category of an artifact type.
    pub enum ArtifactCategory {
        /// Data extracted from the evidence.
        DataArtifact = 0,
        /// Conclusion drawn by an analysis module.
        AnalysisResult = 1,
    }
}

/// Metadata flags bitmask (`files.meta_flags`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MetaFlags(i64);

impl MetaFlags {
    /// Metadata structure is allocated.
    pub const ALLOC: Self = Self(0x01);
    /// Metadata structure is unallocated.
    pub const UNALLOC: Self = Self(0x02);
    /// Metadata structure has been used.
    pub const USED: Self = Self(0x04);
    /// Metadata structure was never used.
    pub const UNUSED: Self = Self(0x08);
    /// Content is compressed.
    pub const COMP: Self = Self(0x10);
    /// File has no parent directory.
    pub const ORPHAN: Self = Self(0x20);

    /// Wraps a stored value.
    pub const fn from_bits(bits: i64) -> Self {
        Self(bits)
    }

    /// Stored value.
    pub const fn bits(self) -> i64 {
        self.0
    }

    /// Returns true when every bit of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for MetaFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_round_trip() {
        for ty in ObjectType::ALL {
            assert_eq!(ObjectType::from_code(ty.code()).unwrap(), *ty);
        }
        for ty in FileDbType::ALL {
            assert_eq!(FileDbType::from_code(ty.code()).unwrap(), *ty);
        }
    }

    #[test]
    fn test_stored_codes_are_stable() {
        assert_eq!(ObjectType::AbstractFile.code(), 4);
        assert_eq!(FileDbType::Carved.code(), 1);
        assert_eq!(FileDbType::LayoutFile.code(), 9);
        assert_eq!(ReviewStatus::Rejected.code(), 2);
        assert_eq!(ValueKind::Json.code(), 6);
        assert_eq!(DirFlag::Unalloc.code(), 2);
    }

    #[test]
    fn test_unknown_code() {
        let err = ValueKind::from_code(42).unwrap_err();
        assert_eq!(err.to_string(), "storage error: unknown ValueKind code 42");
    }

    #[test]
    fn test_meta_flags() {
        let flags = MetaFlags::UNALLOC | MetaFlags::USED;
        assert!(flags.contains(MetaFlags::UNALLOC));
        assert!(!flags.contains(MetaFlags::ALLOC));
        assert_eq!(flags.bits(), 6);
        assert_eq!(MetaFlags::from_bits(6), flags);
    }
}
