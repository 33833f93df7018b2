//! # casedb
//!
//! Versioned case database engine for disk-image forensics.
//!
//! A case records what was found in a set of evidence sources: disk images
//! and their volumes, file systems and files, plus local and derived files,
//! carved files and analysis results ("artifacts" with typed attributes).
//!
//! ## Features
//!
//! - **Two backends**: an embedded `SQLite` file, or a shared `PostgreSQL`
//!   database (cargo feature `postgres`)
//! - **Schema migrations**: older stores are backed up and upgraded at open
//! - **Units of work**: read connections and write transactions that keep the
//!   session caches consistent with what was committed
//! - **Blackboard**: artifact and attribute type registries, provenance
//!   merging for repeated attribute values
//! - **Carving**: layout files grouped under one `$CarvedFiles` directory per
//!   file system, volume or image
//!
//! ```no_run
//! use casedb::{CaseDb, CaseDbConfig, NewLocalFile};
//!
//! let case = CaseDb::open(&CaseDbConfig::embedded("case.db")).unwrap();
//! let hits = case.artifact_type_by_name("TSK_KEYWORD_HIT").unwrap();
//! case.write(|tx| {
//!     let source = tx.add_local_files_data_source("exports", None, "UTC")?;
//!     let file = tx.add_local_file(
//!         source.object_id,
//!         NewLocalFile::new("notes.txt", "/evidence/notes.txt", 12),
//!     )?;
//!     tx.new_artifact(hits.type_id, file.object_id)
//! })
//! .unwrap();
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
// Note: unsafe is needed for memory-mapped image reads (memmap2)
#![warn(unsafe_code)]

pub mod blackboard;
pub mod carving;
pub mod case;
pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod repository;
pub mod schema;

// Re-export commonly used types at crate root
pub use error::{Error, Result, StorageError};

// Re-export the case and its configuration
pub use case::CaseDb;
pub use config::{BackendConfig, CaseDbConfig, PoolConfig, RetryConfig, ServerConfig};

// Re-export units of work
pub use db::{BackendKind, CaseDbConnection, CaseDbTransaction};

// Re-export domain types
pub use model::{
    AbstractFile, Artifact, ArtifactCategory, ByteRange, Content, FileDbType, ObjectRecord, ObjectType,
    ReviewStatus, ValueKind,
};

// Re-export repository inputs
pub use repository::{
    ImageProcessor, ImageReader, NewFile, NewFileSystem, NewImage, NewLayoutFile, NewLocalFile,
    NewReport, NewVolume, NewVolumeSystem, RawImageReader,
};

// Re-export blackboard types
pub use blackboard::{ArtifactFilter, ArtifactType, Attribute, AttributeType, AttributeValue};

// Re-export carving types
pub use carving::{CARVED_FILES_DIR, CarvedFile};

// Re-export schema versioning
pub use schema::{MigrationReport, SchemaVersion};
