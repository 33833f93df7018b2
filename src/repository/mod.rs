//! Object/content repository.
//!
//! Every node of a case is an object: an identity row in `objects` plus a
//! row in the type table its `type` names. Reads are methods on
//! [`CaseDbConnection`](crate::db::CaseDbConnection); inserts and updates
//! are methods on [`CaseDbTransaction`](crate::db::CaseDbTransaction).

pub(crate) mod cache;
pub mod files;
pub mod ingest;
pub(crate) mod loaders;
pub mod objects;
pub mod read;

pub use files::{NewFile, NewLayoutFile, NewLocalFile, NewReport};
pub use ingest::{ImageProcessor, NewFileSystem, NewImage, NewVolume, NewVolumeSystem};
pub use read::{ImageReader, RawImageReader};
