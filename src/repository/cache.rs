//! Per-case caches.
//!
//! All caches live for the session and are never pruned, except that a
//! rolled-back transaction removes the entries it added (see
//! [`CacheUndo`]). Object ids can be handed out again after a rollback, so
//! leaving those entries behind would resolve new ids to dead nodes.

use crate::db::Connection;
use crate::error::Result;
use crate::model::Content;
use dashmap::DashMap;
use parking_lot::RwLock;
use roaring::RoaringTreemap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use super::read::RawImageReader;

/// One cache insertion made inside a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheUndo {
    /// Hot-content entry for an object id.
    Hot(i64),
    /// File-system entry for an object id.
    FileSystem(i64),
    /// Data-source entry for an object id.
    DataSource(i64),
    /// `$CarvedFiles` memo for a carving root.
    CarvedDir(i64),
    /// Has-children mark for a parent.
    Children(i64),
    /// Registered artifact type id.
    ArtifactType(i64),
    /// Registered attribute type id.
    AttributeType(i64),
}

/// Caches owned by one open case.
#[derive(Default)]
pub struct ContentCaches {
    has_children: RwLock<ChildrenIndex>,
    hot: DashMap<i64, Content>,
    file_systems: DashMap<i64, i64>,
    data_sources: DashMap<i64, i64>,
    carved_dirs: DashMap<i64, i64>,
    image_readers: DashMap<i64, Arc<RawImageReader>>,
}

impl std::fmt::Debug for ContentCaches {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentCaches")
            .field("hot", &self.hot.len())
            .field("file_systems", &self.file_systems.len())
            .field("data_sources", &self.data_sources.len())
            .field("carved_dirs", &self.carved_dirs.len())
            .finish_non_exhaustive()
    }
}

/// Parents known to have at least one child.
///
/// Non-negative ids live in a compressed bitmap; anything else falls back
/// to a plain set.
#[derive(Debug, Default)]
struct ChildrenIndex {
    bitmap: RoaringTreemap,
    other: HashSet<i64>,
}

impl ChildrenIndex {
    fn insert(&mut self, id: i64) {
        match u64::try_from(id) {
            Ok(bit) => {
                self.bitmap.insert(bit);
            }
            Err(_) => {
                self.other.insert(id);
            }
        }
    }

    fn remove(&mut self, id: i64) {
        match u64::try_from(id) {
            Ok(bit) => {
                self.bitmap.remove(bit);
            }
            Err(_) => {
                self.other.remove(&id);
            }
        }
    }

    fn contains(&self, id: i64) -> bool {
        u64::try_from(id).map_or_else(|_| self.other.contains(&id), |bit| self.bitmap.contains(bit))
    }

    fn len(&self) -> u64 {
        self.bitmap.len() + self.other.len() as u64
    }
}

impl ContentCaches {
    /// Replaces the has-children index with one full scan of `objects`.
    pub fn rebuild_children(&self, conn: &Connection) -> Result<()> {
        let mut index = ChildrenIndex::default();
        for row in conn.query(
            "SELECT DISTINCT par_obj_id FROM objects WHERE par_obj_id IS NOT NULL",
            &[],
        )? {
            index.insert(row.get(0)?);
        }
        debug!(parents = index.len(), "rebuilt has-children index");
        *self.has_children.write() = index;
        Ok(())
    }

    /// Records that `parent` has a child; returns true when the mark is new.
    pub fn mark_has_children(&self, parent: i64) -> bool {
        if self.has_children.read().contains(parent) {
            return false;
        }
        let mut index = self.has_children.write();
        if index.contains(parent) {
            return false;
        }
        index.insert(parent);
        true
    }

    /// Consults the has-children index.
    pub fn has_children(&self, parent: i64) -> bool {
        self.has_children.read().contains(parent)
    }

    /// Cached hot node.
    pub fn hot(&self, id: i64) -> Option<Content> {
        self.hot.get(&id).map(|entry| entry.value().clone())
    }

    /// Caches a hot node; returns true when the entry is new.
    pub fn insert_hot(&self, content: Content) -> bool {
        self.hot.insert(content.id(), content).is_none()
    }

    /// Applies `update` to a cached node, if present. Returns true when a
    /// cached entry was changed.
    pub fn update_hot(&self, id: i64, update: impl FnOnce(&mut Content)) -> bool {
        self.hot.get_mut(&id).is_some_and(|mut entry| {
            update(entry.value_mut());
            true
        })
    }

    /// Cached containing file system of an object.
    pub fn file_system(&self, id: i64) -> Option<i64> {
        self.file_systems.get(&id).map(|entry| *entry.value())
    }

    /// Caches the file system of an object; returns true when new.
    pub fn insert_file_system(&self, id: i64, fs_id: i64) -> bool {
        self.file_systems.insert(id, fs_id).is_none()
    }

    /// Cached data source of an object.
    pub fn data_source(&self, id: i64) -> Option<i64> {
        self.data_sources.get(&id).map(|entry| *entry.value())
    }

    /// Caches the data source of an object; returns true when new.
    pub fn insert_data_source(&self, id: i64, data_source_id: i64) -> bool {
        self.data_sources.insert(id, data_source_id).is_none()
    }

    /// Memoized `$CarvedFiles` directory under a carving root.
    pub fn carved_dir(&self, root: i64) -> Option<i64> {
        self.carved_dirs.get(&root).map(|entry| *entry.value())
    }

    /// Memoizes a `$CarvedFiles` directory; returns true when new.
    pub fn insert_carved_dir(&self, root: i64, dir: i64) -> bool {
        self.carved_dirs.insert(root, dir).is_none()
    }

    pub(crate) fn image_reader(&self, image_id: i64) -> Option<Arc<RawImageReader>> {
        self.image_readers.get(&image_id).map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn insert_image_reader(&self, image_id: i64, reader: Arc<RawImageReader>) {
        self.image_readers.insert(image_id, reader);
    }

    /// Reverts one cache insertion. Type registrations are reverted by the
    /// type registry.
    pub fn undo(&self, entry: CacheUndo) {
        match entry {
            CacheUndo::Hot(id) => {
                self.hot.remove(&id);
            }
            CacheUndo::FileSystem(id) => {
                self.file_systems.remove(&id);
            }
            CacheUndo::DataSource(id) => {
                self.data_sources.remove(&id);
            }
            CacheUndo::CarvedDir(root) => {
                self.carved_dirs.remove(&root);
            }
            CacheUndo::Children(parent) => {
                self.has_children.write().remove(parent);
            }
            CacheUndo::ArtifactType(_) | CacheUndo::AttributeType(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::VolumeSystem;
    use proptest::prelude::*;

    fn vs(id: i64) -> Content {
        Content::VolumeSystem(VolumeSystem {
            object_id: id,
            parent_id: 1,
            vs_type: 1,
            img_offset: 0,
            block_size: 512,
        })
    }

    #[test]
    fn test_hot_insert_and_undo() {
        let caches = ContentCaches::default();
        assert!(caches.insert_hot(vs(2)));
        assert!(!caches.insert_hot(vs(2)));
        assert!(caches.hot(2).is_some());
        caches.undo(CacheUndo::Hot(2));
        assert!(caches.hot(2).is_none());
    }

    #[test]
    fn test_carved_memo_undo() {
        let caches = ContentCaches::default();
        assert!(caches.insert_carved_dir(3, 10));
        assert_eq!(caches.carved_dir(3), Some(10));
        caches.undo(CacheUndo::CarvedDir(3));
        assert_eq!(caches.carved_dir(3), None);
    }

    #[test]
    fn test_negative_ids_tracked() {
        let caches = ContentCaches::default();
        assert!(caches.mark_has_children(-5));
        assert!(!caches.mark_has_children(-5));
        assert!(caches.has_children(-5));
        assert!(!caches.has_children(5));
        caches.undo(CacheUndo::Children(-5));
        assert!(!caches.has_children(-5));
    }

    proptest! {
        #[test]
        fn prop_marked_parents_have_children(ids in proptest::collection::vec(any::<i64>(), 0..64)) {
            let caches = ContentCaches::default();
            for id in &ids {
                let _ = caches.mark_has_children(*id);
            }
            for id in &ids {
                prop_assert!(caches.has_children(*id));
            }
        }
    }
}
