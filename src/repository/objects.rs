//! Object forest reads and identity inserts.

use super::cache::CacheUndo;
use super::loaders::{self, FILE_SELECT, OBJECT_SELECT};
use crate::db::{CaseDbConnection, CaseDbTransaction, SqlValue};
use crate::error::{Error, Result};
use crate::model::{AbstractFile, ByteRange, Content, Image, MetaType, ObjectRecord, ObjectType};
use std::collections::HashSet;
use tracing::trace;

impl CaseDbConnection<'_> {
    /// Identity row of an object.
    pub fn get_object(&self, id: i64) -> Result<Option<ObjectRecord>> {
        loaders::load_object(self.connection(), id)
    }

    /// Resolves an object id to its node.
    pub fn get_by_id(&self, id: i64) -> Result<Option<Content>> {
        if let Some(hot) = self.case().caches.hot(id) {
            return Ok(Some(hot));
        }
        match self.get_object(id)? {
            Some(record) => self.load(record),
            None => Ok(None),
        }
    }

    /// Like [`get_by_id`](Self::get_by_id), for ids that must exist.
    pub fn get_content(&self, id: i64) -> Result<Content> {
        self.get_by_id(id)?.ok_or(Error::NotFound {
            entity: "object",
            id,
        })
    }

    pub(crate) fn load(&self, record: ObjectRecord) -> Result<Option<Content>> {
        if let Some(hot) = self.case().caches.hot(record.object_id) {
            return Ok(Some(hot));
        }
        let content = loaders::load_content(self.connection(), record)?;
        if let Some(content) = &content {
            self.remember(content);
        }
        Ok(content)
    }

    /// Caches what a loaded node tells us about itself.
    pub(crate) fn remember(&self, content: &Content) {
        self.cache_hot(content);
        match content {
            Content::Image(image) => self.cache_data_source(image.object_id, image.object_id),
            Content::FileSystem(fs) => {
                self.cache_data_source(fs.object_id, fs.data_source_id);
                self.cache_file_system(fs.object_id, fs.object_id);
            }
            Content::Artifact(artifact) => {
                self.cache_data_source(artifact.object_id, artifact.data_source_object_id);
            }
            other => {
                if let Some(file) = other.as_file() {
                    self.cache_data_source(file.object_id, file.data_source_id);
                    if let Some(fs_id) = file.fs_object_id {
                        self.cache_file_system(file.object_id, fs_id);
                    }
                }
            }
        }
    }

    /// Children of `parent`, ordered by object id.
    pub fn get_children(&self, parent: i64) -> Result<Vec<Content>> {
        if !self.has_children(parent) {
            return Ok(Vec::new());
        }
        let rows = self.connection().query(
            &format!("{OBJECT_SELECT} WHERE par_obj_id = ? ORDER BY obj_id"),
            crate::values![parent],
        )?;
        let mut children = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(child) = self.load(loaders::object_from_row(row)?)? {
                children.push(child);
            }
        }
        Ok(children)
    }

    /// Child ids of `parent`, ordered.
    pub fn get_child_ids(&self, parent: i64) -> Result<Vec<i64>> {
        if !self.has_children(parent) {
            return Ok(Vec::new());
        }
        self.connection()
            .query(
                "SELECT obj_id FROM objects WHERE par_obj_id = ? ORDER BY obj_id",
                crate::values![parent],
            )?
            .iter()
            .map(|row| row.get(0))
            .collect()
    }

    /// Answers from the has-children index without touching the store.
    pub fn has_children(&self, parent: i64) -> bool {
        self.case().caches.has_children(parent)
    }

    /// Parent node of `id`; `None` for data sources and unknown ids.
    pub fn get_parent(&self, id: i64) -> Result<Option<Content>> {
        let parent = match self.case().caches.hot(id) {
            Some(hot) => hot.parent_id(),
            None => self.get_object(id)?.and_then(|record| record.parent_id),
        };
        match parent {
            Some(parent) => self.get_by_id(parent),
            None => Ok(None),
        }
    }

    /// Data source (root ancestor) of `id`.
    pub fn get_data_source_id(&self, id: i64) -> Result<i64> {
        let caches = &self.case().caches;
        if let Some(ds) = caches.data_source(id) {
            return Ok(ds);
        }
        let mut walked = Vec::new();
        let mut seen = HashSet::new();
        let mut current = id;
        let root = loop {
            if let Some(ds) = caches.data_source(current) {
                break ds;
            }
            if !seen.insert(current) {
                return Err(Error::InvalidState {
                    message: format!("object {id} has a cyclic ancestry"),
                });
            }
            let record = self.get_object(current)?.ok_or(Error::NotFound {
                entity: "object",
                id: current,
            })?;
            walked.push(current);
            match record.parent_id {
                Some(parent) => current = parent,
                None => break current,
            }
        };
        trace!(id, data_source = root, depth = walked.len(), "resolved data source");
        for node in walked {
            self.cache_data_source(node, root);
        }
        Ok(root)
    }

    /// Every data source, ordered by object id.
    pub fn get_data_sources(&self) -> Result<Vec<Content>> {
        let rows = self.connection().query(
            &format!("{OBJECT_SELECT} WHERE par_obj_id IS NULL ORDER BY obj_id"),
            &[],
        )?;
        let mut sources = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(content) = self.load(loaders::object_from_row(row)?)? {
                if content.is_data_source() {
                    sources.push(content);
                }
            }
        }
        Ok(sources)
    }

    /// Image data source; fails if `id` is not an image.
    pub fn get_image(&self, id: i64) -> Result<Image> {
        match self.get_by_id(id)? {
            Some(Content::Image(image)) => Ok(image),
            _ => Err(Error::NotFound {
                entity: "image",
                id,
            }),
        }
    }

    /// File columns of a file-like node.
    pub fn get_file(&self, id: i64) -> Result<Option<AbstractFile>> {
        if let Some(hot) = self.case().caches.hot(id) {
            return Ok(hot.as_file().cloned());
        }
        loaders::load_file(self.connection(), id)
    }

    /// Ordered byte ranges of a layout file; empty for other files.
    pub fn get_file_ranges(&self, id: i64) -> Result<Vec<ByteRange>> {
        self.connection()
            .query(
                "SELECT byte_start, byte_len FROM file_layout WHERE obj_id = ? ORDER BY sequence",
                crate::values![id],
            )?
            .iter()
            .map(|row| Ok(ByteRange::new(row.get(0)?, row.get(1)?)))
            .collect()
    }

    /// Files of a data source whose name matches a `LIKE` pattern,
    /// ignoring case.
    pub fn find_files_by_name(&self, data_source_id: i64, pattern: &str) -> Result<Vec<AbstractFile>> {
        self.connection()
            .query(
                &format!(
                    "{FILE_SELECT} WHERE f.data_source_id = ? AND LOWER(f.name) LIKE LOWER(?) \
                     ORDER BY f.obj_id"
                ),
                crate::values![data_source_id, pattern],
            )?
            .iter()
            .map(loaders::file_from_row)
            .collect()
    }

    /// Root directory of a file system.
    pub fn get_root_directory(&self, fs_id: i64) -> Result<Option<AbstractFile>> {
        let id: Option<i64> = self.connection().query_value(
            "SELECT f.obj_id FROM files f JOIN objects o ON o.obj_id = f.obj_id \
             WHERE o.par_obj_id = ? AND f.fs_obj_id = ? AND f.meta_type = ? \
             ORDER BY f.obj_id LIMIT 1",
            crate::values![fs_id, fs_id, MetaType::Dir.code()],
        )?;
        match id {
            Some(id) => Ok(self.get_by_id(id)?.and_then(|c| c.as_file().cloned())),
            None => Ok(None),
        }
    }
}

impl CaseDbTransaction<'_> {
    /// Inserts an identity row and returns the new object id.
    pub fn add_object(&self, parent: Option<i64>, object_type: ObjectType) -> Result<i64> {
        if let Some(parent) = parent {
            if self.get_object(parent)?.is_none() {
                return Err(Error::NotFound {
                    entity: "object",
                    id: parent,
                });
            }
        }
        let id = self.connection().insert_returning_id(
            "INSERT INTO objects (par_obj_id, type) VALUES (?, ?)",
            &[SqlValue::from(parent), SqlValue::from(object_type.code())],
            "obj_id",
        )?;
        if let Some(parent) = parent {
            if self.case().caches.mark_has_children(parent) {
                self.record(CacheUndo::Children(parent));
            }
        }
        trace!(id, ?parent, ?object_type, "added object");
        Ok(id)
    }
}
