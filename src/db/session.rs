//! Units of work.
//!
//! A [`CaseDbConnection`] is a read unit: it holds the shared side of the
//! store lock and one pooled connection. A [`CaseDbTransaction`] holds the
//! exclusive side for its whole duration and rolls back on drop unless
//! committed.
//!
//! Acquisition order is always nested-unit marker, then lock, then
//! connection; fields drop in the reverse order.

use super::lock::{UnitGuard, UnitMarker};
use super::pool::PooledConnection;
use super::{BackendKind, Connection};
use crate::case::CaseDb;
use crate::error::Result;
use crate::model::Content;
use crate::repository::cache::CacheUndo;
use std::cell::RefCell;
use std::ops::Deref;
use tracing::{debug, warn};

/// A read unit of work on an open case.
pub struct CaseDbConnection<'a> {
    conn: PooledConnection<'a>,
    _guard: UnitGuard<'a>,
    _marker: UnitMarker,
    case: &'a CaseDb,
    writable: bool,
    undo: RefCell<Vec<CacheUndo>>,
}

impl std::fmt::Debug for CaseDbConnection<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaseDbConnection")
            .field("backend", &self.conn.backend())
            .field("writable", &self.writable)
            .field("pending_undo", &self.undo.borrow().len())
            .finish_non_exhaustive()
    }
}

impl<'a> CaseDbConnection<'a> {
    pub(crate) fn new(
        case: &'a CaseDb,
        conn: PooledConnection<'a>,
        guard: UnitGuard<'a>,
        marker: UnitMarker,
        writable: bool,
    ) -> Self {
        Self {
            conn,
            _guard: guard,
            _marker: marker,
            case,
            writable,
            undo: RefCell::new(Vec::new()),
        }
    }

    /// Raw connection, for statements the typed API does not cover.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Backend of the open case.
    pub fn backend(&self) -> BackendKind {
        self.conn.backend()
    }

    pub(crate) const fn is_writable(&self) -> bool {
        self.writable
    }

    pub(crate) const fn case(&self) -> &'a CaseDb {
        self.case
    }

    /// Records a cache insertion so a rollback can revert it.
    pub(crate) fn record(&self, entry: CacheUndo) {
        if self.writable {
            self.undo.borrow_mut().push(entry);
        }
    }

    /// Caches `content` if it is a hot node.
    pub(crate) fn cache_hot(&self, content: &Content) {
        if content.is_hot() && self.case.caches.insert_hot(content.clone()) {
            self.record(CacheUndo::Hot(content.id()));
        }
    }

    pub(crate) fn cache_data_source(&self, id: i64, data_source_id: i64) {
        if self.case.caches.insert_data_source(id, data_source_id) {
            self.record(CacheUndo::DataSource(id));
        }
    }

    pub(crate) fn cache_file_system(&self, id: i64, fs_id: i64) {
        if self.case.caches.insert_file_system(id, fs_id) {
            self.record(CacheUndo::FileSystem(id));
        }
    }

    pub(crate) fn cache_carved_dir(&self, root: i64, dir: i64) {
        if self.case.caches.insert_carved_dir(root, dir) {
            self.record(CacheUndo::CarvedDir(root));
        }
    }

    fn revert_caches(&self) {
        let entries = std::mem::take(&mut *self.undo.borrow_mut());
        if entries.is_empty() {
            return;
        }
        debug!(entries = entries.len(), "reverting cache entries");
        for entry in entries.into_iter().rev() {
            match entry {
                CacheUndo::ArtifactType(id) => self.case.types.remove_artifact_type(id),
                CacheUndo::AttributeType(id) => self.case.types.remove_attribute_type(id),
                other => self.case.caches.undo(other),
            }
        }
    }
}

/// A write unit of work. Rolls back on drop unless [`commit`](Self::commit)
/// succeeded.
#[derive(Debug)]
pub struct CaseDbTransaction<'a> {
    unit: CaseDbConnection<'a>,
    finished: bool,
}

impl<'a> CaseDbTransaction<'a> {
    pub(crate) fn begin(unit: CaseDbConnection<'a>) -> Result<Self> {
        unit.conn.begin()?;
        Ok(Self {
            unit,
            finished: false,
        })
    }

    /// Commits every write made in this transaction.
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        match self.unit.conn.commit() {
            Ok(()) => {
                self.unit.undo.borrow_mut().clear();
                Ok(())
            }
            Err(err) => {
                if let Err(rollback_err) = self.unit.conn.rollback() {
                    warn!(error = %rollback_err, "rollback after failed commit also failed");
                }
                self.unit.revert_caches();
                Err(err)
            }
        }
    }

    /// Discards every write made in this transaction.
    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        self.unit.revert_caches();
        self.unit.conn.rollback()
    }
}

impl<'a> Deref for CaseDbTransaction<'a> {
    type Target = CaseDbConnection<'a>;

    fn deref(&self) -> &Self::Target {
        &self.unit
    }
}

impl Drop for CaseDbTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(err) = self.unit.conn.rollback() {
                warn!(error = %err, "rollback of abandoned transaction failed");
            }
            self.unit.revert_caches();
            debug!("abandoned transaction rolled back");
        }
    }
}
