//! Blackboard: typed artifacts and attributes attached to content.
//!
//! Artifacts have their own id space, allocated by [`ArtifactIdSource`],
//! and also own an object id so they take part in the object forest like
//! any other node. Attributes hang off artifacts and merge provenance when
//! the same value is reported twice.

pub mod attribute;
pub mod types;

pub use attribute::{Attribute, AttributeValue, merge_source, parse_sources};
pub use types::{
    ArtifactType, AttributeType, BUILTIN_ARTIFACT_TYPES, BUILTIN_ATTRIBUTE_TYPES,
    FIRST_USER_TYPE_ID, TypeRegistry,
};

use crate::db::{BackendKind, CaseDbConnection, CaseDbTransaction, Connection, SqlValue};
use crate::error::{Error, Result};
use crate::model::{Artifact, ObjectType, ReviewStatus};
use crate::repository::loaders::{ARTIFACT_SELECT, artifact_from_row};
use crate::schema::create::ARTIFACT_ID_SEQUENCE;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{debug, trace};

/// Where artifact ids come from.
#[derive(Debug)]
pub enum ArtifactIdSource {
    /// Process-local counter; valid because the embedded case is held
    /// exclusively by this process.
    Counter(AtomicI64),
    /// The server-side sequence.
    Sequence,
}

impl ArtifactIdSource {
    /// Seeds the source for an open case.
    pub fn for_connection(conn: &Connection) -> Result<Self> {
        let max: Option<i64> = conn
            .query_opt("SELECT MAX(artifact_id) FROM artifacts", &[])?
            .map(|row| row.get::<Option<i64>>(0))
            .transpose()?
            .flatten();
        match conn.backend() {
            BackendKind::Embedded => {
                let next = match max {
                    Some(max) => max.checked_add(1).ok_or_else(exhausted)?,
                    None => i64::MIN,
                };
                debug!(next, "seeded artifact id counter");
                Ok(Self::Counter(AtomicI64::new(next)))
            }
            BackendKind::Server => {
                crate::schema::create::create_artifact_sequence(conn)?;
                if let Some(max) = max {
                    conn.query(
                        &format!(
                            "SELECT setval('{ARTIFACT_ID_SEQUENCE}', ?) \
                             WHERE ? >= (SELECT last_value FROM {ARTIFACT_ID_SEQUENCE})"
                        ),
                        crate::values![max, max],
                    )?;
                }
                Ok(Self::Sequence)
            }
        }
    }

    /// Allocates the next id.
    pub fn next(&self, conn: &Connection) -> Result<i64> {
        match self {
            Self::Counter(counter) => counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |id| id.checked_add(1))
                .map_err(|_| exhausted()),
            Self::Sequence => conn
                .query_value(&format!("SELECT nextval('{ARTIFACT_ID_SEQUENCE}')"), &[])?
                .ok_or_else(exhausted),
        }
    }
}

fn exhausted() -> Error {
    Error::InvalidState {
        message: "artifact id space exhausted".to_string(),
    }
}

/// Artifact query filter. Rejected artifacts are excluded unless
/// `include_rejected` is set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactFilter {
    /// Only this artifact type.
    pub artifact_type_id: Option<i64>,
    /// Only artifacts found in this object.
    pub source_object_id: Option<i64>,
    /// Only artifacts of this data source.
    pub data_source_id: Option<i64>,
    /// Include dismissed artifacts.
    pub include_rejected: bool,
}

impl ArtifactFilter {
    /// Filter on one artifact type.
    pub fn of_type(artifact_type_id: i64) -> Self {
        Self {
            artifact_type_id: Some(artifact_type_id),
            ..Self::default()
        }
    }

    /// Filter on one source object.
    pub fn for_source(source_object_id: i64) -> Self {
        Self {
            source_object_id: Some(source_object_id),
            ..Self::default()
        }
    }

    fn to_sql(&self) -> (String, Vec<SqlValue>) {
        let mut clauses = Vec::new();
        let mut params = Vec::new();
        if let Some(ty) = self.artifact_type_id {
            clauses.push("artifact_type_id = ?");
            params.push(SqlValue::from(ty));
        }
        if let Some(source) = self.source_object_id {
            clauses.push("obj_id = ?");
            params.push(SqlValue::from(source));
        }
        if let Some(ds) = self.data_source_id {
            clauses.push("data_source_obj_id = ?");
            params.push(SqlValue::from(ds));
        }
        if !self.include_rejected {
            clauses.push("review_status_id <> ?");
            params.push(SqlValue::from(ReviewStatus::Rejected.code()));
        }
        let mut sql = ARTIFACT_SELECT.to_string();
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY artifact_id");
        (sql, params)
    }
}

impl CaseDbConnection<'_> {
    /// Artifact by id; fails if missing.
    pub fn get_artifact(&self, artifact_id: i64) -> Result<Artifact> {
        self.connection()
            .query_opt(
                &format!("{ARTIFACT_SELECT} WHERE artifact_id = ?"),
                crate::values![artifact_id],
            )?
            .as_ref()
            .map(artifact_from_row)
            .transpose()?
            .ok_or(Error::NotFound {
                entity: "artifact",
                id: artifact_id,
            })
    }

    /// Artifact owning object id `object_id`, if any.
    pub fn get_artifact_by_object_id(&self, object_id: i64) -> Result<Option<Artifact>> {
        self.connection()
            .query_opt(
                &format!("{ARTIFACT_SELECT} WHERE artifact_obj_id = ?"),
                crate::values![object_id],
            )?
            .as_ref()
            .map(artifact_from_row)
            .transpose()
    }

    /// Artifacts matching `filter`, ordered by artifact id.
    pub fn get_artifacts(&self, filter: &ArtifactFilter) -> Result<Vec<Artifact>> {
        let (sql, params) = filter.to_sql();
        self.connection()
            .query(&sql, &params)?
            .iter()
            .map(artifact_from_row)
            .collect()
    }

    /// Non-rejected artifacts of one type.
    pub fn get_artifacts_by_type(&self, artifact_type_id: i64) -> Result<Vec<Artifact>> {
        self.get_artifacts(&ArtifactFilter::of_type(artifact_type_id))
    }

    /// Non-rejected artifacts found in one object.
    pub fn get_artifacts_for_source(&self, source_object_id: i64) -> Result<Vec<Artifact>> {
        self.get_artifacts(&ArtifactFilter::for_source(source_object_id))
    }

    /// Registry entry for an artifact type, refreshed from the store when
    /// another client registered it.
    pub(crate) fn require_artifact_type(&self, type_id: i64) -> Result<ArtifactType> {
        let types = &self.case().types;
        if let Some(ty) = types.artifact_type(type_id) {
            return Ok(ty);
        }
        if self.backend() == BackendKind::Server {
            let reloaded = TypeRegistry::load(self.connection())?;
            if let Some(ty) = reloaded.artifact_type(type_id) {
                types.insert_artifact_type(ty.clone());
                return Ok(ty);
            }
        }
        Err(Error::NotFound {
            entity: "artifact type",
            id: type_id,
        })
    }

    pub(crate) fn require_attribute_type(&self, type_id: i64) -> Result<AttributeType> {
        let types = &self.case().types;
        if let Some(ty) = types.attribute_type(type_id) {
            return Ok(ty);
        }
        if self.backend() == BackendKind::Server {
            let reloaded = TypeRegistry::load(self.connection())?;
            if let Some(ty) = reloaded.attribute_type(type_id) {
                types.insert_attribute_type(ty.clone());
                return Ok(ty);
            }
        }
        Err(Error::NotFound {
            entity: "attribute type",
            id: type_id,
        })
    }
}

impl CaseDbTransaction<'_> {
    /// Creates an artifact of `artifact_type_id` about `source_object_id`.
    pub fn new_artifact(&self, artifact_type_id: i64, source_object_id: i64) -> Result<Artifact> {
        self.require_artifact_type(artifact_type_id)?;
        let data_source_object_id = self.get_data_source_id(source_object_id)?;
        let object_id = self.add_object(Some(source_object_id), ObjectType::Artifact)?;
        let artifact_id = self.case().artifact_ids.next(self.connection())?;
        self.connection().execute(
            "INSERT INTO artifacts (artifact_id, obj_id, artifact_obj_id, data_source_obj_id, \
             artifact_type_id, review_status_id) VALUES (?, ?, ?, ?, ?, ?)",
            &[
                SqlValue::from(artifact_id),
                SqlValue::from(source_object_id),
                SqlValue::from(object_id),
                SqlValue::from(data_source_object_id),
                SqlValue::from(artifact_type_id),
                SqlValue::from(ReviewStatus::Undecided.code()),
            ],
        )?;
        self.cache_data_source(object_id, data_source_object_id);
        trace!(artifact_id, object_id, artifact_type_id, "created artifact");
        Ok(Artifact {
            artifact_id,
            object_id,
            source_object_id,
            data_source_object_id,
            artifact_type_id,
            review_status: ReviewStatus::Undecided,
        })
    }

    /// Records an examiner's review decision.
    pub fn set_review_status(&self, artifact_id: i64, status: ReviewStatus) -> Result<()> {
        let changed = self.connection().execute(
            "UPDATE artifacts SET review_status_id = ? WHERE artifact_id = ?",
            crate::values![status.code(), artifact_id],
        )?;
        if changed == 0 {
            return Err(Error::NotFound {
                entity: "artifact",
                id: artifact_id,
            });
        }
        Ok(())
    }
}
