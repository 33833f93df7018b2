//! Attribute values and provenance merging.

use crate::db::{CaseDbConnection, CaseDbTransaction, Row, SqlValue};
use crate::error::{Error, Result};
use crate::model::ValueKind;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// A typed attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AttributeValue {
    /// UTF-8 text.
    String(String),
    /// 32-bit integer.
    Integer(i32),
    /// 64-bit integer.
    Long(i64),
    /// Double-precision float.
    Double(f64),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Seconds since the epoch.
    DateTime(i64),
    /// JSON document, stored as text.
    Json(String),
}

impl AttributeValue {
    /// Kind of this value.
    pub const fn kind(&self) -> ValueKind {
        match self {
            Self::String(_) => ValueKind::String,
            Self::Integer(_) => ValueKind::Integer,
            Self::Long(_) => ValueKind::Long,
            Self::Double(_) => ValueKind::Double,
            Self::Bytes(_) => ValueKind::Bytes,
            Self::DateTime(_) => ValueKind::DateTime,
            Self::Json(_) => ValueKind::Json,
        }
    }

    /// Column the value is stored in.
    const fn column(&self) -> &'static str {
        match self {
            Self::String(_) | Self::Json(_) => "value_text",
            Self::Integer(_) => "value_int32",
            Self::Long(_) | Self::DateTime(_) => "value_int64",
            Self::Double(_) => "value_double",
            Self::Bytes(_) => "value_byte",
        }
    }

    fn to_sql(&self) -> SqlValue {
        match self {
            Self::String(v) | Self::Json(v) => SqlValue::from(v),
            Self::Integer(v) => SqlValue::from(*v),
            Self::Long(v) | Self::DateTime(v) => SqlValue::from(*v),
            Self::Double(v) => SqlValue::from(*v),
            Self::Bytes(v) => SqlValue::from(v.as_slice()),
        }
    }
}

/// An attribute row: one value plus the sources that reported it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    /// Owning artifact.
    pub artifact_id: i64,
    /// Attribute type.
    pub attribute_type_id: i64,
    /// Value.
    pub value: AttributeValue,
    /// Reporting modules, without duplicates, in first-seen order.
    pub sources: Vec<String>,
    /// Free-form context.
    pub context: String,
}

/// Splits a stored provenance list.
pub fn parse_sources(stored: &str) -> Vec<String> {
    let mut sources: Vec<String> = Vec::new();
    for source in stored.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if !sources.iter().any(|s| s == source) {
            sources.push(source.to_string());
        }
    }
    sources
}

/// Adds `source` to a stored provenance list. `None` when already present.
pub fn merge_source(stored: &str, source: &str) -> Option<String> {
    let mut sources = parse_sources(stored);
    if sources.iter().any(|s| s == source) {
        return None;
    }
    sources.push(source.to_string());
    Some(sources.join(","))
}

const ATTRIBUTE_SELECT: &str = "SELECT artifact_id, attribute_type_id, value_type, value_byte, \
    value_text, value_int32, value_int64, value_double, source, context FROM attributes";

fn attribute_from_row(row: &Row) -> Result<Attribute> {
    let kind = ValueKind::from_code(row.get(2)?)?;
    let value = match kind {
        ValueKind::String => AttributeValue::String(row.get::<Option<String>>(4)?.unwrap_or_default()),
        ValueKind::Json => AttributeValue::Json(row.get::<Option<String>>(4)?.unwrap_or_default()),
        ValueKind::Integer => AttributeValue::Integer(row.get(5)?),
        ValueKind::Long => AttributeValue::Long(row.get(6)?),
        ValueKind::DateTime => AttributeValue::DateTime(row.get(6)?),
        ValueKind::Double => AttributeValue::Double(row.get(7)?),
        ValueKind::Bytes => AttributeValue::Bytes(row.get::<Option<Vec<u8>>>(3)?.unwrap_or_default()),
    };
    Ok(Attribute {
        artifact_id: row.get(0)?,
        attribute_type_id: row.get(1)?,
        value,
        sources: parse_sources(&row.get::<Option<String>>(8)?.unwrap_or_default()),
        context: row.get::<Option<String>>(9)?.unwrap_or_default(),
    })
}

impl CaseDbConnection<'_> {
    /// Attributes of an artifact, grouped by attribute type. Embedded stores
    /// keep insertion order within a type; the server orders by value.
    pub fn get_attributes(&self, artifact_id: i64) -> Result<Vec<Attribute>> {
        let order = match self.backend() {
            crate::db::BackendKind::Embedded => "attribute_type_id, rowid",
            crate::db::BackendKind::Server => {
                "attribute_type_id, value_text, value_int32, value_int64, value_double, value_byte"
            }
        };
        self.connection()
            .query(
                &format!("{ATTRIBUTE_SELECT} WHERE artifact_id = ? ORDER BY {order}"),
                crate::values![artifact_id],
            )?
            .iter()
            .map(attribute_from_row)
            .collect()
    }
}

impl CaseDbTransaction<'_> {
    /// Adds an attribute, or records `source` on an identical existing one.
    ///
    /// Identity is (artifact, attribute type, value). Surrounding whitespace
    /// in `source` is dropped. Doubles must be finite.
    pub fn add_attribute(
        &self,
        artifact_id: i64,
        attribute_type_id: i64,
        value: AttributeValue,
        source: &str,
    ) -> Result<Attribute> {
        let source = source.trim();
        if source.contains(',') {
            return Err(Error::invalid_argument(format!(
                "attribute source must not contain a comma: {source}"
            )));
        }
        let ty = self.require_attribute_type(attribute_type_id)?;
        if ty.value_kind != value.kind() {
            return Err(Error::invalid_argument(format!(
                "attribute type {} holds {:?} values, got {:?}",
                ty.name,
                ty.value_kind,
                value.kind()
            )));
        }
        if let AttributeValue::Double(v) = &value
            && !v.is_finite()
        {
            return Err(Error::invalid_argument(format!(
                "attribute {} needs a finite value, got {v}",
                ty.name
            )));
        }
        if let AttributeValue::Json(text) = &value {
            serde_json::from_str::<serde_json::Value>(text).map_err(|e| {
                Error::invalid_argument(format!("attribute {} is not valid JSON: {e}", ty.name))
            })?;
        }
        let artifact = self.get_artifact(artifact_id)?;
        let conn = self.connection();
        let column = value.column();

        let existing = conn.query_opt(
            &format!(
                "SELECT source, context FROM attributes \
                 WHERE artifact_id = ? AND attribute_type_id = ? AND {column} = ?"
            ),
            &[
                SqlValue::from(artifact_id),
                SqlValue::from(attribute_type_id),
                value.to_sql(),
            ],
        )?;

        if let Some(row) = existing {
            let stored = row.get::<Option<String>>(0)?.unwrap_or_default();
            let context = row.get::<Option<String>>(1)?.unwrap_or_default();
            let merged = match merge_source(&stored, source) {
                Some(merged) => {
                    conn.execute(
                        &format!(
                            "UPDATE attributes SET source = ? \
                             WHERE artifact_id = ? AND attribute_type_id = ? AND {column} = ?"
                        ),
                        &[
                            SqlValue::from(&merged),
                            SqlValue::from(artifact_id),
                            SqlValue::from(attribute_type_id),
                            value.to_sql(),
                        ],
                    )?;
                    trace!(artifact_id, attribute_type_id, source, "merged attribute source");
                    merged
                }
                None => stored,
            };
            return Ok(Attribute {
                artifact_id,
                attribute_type_id,
                value,
                sources: parse_sources(&merged),
                context,
            });
        }

        conn.execute(
            &format!(
                "INSERT INTO attributes (artifact_id, artifact_type_id, source, context, \
                 attribute_type_id, value_type, {column}) VALUES (?, ?, ?, ?, ?, ?, ?)"
            ),
            &[
                SqlValue::from(artifact_id),
                SqlValue::from(artifact.artifact_type_id),
                SqlValue::from(source),
                SqlValue::from(""),
                SqlValue::from(attribute_type_id),
                SqlValue::from(value.kind().code()),
                value.to_sql(),
            ],
        )?;
        Ok(Attribute {
            artifact_id,
            attribute_type_id,
            value,
            sources: parse_sources(source),
            context: String::new(),
        })
    }
}
