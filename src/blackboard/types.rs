//! Artifact and attribute type registries.

use crate::db::{CaseDbTransaction, Connection, SqlValue};
use crate::error::{Error, Result};
use crate::model::{ArtifactCategory, ValueKind};
use crate::repository::cache::CacheUndo;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

/// Smallest id handed to a registered (non built-in) type.
pub const FIRST_USER_TYPE_ID: i64 = 10_000;

/// A registered artifact type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactType {
    /// Type id.
    pub type_id: i64,
    /// Unique name.
    pub name: String,
    /// Display name.
    pub display_name: String,
    /// Category.
    pub category: ArtifactCategory,
}

/// A registered attribute type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeType {
    /// Type id.
    pub type_id: i64,
    /// Unique name.
    pub name: String,
    /// Display name.
    pub display_name: String,
    /// Kind every value of this type must have.
    pub value_kind: ValueKind,
}

/// A built-in artifact type, seeded into every case.
#[derive(Debug, Clone, Copy)]
pub struct BuiltinArtifactType {
    /// Fixed id.
    pub id: i64,
    /// Unique name.
    pub name: &'static str,
    /// Display name.
    pub display_name: &'static str,
    /// Category.
    pub category: ArtifactCategory,
}

/// A built-in attribute type, seeded into every case.
#[derive(Debug, Clone, Copy)]
pub struct BuiltinAttributeType {
    /// Fixed id.
    pub id: i64,
    /// Unique name.
    pub name: &'static str,
    /// Display name.
    pub display_name: &'static str,
    /// Value kind.
    pub kind: ValueKind,
}

const fn data(id: i64, name: &'static str, display_name: &'static str) -> BuiltinArtifactType {
    BuiltinArtifactType {
        id,
        name,
        display_name,
        category: ArtifactCategory::DataArtifact,
    }
}

const fn analysis(id: i64, name: &'static str, display_name: &'static str) -> BuiltinArtifactType {
    BuiltinArtifactType {
        id,
        name,
        display_name,
        category: ArtifactCategory::AnalysisResult,
    }
}

const fn attr(
    id: i64,
    name: &'static str,
    display_name: &'static str,
    kind: ValueKind,
) -> BuiltinAttributeType {
    BuiltinAttributeType {
        id,
        name,
        display_name,
        kind,
    }
}

/// Built-in artifact types.
pub const BUILTIN_ARTIFACT_TYPES: &[BuiltinArtifactType] = &[
    data(1, "TSK_GEN_INFO", "General Info"),
    data(2, "TSK_WEB_BOOKMARK", "Web Bookmarks"),
    data(3, "TSK_WEB_COOKIE", "Web Cookies"),
    data(4, "TSK_WEB_HISTORY", "Web History"),
    data(5, "TSK_WEB_DOWNLOAD", "Web Downloads"),
    data(6, "TSK_RECENT_OBJECT", "Recent Documents"),
    data(7, "TSK_GPS_TRACKPOINT", "GPS Trackpoints"),
    data(8, "TSK_INSTALLED_PROG", "Installed Programs"),
    analysis(9, "TSK_KEYWORD_HIT", "Keyword Hits"),
    analysis(10, "TSK_HASHSET_HIT", "Hashset Hits"),
    data(11, "TSK_DEVICE_ATTACHED", "USB Device Attached"),
    analysis(12, "TSK_INTERESTING_FILE_HIT", "Interesting Files"),
    data(13, "TSK_EMAIL_MSG", "E-Mail Messages"),
    data(14, "TSK_EXTRACTED_TEXT", "Extracted Text"),
    data(15, "TSK_WEB_SEARCH_QUERY", "Web Search"),
    data(16, "TSK_METADATA_EXIF", "EXIF Metadata"),
    data(19, "TSK_OS_INFO", "Operating System Information"),
    data(20, "TSK_OS_ACCOUNT", "Operating System User Account"),
    data(21, "TSK_SERVICE_ACCOUNT", "Web Accounts"),
    data(22, "TSK_TOOL_OUTPUT", "Raw Tool Output"),
    data(23, "TSK_CONTACT", "Contacts"),
    data(24, "TSK_MESSAGE", "Messages"),
    data(25, "TSK_CALLLOG", "Call Logs"),
    analysis(33, "TSK_ENCRYPTION_DETECTED", "Encryption Detected"),
    analysis(34, "TSK_EXT_MISMATCH_DETECTED", "Extension Mismatch Detected"),
    analysis(35, "TSK_INTERESTING_ARTIFACT_HIT", "Interesting Results"),
];

/// Built-in attribute types.
pub const BUILTIN_ATTRIBUTE_TYPES: &[BuiltinAttributeType] = &[
    attr(1, "TSK_URL", "URL", ValueKind::String),
    attr(2, "TSK_DATETIME", "Date/Time", ValueKind::DateTime),
    attr(3, "TSK_NAME", "Name", ValueKind::String),
    attr(4, "TSK_PROG_NAME", "Program Name", ValueKind::String),
    attr(5, "TSK_LAST_ACCESSED", "Last Accessed", ValueKind::DateTime),
    attr(6, "TSK_VALUE", "Value", ValueKind::String),
    attr(7, "TSK_FLAG", "Flag", ValueKind::String),
    attr(8, "TSK_PATH", "Path", ValueKind::String),
    attr(10, "TSK_KEYWORD", "Keyword", ValueKind::String),
    attr(11, "TSK_KEYWORD_REGEXP", "Keyword Regular Expression", ValueKind::String),
    attr(12, "TSK_KEYWORD_PREVIEW", "Keyword Preview", ValueKind::String),
    attr(14, "TSK_USER_NAME", "User Name", ValueKind::String),
    attr(15, "TSK_DOMAIN", "Domain", ValueKind::String),
    attr(16, "TSK_PASSWORD", "Password", ValueKind::String),
    attr(17, "TSK_NAME_PERSON", "Person Name", ValueKind::String),
    attr(18, "TSK_DEVICE_MODEL", "Device Model", ValueKind::String),
    attr(19, "TSK_DEVICE_MAKE", "Device Make", ValueKind::String),
    attr(20, "TSK_DEVICE_ID", "Device ID", ValueKind::String),
    attr(21, "TSK_EMAIL", "Email", ValueKind::String),
    attr(22, "TSK_HASH_MD5", "MD5 Hash", ValueKind::String),
    attr(23, "TSK_HASH_SHA1", "SHA1 Hash", ValueKind::String),
    attr(24, "TSK_HASH_SHA2_256", "SHA2-256 Hash", ValueKind::String),
    attr(25, "TSK_HASH_SHA2_512", "SHA2-512 Hash", ValueKind::String),
    attr(26, "TSK_TEXT", "Text", ValueKind::String),
    attr(27, "TSK_TEXT_FILE", "Text File", ValueKind::String),
    attr(28, "TSK_TEXT_LANGUAGE", "Text Language", ValueKind::String),
    attr(29, "TSK_ENTROPY", "Entropy", ValueKind::Double),
    attr(30, "TSK_HASHSET_NAME", "Hashset Name", ValueKind::String),
    attr(31, "TSK_INTERESTING_FILE", "Interesting File", ValueKind::String),
    attr(32, "TSK_REFERRER", "Referrer URL", ValueKind::String),
    attr(33, "TSK_DATETIME_ACCESSED", "Date Accessed", ValueKind::DateTime),
    attr(34, "TSK_IP_ADDRESS", "IP Address", ValueKind::String),
    attr(35, "TSK_PHONE_NUMBER", "Phone Number", ValueKind::String),
    attr(36, "TSK_PATH_ID", "Path ID", ValueKind::Long),
    attr(37, "TSK_SET_NAME", "Set Name", ValueKind::String),
];

#[derive(Debug)]
struct TypeTable<T> {
    by_id: HashMap<i64, T>,
    by_name: HashMap<String, i64>,
}

impl<T> Default for TypeTable<T> {
    fn default() -> Self {
        Self {
            by_id: HashMap::new(),
            by_name: HashMap::new(),
        }
    }
}

impl<T: Clone> TypeTable<T> {
    fn insert(&mut self, id: i64, name: String, entry: T) {
        self.by_name.insert(name, id);
        self.by_id.insert(id, entry);
    }

    fn get(&self, id: i64) -> Option<T> {
        self.by_id.get(&id).cloned()
    }

    fn get_by_name(&self, name: &str) -> Option<T> {
        self.by_name.get(name).and_then(|id| self.get(*id))
    }

    fn remove(&mut self, id: i64) {
        if self.by_id.remove(&id).is_some() {
            self.by_name.retain(|_, v| *v != id);
        }
    }

    fn sorted(&self) -> Vec<(i64, T)> {
        let mut all: Vec<_> = self.by_id.iter().map(|(id, t)| (*id, t.clone())).collect();
        all.sort_by_key(|(id, _)| *id);
        all
    }
}

/// In-memory view of the two type tables, owned by one open case.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    artifacts: RwLock<TypeTable<ArtifactType>>,
    attributes: RwLock<TypeTable<AttributeType>>,
}

impl TypeRegistry {
    /// Loads both tables.
    pub fn load(conn: &Connection) -> Result<Self> {
        let registry = Self::default();
        {
            let mut artifacts = registry.artifacts.write();
            for row in conn.query(
                "SELECT artifact_type_id, type_name, display_name, category_type FROM artifact_types",
                &[],
            )? {
                let ty = ArtifactType {
                    type_id: row.get(0)?,
                    name: row.get(1)?,
                    display_name: row.get::<Option<String>>(2)?.unwrap_or_default(),
                    category: ArtifactCategory::from_code(row.get(3)?)?,
                };
                artifacts.insert(ty.type_id, ty.name.clone(), ty);
            }
        }
        {
            let mut attributes = registry.attributes.write();
            for row in conn.query(
                "SELECT attribute_type_id, type_name, display_name, value_type FROM attribute_types",
                &[],
            )? {
                let ty = AttributeType {
                    type_id: row.get(0)?,
                    name: row.get(1)?,
                    display_name: row.get::<Option<String>>(2)?.unwrap_or_default(),
                    value_kind: ValueKind::from_code(row.get(3)?)?,
                };
                attributes.insert(ty.type_id, ty.name.clone(), ty);
            }
        }
        debug!(
            artifact_types = registry.artifacts.read().by_id.len(),
            attribute_types = registry.attributes.read().by_id.len(),
            "loaded type registries"
        );
        Ok(registry)
    }

    /// Artifact type by id.
    pub fn artifact_type(&self, id: i64) -> Option<ArtifactType> {
        self.artifacts.read().get(id)
    }

    /// Artifact type by name.
    pub fn artifact_type_by_name(&self, name: &str) -> Option<ArtifactType> {
        self.artifacts.read().get_by_name(name)
    }

    /// Every artifact type, ordered by id.
    pub fn artifact_types(&self) -> Vec<ArtifactType> {
        self.artifacts.read().sorted().into_iter().map(|(_, t)| t).collect()
    }

    /// Attribute type by id.
    pub fn attribute_type(&self, id: i64) -> Option<AttributeType> {
        self.attributes.read().get(id)
    }

    /// Attribute type by name.
    pub fn attribute_type_by_name(&self, name: &str) -> Option<AttributeType> {
        self.attributes.read().get_by_name(name)
    }

    /// Every attribute type, ordered by id.
    pub fn attribute_types(&self) -> Vec<AttributeType> {
        self.attributes.read().sorted().into_iter().map(|(_, t)| t).collect()
    }

    pub(crate) fn insert_artifact_type(&self, ty: ArtifactType) {
        self.artifacts.write().insert(ty.type_id, ty.name.clone(), ty);
    }

    pub(crate) fn insert_attribute_type(&self, ty: AttributeType) {
        self.attributes.write().insert(ty.type_id, ty.name.clone(), ty);
    }

    pub(crate) fn remove_artifact_type(&self, id: i64) {
        self.artifacts.write().remove(id);
    }

    pub(crate) fn remove_attribute_type(&self, id: i64) {
        self.attributes.write().remove(id);
    }
}

/// Inserts built-in types that are missing. Does nothing when every
/// built-in is already present.
pub(crate) fn seed_builtin_types(conn: &Connection) -> Result<bool> {
    let artifact_count: i64 = conn
        .query_value(
            "SELECT COUNT(*) FROM artifact_types WHERE artifact_type_id < ?",
            crate::values![FIRST_USER_TYPE_ID],
        )?
        .unwrap_or(0);
    let attribute_count: i64 = conn
        .query_value(
            "SELECT COUNT(*) FROM attribute_types WHERE attribute_type_id < ?",
            crate::values![FIRST_USER_TYPE_ID],
        )?
        .unwrap_or(0);
    let complete = usize::try_from(artifact_count).is_ok_and(|n| n >= BUILTIN_ARTIFACT_TYPES.len())
        && usize::try_from(attribute_count).is_ok_and(|n| n >= BUILTIN_ATTRIBUTE_TYPES.len());
    if complete {
        return Ok(false);
    }

    for ty in BUILTIN_ARTIFACT_TYPES {
        conn.execute(
            "INSERT INTO artifact_types (artifact_type_id, type_name, display_name, category_type) \
             VALUES (?, ?, ?, ?) ON CONFLICT DO NOTHING",
            crate::values![ty.id, ty.name, ty.display_name, ty.category.code()],
        )?;
    }
    for ty in BUILTIN_ATTRIBUTE_TYPES {
        conn.execute(
            "INSERT INTO attribute_types (attribute_type_id, type_name, display_name, value_type) \
             VALUES (?, ?, ?, ?) ON CONFLICT DO NOTHING",
            crate::values![ty.id, ty.name, ty.display_name, ty.kind.code()],
        )?;
    }
    info!(
        artifact_types = BUILTIN_ARTIFACT_TYPES.len(),
        attribute_types = BUILTIN_ATTRIBUTE_TYPES.len(),
        "seeded built-in blackboard types"
    );
    Ok(true)
}

fn next_type_id(conn: &Connection, table: &str, column: &str) -> Result<i64> {
    let max: Option<i64> = conn
        .query_opt(&format!("SELECT MAX({column}) FROM {table}"), &[])?
        .map(|row| row.get::<Option<i64>>(0))
        .transpose()?
        .flatten();
    let next = match max {
        Some(max) => max.checked_add(1).ok_or_else(|| Error::InvalidState {
            message: format!("{table} id space exhausted"),
        })?,
        None => FIRST_USER_TYPE_ID,
    };
    Ok(next.max(FIRST_USER_TYPE_ID))
}

fn check_type_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::invalid_argument("type name must not be empty"));
    }
    Ok(())
}

impl CaseDbTransaction<'_> {
    /// Registers an artifact type, or returns the existing one with the
    /// same name.
    pub fn register_artifact_type(
        &self,
        name: &str,
        display_name: &str,
        category: ArtifactCategory,
    ) -> Result<ArtifactType> {
        check_type_name(name)?;
        let types = &self.case().types;
        if let Some(existing) = types.artifact_type_by_name(name) {
            return Ok(existing);
        }
        let conn = self.connection();
        if let Some(row) = conn.query_opt(
            "SELECT artifact_type_id, display_name, category_type FROM artifact_types WHERE type_name = ?",
            crate::values![name],
        )? {
            let ty = ArtifactType {
                type_id: row.get(0)?,
                name: name.to_string(),
                display_name: row.get::<Option<String>>(1)?.unwrap_or_default(),
                category: ArtifactCategory::from_code(row.get(2)?)?,
            };
            types.insert_artifact_type(ty.clone());
            return Ok(ty);
        }

        let type_id = next_type_id(conn, "artifact_types", "artifact_type_id")?;
        conn.execute(
            "INSERT INTO artifact_types (artifact_type_id, type_name, display_name, category_type) \
             VALUES (?, ?, ?, ?)",
            &[
                SqlValue::from(type_id),
                SqlValue::from(name),
                SqlValue::from(display_name),
                SqlValue::from(category.code()),
            ],
        )?;
        let ty = ArtifactType {
            type_id,
            name: name.to_string(),
            display_name: display_name.to_string(),
            category,
        };
        types.insert_artifact_type(ty.clone());
        self.record(CacheUndo::ArtifactType(type_id));
        info!(type_id, name, "registered artifact type");
        Ok(ty)
    }

    /// Registers an attribute type, or returns the existing one with the
    /// same name.
    pub fn register_attribute_type(
        &self,
        name: &str,
        display_name: &str,
        value_kind: ValueKind,
    ) -> Result<AttributeType> {
        check_type_name(name)?;
        let types = &self.case().types;
        if let Some(existing) = types.attribute_type_by_name(name) {
            return Ok(existing);
        }
        let conn = self.connection();
        if let Some(row) = conn.query_opt(
            "SELECT attribute_type_id, display_name, value_type FROM attribute_types WHERE type_name = ?",
            crate::values![name],
        )? {
            let ty = AttributeType {
                type_id: row.get(0)?,
                name: name.to_string(),
                display_name: row.get::<Option<String>>(1)?.unwrap_or_default(),
                value_kind: ValueKind::from_code(row.get(2)?)?,
            };
            types.insert_attribute_type(ty.clone());
            return Ok(ty);
        }

        let type_id = next_type_id(conn, "attribute_types", "attribute_type_id")?;
        conn.execute(
            "INSERT INTO attribute_types (attribute_type_id, type_name, display_name, value_type) \
             VALUES (?, ?, ?, ?)",
            &[
                SqlValue::from(type_id),
                SqlValue::from(name),
                SqlValue::from(display_name),
                SqlValue::from(value_kind.code()),
            ],
        )?;
        let ty = AttributeType {
            type_id,
            name: name.to_string(),
            display_name: display_name.to_string(),
            value_kind,
        };
        types.insert_attribute_type(ty.clone());
        self.record(CacheUndo::AttributeType(type_id));
        info!(type_id, name, "registered attribute type");
        Ok(ty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_builtin_ids_are_unique_and_below_user_range() {
        let ids: HashSet<_> = BUILTIN_ARTIFACT_TYPES.iter().map(|t| t.id).collect();
        assert_eq!(ids.len(), BUILTIN_ARTIFACT_TYPES.len());
        let names: HashSet<_> = BUILTIN_ATTRIBUTE_TYPES.iter().map(|t| t.name).collect();
        assert_eq!(names.len(), BUILTIN_ATTRIBUTE_TYPES.len());
        assert!(
            BUILTIN_ARTIFACT_TYPES
                .iter()
                .map(|t| t.id)
                .chain(BUILTIN_ATTRIBUTE_TYPES.iter().map(|t| t.id))
                .all(|id| id > 0 && id < FIRST_USER_TYPE_ID)
        );
    }

    #[test]
    fn test_keyword_hit_is_analysis_result() {
        let keyword = BUILTIN_ARTIFACT_TYPES
            .iter()
            .find(|t| t.name == "TSK_KEYWORD_HIT")
            .unwrap();
        assert_eq!(keyword.id, 9);
        assert_eq!(keyword.category, ArtifactCategory::AnalysisResult);
    }

    #[test]
    fn test_table_remove_drops_name() {
        let registry = TypeRegistry::default();
        registry.insert_artifact_type(ArtifactType {
            type_id: 10_000,
            name: "CUSTOM".to_string(),
            display_name: "Custom".to_string(),
            category: ArtifactCategory::DataArtifact,
        });
        assert!(registry.artifact_type_by_name("CUSTOM").is_some());
        registry.remove_artifact_type(10_000);
        assert!(registry.artifact_type_by_name("CUSTOM").is_none());
        assert!(registry.artifact_type(10_000).is_none());
    }
}
