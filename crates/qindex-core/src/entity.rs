//! Entity addressing, scoping, and partitioning.

use crate::error::{QindexError, QindexResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Sentinel UUID used as the internal storage key for coverage rows when the
/// organization is null. Never exposed through the API surface.
pub const GLOBAL_ORG_SENTINEL: &str = "00000000-0000-0000-0000-000000000000";

/// A `"<module>:<entity>"` identifier that maps to exactly one base table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityType(String);

impl EntityType {
    /// Parse and validate an entity type string.
    pub fn new(raw: impl Into<String>) -> QindexResult<Self> {
        let raw = raw.into();
        let mut parts = raw.splitn(2, ':');
        match (parts.next(), parts.next()) {
            (Some(module), Some(entity)) if !module.is_empty() && !entity.is_empty() => {
                Ok(Self(raw))
            }
            _ => Err(QindexError::invalid_argument(format!(
                "entity type must be '<module>:<entity>', got '{raw}'"
            ))),
        }
    }

    /// The full `"<module>:<entity>"` string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The module segment.
    #[must_use]
    pub fn module(&self) -> &str {
        self.0.split(':').next().unwrap_or_default()
    }

    /// The entity segment.
    #[must_use]
    pub fn entity(&self) -> &str {
        self.0.splitn(2, ':').nth(1).unwrap_or_default()
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EntityType {
    type Err = QindexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Opaque record identifier; the record's stringified primary key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Wrap a stringified primary key.
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The raw id string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl From<String> for RecordId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

/// The tuple under which all indexed rows and counts are interpreted.
///
/// A `None` organization is the global scope; coverage storage maps it to
/// [`GLOBAL_ORG_SENTINEL`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    /// Tenant owning the rows.
    pub tenant_id: String,
    /// Organization within the tenant; `None` means global.
    pub organization_id: Option<String>,
    /// Whether soft-deleted base rows are included.
    #[serde(default)]
    pub with_deleted: bool,
}

impl Scope {
    /// Create a scope for a tenant with an optional organization.
    #[must_use]
    pub fn new(tenant_id: impl Into<String>, organization_id: Option<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            organization_id,
            with_deleted: false,
        }
    }

    /// Include soft-deleted rows in counts.
    #[must_use]
    pub fn with_deleted(mut self, with_deleted: bool) -> Self {
        self.with_deleted = with_deleted;
        self
    }

    /// Organization key as stored in coverage rows: the sentinel UUID when
    /// the organization is null.
    #[must_use]
    pub fn storage_org(&self) -> &str {
        self.organization_id
            .as_deref()
            .unwrap_or(GLOBAL_ORG_SENTINEL)
    }

    /// Stable key for per-scope in-process maps (throttles, debouncers).
    #[must_use]
    pub fn cache_key(&self, entity_type: &EntityType) -> String {
        format!(
            "{}|{}|{}|{}",
            entity_type,
            self.tenant_id,
            self.storage_org(),
            self.with_deleted
        )
    }
}

/// A `(partition_count, partition_index)` pair selecting a deterministic
/// subset of rows by primary-key hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionSpec {
    /// Total number of partitions.
    pub count: u32,
    /// Zero-based partition index.
    pub index: u32,
}

impl PartitionSpec {
    /// Validate `0 <= index < count`.
    pub fn new(count: u32, index: u32) -> QindexResult<Self> {
        if count == 0 {
            return Err(QindexError::invalid_argument(
                "partition count must be at least 1",
            ));
        }
        if index >= count {
            return Err(QindexError::invalid_argument(format!(
                "partition index {index} out of range for count {count}"
            )));
        }
        Ok(Self { count, index })
    }

    /// Whether this spec selects a strict subset of rows.
    #[must_use]
    pub fn is_partitioned(&self) -> bool {
        self.count > 1
    }
}

/// SQL predicate selecting the rows of one partition by primary-key hash.
///
/// Uses PostgreSQL's `hashtext` so the partition assignment is computed
/// inside the database and identical for every worker.
#[must_use]
pub fn partition_predicate(id_column: &str, spec: PartitionSpec) -> String {
    format!(
        "mod(abs(hashtext({col}::text)), {count}) = {index}",
        col = id_column,
        count = spec.count,
        index = spec.index
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_type_parsing() {
        let et = EntityType::new("example:todo").unwrap();
        assert_eq!(et.module(), "example");
        assert_eq!(et.entity(), "todo");
        assert_eq!(et.to_string(), "example:todo");

        assert!(EntityType::new("").is_err());
        assert!(EntityType::new("no-colon").is_err());
        assert!(EntityType::new(":entity").is_err());
        assert!(EntityType::new("module:").is_err());
    }

    #[test]
    fn test_entity_type_nested_colons() {
        let et = EntityType::new("crm:customer:person").unwrap();
        assert_eq!(et.module(), "crm");
        assert_eq!(et.entity(), "customer:person");
    }

    #[test]
    fn test_scope_storage_org() {
        let scoped = Scope::new("t1", Some("o1".to_string()));
        assert_eq!(scoped.storage_org(), "o1");

        let global = Scope::new("t1", None);
        assert_eq!(global.storage_org(), GLOBAL_ORG_SENTINEL);
    }

    #[test]
    fn test_scope_cache_key_distinguishes_with_deleted() {
        let et = EntityType::new("example:todo").unwrap();
        let a = Scope::new("t1", Some("o1".to_string()));
        let b = a.clone().with_deleted(true);
        assert_ne!(a.cache_key(&et), b.cache_key(&et));
    }

    #[test]
    fn test_partition_spec_bounds() {
        assert!(PartitionSpec::new(0, 0).is_err());
        assert!(PartitionSpec::new(5, 5).is_err());
        let last = PartitionSpec::new(5, 4).unwrap();
        assert!(last.is_partitioned());
        let single = PartitionSpec::new(1, 0).unwrap();
        assert!(!single.is_partitioned());
    }

    #[test]
    fn test_partition_predicate_sql() {
        let spec = PartitionSpec::new(5, 2).unwrap();
        assert_eq!(
            partition_predicate("b.id", spec),
            "mod(abs(hashtext(b.id::text)), 5) = 2"
        );
    }
}
