//! Query options, the filter AST, and result types.

use crate::error::{PlannerError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default page number.
pub const DEFAULT_PAGE: u32 = 1;
/// Default page size.
pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// One filter operator applied to a field.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterOp {
    /// Equal; for custom fields this also matches array membership.
    Eq(Value),
    /// Not equal (null-safe).
    Ne(Value),
    /// Greater than.
    Gt(Value),
    /// Greater than or equal.
    Gte(Value),
    /// Less than.
    Lt(Value),
    /// Less than or equal.
    Lte(Value),
    /// In a set; for custom fields each element also matches array
    /// membership.
    In(Vec<Value>),
    /// Not in a set.
    Nin(Vec<Value>),
    /// SQL LIKE.
    Like(String),
    /// Case-insensitive LIKE.
    ILike(String),
    /// Presence check: `true` for IS NOT NULL, `false` for IS NULL.
    Exists(bool),
}

/// All operators applied to one field; combined with AND.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldFilter {
    /// Field name; `cf:<key>` addresses a custom field.
    pub field: String,
    /// Operators, ANDed together.
    pub ops: Vec<FilterOp>,
}

impl FieldFilter {
    /// Whether this filter addresses a custom field.
    #[must_use]
    pub fn is_custom_field(&self) -> bool {
        self.field.starts_with("cf:")
    }
}

/// Sort direction for one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    /// Field name; `cf:<key>` sorts on the JSON text extraction.
    pub field: String,
    /// Descending order.
    pub desc: bool,
}

/// Organization restriction for a query.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OrganizationFilter {
    /// No restriction.
    #[default]
    Any,
    /// Exactly one organization.
    One(String),
    /// A set of organizations; `include_null` admits global rows. An
    /// empty set with `include_null = false` matches nothing.
    Set {
        /// Organization ids to match.
        ids: Vec<String>,
        /// Also match rows with a null organization.
        include_null: bool,
    },
}

impl OrganizationFilter {
    /// Build from the `organizationIds` option, which may contain nulls.
    #[must_use]
    pub fn from_ids(ids: Vec<Option<String>>) -> Self {
        let include_null = ids.iter().any(Option::is_none);
        let ids: Vec<String> = ids.into_iter().flatten().collect();
        Self::Set { ids, include_null }
    }

    /// Whether the filter can never match a row.
    #[must_use]
    pub fn is_empty_match(&self) -> bool {
        matches!(self, Self::Set { ids, include_null } if ids.is_empty() && !include_null)
    }
}

/// Which custom fields to include in the selection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum IncludeCustomFields {
    /// None beyond explicitly requested `cf:` fields.
    #[default]
    No,
    /// Every active custom-field key at the scope.
    All,
    /// An explicit key list (without the `cf:` prefix).
    Some(Vec<String>),
}

/// A cross-entity source whose index documents are coalesced into the
/// custom-field expressions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomFieldSource {
    /// Source table name.
    pub table: String,
    /// Alias for the source table.
    pub alias: String,
    /// Raw join condition between the source alias and `b`.
    pub join_on: String,
    /// Column on the source holding the indexed record id.
    pub record_id_column: String,
    /// Entity type of the source's index rows, when qualified.
    pub entity_type: Option<String>,
    /// Source column carrying the organization, if scoped.
    pub organization_field: Option<String>,
    /// Source column carrying the tenant, if scoped.
    pub tenant_field: Option<String>,
}

/// Parsed query options.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Fields to select; `cf:<key>` addresses custom fields.
    pub fields: Vec<String>,
    /// Field filters, ANDed together.
    pub filters: Vec<FieldFilter>,
    /// Sort specs, applied in order.
    pub sort: Vec<SortSpec>,
    /// 1-based page number.
    pub page: u32,
    /// Page size.
    pub page_size: u32,
    /// Tenant scope (required).
    pub tenant_id: String,
    /// Organization restriction.
    pub organization: OrganizationFilter,
    /// Include soft-deleted index rows.
    pub with_deleted: bool,
    /// Custom-field selection policy.
    pub include_custom_fields: IncludeCustomFields,
    /// Extra cross-entity doc sources.
    pub custom_field_sources: Vec<CustomFieldSource>,
}

impl QueryOptions {
    /// Minimal options for a tenant.
    pub fn new(tenant_id: impl Into<String>) -> Result<Self> {
        let tenant_id = tenant_id.into();
        if tenant_id.is_empty() {
            return Err(PlannerError::InvalidArgument(
                "tenantId is required".to_string(),
            ));
        }
        Ok(Self {
            fields: Vec::new(),
            filters: Vec::new(),
            sort: Vec::new(),
            page: DEFAULT_PAGE,
            page_size: DEFAULT_PAGE_SIZE,
            tenant_id,
            organization: OrganizationFilter::Any,
            with_deleted: false,
            include_custom_fields: IncludeCustomFields::No,
            custom_field_sources: Vec::new(),
        })
    }

    /// Select these fields.
    #[must_use]
    pub fn with_fields(mut self, fields: Vec<String>) -> Self {
        self.fields = fields;
        self
    }

    /// Apply these filters.
    #[must_use]
    pub fn with_filters(mut self, filters: Vec<FieldFilter>) -> Self {
        self.filters = filters;
        self
    }

    /// Sort by these specs.
    #[must_use]
    pub fn with_sort(mut self, sort: Vec<SortSpec>) -> Self {
        self.sort = sort;
        self
    }

    /// Set pagination. A zero page or page size falls back to defaults.
    #[must_use]
    pub fn with_page(mut self, page: u32, page_size: u32) -> Self {
        self.page = page.max(1);
        self.page_size = if page_size == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            page_size
        };
        self
    }

    /// Restrict to one organization.
    #[must_use]
    pub fn with_organization(mut self, organization_id: impl Into<String>) -> Self {
        self.organization = OrganizationFilter::One(organization_id.into());
        self
    }

    /// Restrict to a set of organizations (entries may be null).
    #[must_use]
    pub fn with_organizations(mut self, ids: Vec<Option<String>>) -> Self {
        self.organization = OrganizationFilter::from_ids(ids);
        self
    }

    /// Include soft-deleted rows.
    #[must_use]
    pub fn with_deleted(mut self, with_deleted: bool) -> Self {
        self.with_deleted = with_deleted;
        self
    }

    /// Custom-field selection policy.
    #[must_use]
    pub fn with_custom_fields(mut self, include: IncludeCustomFields) -> Self {
        self.include_custom_fields = include;
        self
    }

    /// Add a cross-entity doc source.
    #[must_use]
    pub fn with_source(mut self, source: CustomFieldSource) -> Self {
        self.custom_field_sources.push(source);
        self
    }

    /// Whether the query touches custom fields at all: a requested
    /// `cf:` field, a `cf:` filter, or an explicit include policy.
    #[must_use]
    pub fn touches_custom_fields(&self) -> bool {
        self.include_custom_fields != IncludeCustomFields::No
            || self.fields.iter().any(|f| f.starts_with("cf:"))
            || self.filters.iter().any(FieldFilter::is_custom_field)
            || self.sort.iter().any(|s| s.field.starts_with("cf:"))
    }

    /// Whether any filter addresses a custom field. Drives the count
    /// strategy.
    #[must_use]
    pub fn has_custom_field_filter(&self) -> bool {
        self.filters.iter().any(FieldFilter::is_custom_field)
    }
}

/// Details of a partial-coverage fallback or warning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialIndexWarning {
    /// Entity the warning is about.
    pub entity: String,
    /// Base rows under the scope.
    pub base_count: i64,
    /// Indexed rows under the scope.
    pub indexed_count: i64,
    /// `"scoped"` or `"global"`.
    pub scope: String,
}

/// Optional result metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryMeta {
    /// Present when the index did not fully cover the base population.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial_index_warning: Option<PartialIndexWarning>,
}

impl QueryMeta {
    /// Whether the meta carries anything worth serializing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.partial_index_warning.is_none()
    }
}

/// A page of query results.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    /// Result rows as JSON objects.
    pub items: Vec<Value>,
    /// 1-based page number.
    pub page: u32,
    /// Page size.
    pub page_size: u32,
    /// Total matching rows.
    pub total: i64,
    /// Optional metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<QueryMeta>,
}

impl QueryResult {
    /// An empty page with the given pagination.
    #[must_use]
    pub fn empty(page: u32, page_size: u32) -> Self {
        Self {
            items: Vec::new(),
            page,
            page_size,
            total: 0,
            meta: None,
        }
    }
}

/// Parse the `filters` option: either an object of `field -> spec` or an
/// array of such objects (ANDed).
pub fn parse_filters(value: &Value) -> Result<Vec<FieldFilter>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Object(map) => {
            let mut filters = Vec::new();
            for (field, spec) in map {
                filters.push(FieldFilter {
                    field: field.clone(),
                    ops: parse_ops(spec)?,
                });
            }
            Ok(filters)
        }
        Value::Array(items) => {
            let mut filters = Vec::new();
            for item in items {
                filters.extend(parse_filters(item)?);
            }
            Ok(filters)
        }
        other => Err(PlannerError::InvalidArgument(format!(
            "filters must be an object or array, got {other}"
        ))),
    }
}

fn parse_ops(spec: &Value) -> Result<Vec<FilterOp>> {
    let Value::Object(map) = spec else {
        // A bare value is shorthand for equality.
        return Ok(vec![FilterOp::Eq(spec.clone())]);
    };

    // An object without operator keys is also a literal (e.g. a JSON doc).
    if !map.keys().any(|k| k.starts_with('$')) {
        return Ok(vec![FilterOp::Eq(spec.clone())]);
    }

    let mut ops = Vec::new();
    for (op, operand) in map {
        let parsed = match op.as_str() {
            "$eq" => FilterOp::Eq(operand.clone()),
            "$ne" => FilterOp::Ne(operand.clone()),
            "$gt" => FilterOp::Gt(operand.clone()),
            "$gte" => FilterOp::Gte(operand.clone()),
            "$lt" => FilterOp::Lt(operand.clone()),
            "$lte" => FilterOp::Lte(operand.clone()),
            "$in" => FilterOp::In(operand_array(operand, "$in")?),
            "$nin" => FilterOp::Nin(operand_array(operand, "$nin")?),
            "$like" => FilterOp::Like(operand_string(operand, "$like")?),
            "$ilike" => FilterOp::ILike(operand_string(operand, "$ilike")?),
            "$exists" => FilterOp::Exists(operand.as_bool().ok_or_else(|| {
                PlannerError::InvalidArgument("$exists expects a boolean".to_string())
            })?),
            other => {
                return Err(PlannerError::InvalidArgument(format!(
                    "unknown filter operator {other}"
                )))
            }
        };
        ops.push(parsed);
    }
    Ok(ops)
}

fn operand_array(operand: &Value, op: &str) -> Result<Vec<Value>> {
    match operand {
        Value::Array(items) => Ok(items.clone()),
        _ => Err(PlannerError::InvalidArgument(format!(
            "{op} expects an array"
        ))),
    }
}

fn operand_string(operand: &Value, op: &str) -> Result<String> {
    operand
        .as_str()
        .map(ToString::to_string)
        .ok_or_else(|| PlannerError::InvalidArgument(format!("{op} expects a string")))
}

/// Parse the `sort` option: an array of `"field"` / `"-field"` strings or
/// `{field, desc}` objects.
pub fn parse_sort(value: &Value) -> Result<Vec<SortSpec>> {
    let Value::Array(items) = value else {
        if value.is_null() {
            return Ok(Vec::new());
        }
        return Err(PlannerError::InvalidArgument(
            "sort must be an array".to_string(),
        ));
    };

    let mut specs = Vec::new();
    for item in items {
        match item {
            Value::String(raw) => {
                let (field, desc) = match raw.strip_prefix('-') {
                    Some(rest) => (rest.to_string(), true),
                    None => (raw.clone(), false),
                };
                specs.push(SortSpec { field, desc });
            }
            Value::Object(map) => {
                let field = map
                    .get("field")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        PlannerError::InvalidArgument("sort entry missing field".to_string())
                    })?
                    .to_string();
                let desc = map.get("desc").and_then(Value::as_bool).unwrap_or(false);
                specs.push(SortSpec { field, desc });
            }
            other => {
                return Err(PlannerError::InvalidArgument(format!(
                    "unsupported sort entry {other}"
                )))
            }
        }
    }
    Ok(specs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_options_require_tenant() {
        assert!(QueryOptions::new("").is_err());
        assert!(QueryOptions::new("t1").is_ok());
    }

    #[test]
    fn test_pagination_defaults() {
        let options = QueryOptions::new("t1").unwrap();
        assert_eq!(options.page, 1);
        assert_eq!(options.page_size, 20);

        let options = options.with_page(0, 0);
        assert_eq!(options.page, 1);
        assert_eq!(options.page_size, 20);
    }

    #[test]
    fn test_parse_filters_shorthand_eq() {
        let filters = parse_filters(&json!({"title": "Hi"})).unwrap();
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].field, "title");
        assert_eq!(filters[0].ops, vec![FilterOp::Eq(json!("Hi"))]);
    }

    #[test]
    fn test_parse_filters_operators() {
        let filters = parse_filters(&json!({
            "cf:priority": {"$in": ["high", "urgent"]},
            "age": {"$gte": 18, "$lt": 65},
            "title": {"$ilike": "%bike%"},
            "closed_at": {"$exists": false}
        }))
        .unwrap();
        assert_eq!(filters.len(), 4);

        let age = filters.iter().find(|f| f.field == "age").unwrap();
        assert_eq!(age.ops.len(), 2);

        let priority = filters.iter().find(|f| f.field == "cf:priority").unwrap();
        assert!(priority.is_custom_field());
        assert_eq!(
            priority.ops,
            vec![FilterOp::In(vec![json!("high"), json!("urgent")])]
        );
    }

    #[test]
    fn test_parse_filters_array_form() {
        let filters =
            parse_filters(&json!([{"a": 1}, {"b": {"$ne": null}}])).unwrap();
        assert_eq!(filters.len(), 2);
    }

    #[test]
    fn test_parse_filters_rejects_unknown_operator() {
        assert!(parse_filters(&json!({"a": {"$regex": "x"}})).is_err());
        assert!(parse_filters(&json!("nope")).is_err());
    }

    #[test]
    fn test_parse_sort_forms() {
        let sort = parse_sort(&json!(["-created_at", "title", {"field": "cf:priority", "desc": true}]))
            .unwrap();
        assert_eq!(
            sort,
            vec![
                SortSpec {
                    field: "created_at".to_string(),
                    desc: true
                },
                SortSpec {
                    field: "title".to_string(),
                    desc: false
                },
                SortSpec {
                    field: "cf:priority".to_string(),
                    desc: true
                },
            ]
        );
    }

    #[test]
    fn test_organization_filter_from_ids() {
        let filter = OrganizationFilter::from_ids(vec![Some("o1".to_string()), None]);
        assert_eq!(
            filter,
            OrganizationFilter::Set {
                ids: vec!["o1".to_string()],
                include_null: true
            }
        );
        assert!(!filter.is_empty_match());

        let empty = OrganizationFilter::from_ids(vec![]);
        assert!(empty.is_empty_match());
    }

    #[test]
    fn test_touches_custom_fields() {
        let base = QueryOptions::new("t1")
            .unwrap()
            .with_fields(vec!["id".to_string(), "title".to_string()]);
        assert!(!base.touches_custom_fields());

        let with_cf_field = base.clone().with_fields(vec!["cf:priority".to_string()]);
        assert!(with_cf_field.touches_custom_fields());

        let with_policy = base
            .clone()
            .with_custom_fields(IncludeCustomFields::All);
        assert!(with_policy.touches_custom_fields());

        let with_cf_sort = base.with_sort(vec![SortSpec {
            field: "cf:priority".to_string(),
            desc: false,
        }]);
        assert!(with_cf_sort.touches_custom_fields());
    }
}
