//! Pure SQL generation.
//!
//! Turns parsed options into `(sql, binds)` pairs. Nothing here touches
//! the database, so every shape the planner can emit is testable in
//! isolation. Identifiers are validated, JSON keys are escaped, and all
//! values travel as binds.

use crate::error::{PlannerError, Result};
use crate::options::{FilterOp, OrganizationFilter, QueryOptions};
use qindex_migrations::ScopeColumns;
use serde_json::Value;

/// Table read by the custom-entity fast path.
pub const CUSTOM_ENTITY_TABLE: &str = "custom_entities_storage";

/// A bind parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    /// Text parameter.
    Text(String),
    /// Integer parameter.
    Int(i64),
    /// Float parameter.
    Float(f64),
    /// Boolean parameter.
    Bool(bool),
    /// JSONB parameter.
    Json(Value),
}

impl BindValue {
    /// Convert a JSON literal into the matching bind type. Nulls and
    /// composites travel as JSONB.
    #[must_use]
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::String(s) => Self::Text(s.clone()),
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => n.as_i64().map_or_else(
                || Self::Float(n.as_f64().unwrap_or_default()),
                Self::Int,
            ),
            other => Self::Json(other.clone()),
        }
    }

    /// The JSON text of a value, for `#>> '{}'` comparisons.
    #[must_use]
    pub fn json_text(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// A generated statement with its binds, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    /// The SQL text with `$n` placeholders.
    pub sql: String,
    /// Bind values matching the placeholders.
    pub binds: Vec<BindValue>,
}

/// Inputs to the builder, already resolved by the planner.
#[derive(Debug)]
pub struct PlanInputs<'a> {
    /// Entity type string.
    pub entity_type: &'a str,
    /// Base table name.
    pub table: &'a str,
    /// Scoping columns present on the base table.
    pub base_cols: ScopeColumns,
    /// Parsed options.
    pub options: &'a QueryOptions,
    /// Join `entity_indexes` (hybrid) or stay base-only (naive).
    pub use_index: bool,
    /// Resolved custom-field keys to select (without the `cf:` prefix).
    pub cf_keys: &'a [String],
}

struct Builder {
    binds: Vec<BindValue>,
}

impl Builder {
    fn new() -> Self {
        Self { binds: Vec::new() }
    }

    fn push(&mut self, value: BindValue) -> String {
        self.binds.push(value);
        format!("${}", self.binds.len())
    }
}

/// Validate a SQL identifier coming from caller input.
pub fn sanitize_ident(name: &str) -> Result<&str> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        || name.chars().next().is_some_and(|c| c.is_ascii_digit())
    {
        return Err(PlannerError::InvalidArgument(format!(
            "invalid identifier '{name}'"
        )));
    }
    Ok(name)
}

/// Alias for a selected custom field: `cf:order.total` -> `cf_order_total`.
#[must_use]
pub fn cf_alias(key: &str) -> String {
    let mut alias = String::from("cf_");
    for c in key.chars() {
        if c.is_ascii_alphanumeric() {
            alias.push(c);
        } else {
            alias.push('_');
        }
    }
    alias
}

fn escape_json_key(key: &str) -> String {
    key.replace('\'', "''")
}

/// The coalesced doc expression for a custom field across the main index
/// alias and every source alias. Falls back to the legacy bare key.
fn cf_expr(key: &str, inputs: &PlanInputs<'_>) -> String {
    let escaped = escape_json_key(key);
    let mut parts = vec![
        format!("ei.doc -> 'cf:{escaped}'"),
        format!("ei.doc -> '{escaped}'"),
    ];
    for source in &inputs.options.custom_field_sources {
        let alias = format!("ei_{}", source.alias);
        parts.push(format!("{alias}.doc -> 'cf:{escaped}'"));
        parts.push(format!("{alias}.doc -> '{escaped}'"));
    }
    format!("COALESCE({})", parts.join(", "))
}

/// Build the paginated data query.
pub fn build_select(inputs: &PlanInputs<'_>) -> Result<SqlQuery> {
    let mut b = Builder::new();

    let selections = build_selections(inputs)?;
    let from = build_from(inputs, &mut b)?;
    let where_sql = build_where(inputs, &mut b)?;
    let order = build_order(inputs)?;

    let offset = u64::from(inputs.options.page.saturating_sub(1))
        * u64::from(inputs.options.page_size);
    let mut sql = format!("SELECT {selections} FROM {from} WHERE {where_sql}");
    if !order.is_empty() {
        sql.push_str(&format!(" ORDER BY {order}"));
    }
    sql.push_str(&format!(
        " LIMIT {} OFFSET {offset}",
        inputs.options.page_size
    ));

    Ok(SqlQuery { sql, binds: b.binds })
}

/// Build the count query. Without custom-field filters the index join is
/// skipped entirely; otherwise a `COUNT(DISTINCT b.id)` runs over the
/// full joined shape.
pub fn build_count(inputs: &PlanInputs<'_>) -> Result<SqlQuery> {
    let mut b = Builder::new();

    if inputs.options.has_custom_field_filter() && inputs.use_index {
        let from = build_from(inputs, &mut b)?;
        let where_sql = build_where(inputs, &mut b)?;
        return Ok(SqlQuery {
            sql: format!("SELECT COUNT(DISTINCT b.id) AS total FROM {from} WHERE {where_sql}"),
            binds: b.binds,
        });
    }

    // Optimized: base predicates only, no index join.
    let base_only = PlanInputs {
        entity_type: inputs.entity_type,
        table: inputs.table,
        base_cols: inputs.base_cols,
        options: inputs.options,
        use_index: false,
        cf_keys: inputs.cf_keys,
    };
    let where_sql = build_where(&base_only, &mut b)?;
    Ok(SqlQuery {
        sql: format!(
            "SELECT COUNT(*) AS total FROM (SELECT b.id FROM {} b WHERE {where_sql} GROUP BY b.id) q",
            inputs.table
        ),
        binds: b.binds,
    })
}

fn build_selections(inputs: &PlanInputs<'_>) -> Result<String> {
    let mut parts: Vec<String> = Vec::new();

    if inputs.options.fields.is_empty() {
        parts.push("b.*".to_string());
    } else {
        for field in &inputs.options.fields {
            if let Some(key) = field.strip_prefix("cf:") {
                let alias = cf_alias(key);
                if inputs.use_index {
                    parts.push(format!("{} AS {alias}", cf_expr(key, inputs)));
                } else {
                    parts.push(format!("NULL::jsonb AS {alias}"));
                }
            } else {
                let ident = sanitize_ident(field)?;
                parts.push(format!("b.{ident}"));
            }
        }
    }

    for key in inputs.cf_keys {
        let alias = cf_alias(key);
        let already = inputs
            .options
            .fields
            .iter()
            .any(|f| f.strip_prefix("cf:") == Some(key.as_str()));
        if already {
            continue;
        }
        if inputs.use_index {
            parts.push(format!("{} AS {alias}", cf_expr(key, inputs)));
        } else {
            parts.push(format!("NULL::jsonb AS {alias}"));
        }
    }

    Ok(parts.join(", "))
}

fn build_from(inputs: &PlanInputs<'_>, b: &mut Builder) -> Result<String> {
    let mut from = format!("{} b", inputs.table);

    if inputs.use_index {
        let entity_bind = b.push(BindValue::Text(inputs.entity_type.to_string()));
        let mut join = format!(
            "LEFT JOIN entity_indexes ei ON ei.entity_type = {entity_bind} AND ei.record_id = b.id::text"
        );
        if inputs.base_cols.has_organization {
            join.push_str(
                " AND ei.organization_id IS NOT DISTINCT FROM b.organization_id::text",
            );
        }
        if inputs.base_cols.has_tenant {
            join.push_str(" AND ei.tenant_id IS NOT DISTINCT FROM b.tenant_id::text");
        }
        if !inputs.options.with_deleted {
            join.push_str(" AND ei.deleted_at IS NULL");
        }
        from.push_str(&format!(" {join}"));

        for source in &inputs.options.custom_field_sources {
            sanitize_ident(&source.alias)?;
            sanitize_ident(&source.record_id_column)?;
            from.push_str(&format!(
                " LEFT JOIN {} {} ON {}",
                source.table, source.alias, source.join_on
            ));

            let ei_alias = format!("ei_{}", source.alias);
            let mut side = format!(
                " LEFT JOIN entity_indexes {ei_alias} ON {ei_alias}.record_id = {}.{}::text",
                source.alias, source.record_id_column
            );
            if let Some(entity) = &source.entity_type {
                let bind = b.push(BindValue::Text(entity.clone()));
                side.push_str(&format!(" AND {ei_alias}.entity_type = {bind}"));
            }
            if let Some(org_field) = &source.organization_field {
                sanitize_ident(org_field)?;
                side.push_str(&format!(
                    " AND {ei_alias}.organization_id IS NOT DISTINCT FROM {}.{org_field}::text",
                    source.alias
                ));
            }
            if let Some(tenant_field) = &source.tenant_field {
                sanitize_ident(tenant_field)?;
                side.push_str(&format!(
                    " AND {ei_alias}.tenant_id IS NOT DISTINCT FROM {}.{tenant_field}::text",
                    source.alias
                ));
            }
            if !inputs.options.with_deleted {
                side.push_str(&format!(" AND {ei_alias}.deleted_at IS NULL"));
            }
            from.push_str(&side);
        }
    }

    Ok(from)
}

fn build_where(inputs: &PlanInputs<'_>, b: &mut Builder) -> Result<String> {
    let mut clauses: Vec<String> = Vec::new();

    if inputs.base_cols.has_tenant {
        let bind = b.push(BindValue::Text(inputs.options.tenant_id.clone()));
        clauses.push(format!("b.tenant_id::text = {bind}"));
    }

    if inputs.base_cols.has_organization {
        match &inputs.options.organization {
            OrganizationFilter::Any => {}
            OrganizationFilter::One(org) => {
                let bind = b.push(BindValue::Text(org.clone()));
                clauses.push(format!("b.organization_id::text = {bind}"));
            }
            OrganizationFilter::Set { ids, include_null } => {
                if ids.is_empty() && !include_null {
                    clauses.push("FALSE".to_string());
                } else if ids.is_empty() {
                    clauses.push("b.organization_id IS NULL".to_string());
                } else {
                    let placeholders: Vec<String> = ids
                        .iter()
                        .map(|id| b.push(BindValue::Text(id.clone())))
                        .collect();
                    let in_clause =
                        format!("b.organization_id::text IN ({})", placeholders.join(", "));
                    if *include_null {
                        clauses.push(format!(
                            "({in_clause} OR b.organization_id IS NULL)"
                        ));
                    } else {
                        clauses.push(in_clause);
                    }
                }
            }
        }
    }

    if inputs.base_cols.has_deleted && !inputs.options.with_deleted {
        clauses.push("b.deleted_at IS NULL".to_string());
    }

    for filter in &inputs.options.filters {
        if filter.is_custom_field() {
            if !inputs.use_index {
                // The naive engine cannot see custom fields.
                continue;
            }
            let key = filter.field.trim_start_matches("cf:");
            let expr = cf_expr(key, inputs);
            for op in &filter.ops {
                clauses.push(cf_op_sql(&expr, op, b));
            }
        } else {
            let ident = sanitize_ident(&filter.field)?;
            let column = format!("b.{ident}");
            for op in &filter.ops {
                clauses.push(base_op_sql(&column, op, b));
            }
        }
    }

    if clauses.is_empty() {
        clauses.push("TRUE".to_string());
    }
    Ok(clauses.join(" AND "))
}

fn base_op_sql(column: &str, op: &FilterOp, b: &mut Builder) -> String {
    match op {
        FilterOp::Eq(Value::Null) => format!("{column} IS NULL"),
        FilterOp::Eq(value) => {
            let bind = b.push(BindValue::from_json(value));
            format!("{column} = {bind}")
        }
        FilterOp::Ne(Value::Null) => format!("{column} IS NOT NULL"),
        FilterOp::Ne(value) => {
            let bind = b.push(BindValue::from_json(value));
            format!("{column} IS DISTINCT FROM {bind}")
        }
        FilterOp::Gt(value) => {
            let bind = b.push(BindValue::from_json(value));
            format!("{column} > {bind}")
        }
        FilterOp::Gte(value) => {
            let bind = b.push(BindValue::from_json(value));
            format!("{column} >= {bind}")
        }
        FilterOp::Lt(value) => {
            let bind = b.push(BindValue::from_json(value));
            format!("{column} < {bind}")
        }
        FilterOp::Lte(value) => {
            let bind = b.push(BindValue::from_json(value));
            format!("{column} <= {bind}")
        }
        FilterOp::In(values) => {
            if values.is_empty() {
                return "FALSE".to_string();
            }
            let placeholders: Vec<String> = values
                .iter()
                .map(|v| b.push(BindValue::from_json(v)))
                .collect();
            format!("{column} IN ({})", placeholders.join(", "))
        }
        FilterOp::Nin(values) => {
            if values.is_empty() {
                return "TRUE".to_string();
            }
            let placeholders: Vec<String> = values
                .iter()
                .map(|v| b.push(BindValue::from_json(v)))
                .collect();
            format!("{column} NOT IN ({})", placeholders.join(", "))
        }
        FilterOp::Like(pattern) => {
            let bind = b.push(BindValue::Text(pattern.clone()));
            format!("{column}::text LIKE {bind}")
        }
        FilterOp::ILike(pattern) => {
            let bind = b.push(BindValue::Text(pattern.clone()));
            format!("{column}::text ILIKE {bind}")
        }
        FilterOp::Exists(true) => format!("{column} IS NOT NULL"),
        FilterOp::Exists(false) => format!("{column} IS NULL"),
    }
}

fn cf_eq_sql(expr: &str, value: &Value, b: &mut Builder) -> String {
    let eq_bind = b.push(BindValue::Json(value.clone()));
    let contains_bind = b.push(BindValue::Json(Value::Array(vec![value.clone()])));
    format!("({expr} = {eq_bind}::jsonb OR {expr} @> {contains_bind}::jsonb)")
}

fn cf_op_sql(expr: &str, op: &FilterOp, b: &mut Builder) -> String {
    match op {
        FilterOp::Eq(value) => cf_eq_sql(expr, value, b),
        FilterOp::Ne(value) => {
            let bind = b.push(BindValue::Json(value.clone()));
            format!("{expr} IS DISTINCT FROM {bind}::jsonb")
        }
        FilterOp::Gt(value) => {
            let bind = b.push(BindValue::Text(BindValue::json_text(value)));
            format!("({expr} #>> '{{}}') > {bind}")
        }
        FilterOp::Gte(value) => {
            let bind = b.push(BindValue::Text(BindValue::json_text(value)));
            format!("({expr} #>> '{{}}') >= {bind}")
        }
        FilterOp::Lt(value) => {
            let bind = b.push(BindValue::Text(BindValue::json_text(value)));
            format!("({expr} #>> '{{}}') < {bind}")
        }
        FilterOp::Lte(value) => {
            let bind = b.push(BindValue::Text(BindValue::json_text(value)));
            format!("({expr} #>> '{{}}') <= {bind}")
        }
        FilterOp::In(values) => {
            if values.is_empty() {
                return "FALSE".to_string();
            }
            let parts: Vec<String> = values
                .iter()
                .map(|v| cf_eq_sql(expr, v, b))
                .collect();
            format!("({})", parts.join(" OR "))
        }
        FilterOp::Nin(values) => {
            if values.is_empty() {
                return "TRUE".to_string();
            }
            let parts: Vec<String> = values
                .iter()
                .map(|v| cf_eq_sql(expr, v, b))
                .collect();
            format!("NOT COALESCE(({}), FALSE)", parts.join(" OR "))
        }
        FilterOp::Like(pattern) => {
            let bind = b.push(BindValue::Text(pattern.clone()));
            format!("({expr} #>> '{{}}') LIKE {bind}")
        }
        FilterOp::ILike(pattern) => {
            let bind = b.push(BindValue::Text(pattern.clone()));
            format!("({expr} #>> '{{}}') ILIKE {bind}")
        }
        FilterOp::Exists(true) => format!("{expr} IS NOT NULL"),
        FilterOp::Exists(false) => format!("{expr} IS NULL"),
    }
}

fn build_order(inputs: &PlanInputs<'_>) -> Result<String> {
    let mut parts: Vec<String> = Vec::new();
    for spec in &inputs.options.sort {
        let direction = if spec.desc { "DESC" } else { "ASC" };
        if let Some(key) = spec.field.strip_prefix("cf:") {
            if !inputs.use_index {
                continue;
            }
            parts.push(format!(
                "({} #>> '{{}}') {direction}",
                cf_expr(key, inputs)
            ));
        } else {
            let ident = sanitize_ident(&spec.field)?;
            parts.push(format!("b.{ident} {direction}"));
        }
    }
    Ok(parts.join(", "))
}

/// Build the data query for the custom-entity fast path: a single table
/// with all filtering and sorting on the `doc` column.
pub fn build_custom_entity_select(
    entity_type: &str,
    options: &QueryOptions,
) -> Result<SqlQuery> {
    let mut b = Builder::new();
    let where_sql = custom_entity_where(entity_type, options, &mut b);
    let order = custom_entity_order(options);

    let offset = u64::from(options.page.saturating_sub(1)) * u64::from(options.page_size);
    let mut sql = format!(
        "SELECT ce.record_id AS id, ce.doc FROM {CUSTOM_ENTITY_TABLE} ce WHERE {where_sql}"
    );
    if !order.is_empty() {
        sql.push_str(&format!(" ORDER BY {order}"));
    }
    sql.push_str(&format!(" LIMIT {} OFFSET {offset}", options.page_size));

    Ok(SqlQuery { sql, binds: b.binds })
}

/// Count query for the custom-entity fast path.
pub fn build_custom_entity_count(entity_type: &str, options: &QueryOptions) -> SqlQuery {
    let mut b = Builder::new();
    let where_sql = custom_entity_where(entity_type, options, &mut b);
    SqlQuery {
        sql: format!(
            "SELECT COUNT(*) AS total FROM {CUSTOM_ENTITY_TABLE} ce WHERE {where_sql}"
        ),
        binds: b.binds,
    }
}

fn custom_entity_where(entity_type: &str, options: &QueryOptions, b: &mut Builder) -> String {
    let entity_bind = b.push(BindValue::Text(entity_type.to_string()));
    let tenant_bind = b.push(BindValue::Text(options.tenant_id.clone()));
    let mut clauses = vec![
        format!("ce.entity_type = {entity_bind}"),
        format!("ce.tenant_id = {tenant_bind}"),
    ];

    match &options.organization {
        OrganizationFilter::Any => {}
        OrganizationFilter::One(org) => {
            let bind = b.push(BindValue::Text(org.clone()));
            clauses.push(format!("ce.organization_id = {bind}"));
        }
        OrganizationFilter::Set { ids, include_null } => {
            if ids.is_empty() && !include_null {
                clauses.push("FALSE".to_string());
            } else if ids.is_empty() {
                clauses.push("ce.organization_id IS NULL".to_string());
            } else {
                let placeholders: Vec<String> = ids
                    .iter()
                    .map(|id| b.push(BindValue::Text(id.clone())))
                    .collect();
                let in_clause =
                    format!("ce.organization_id IN ({})", placeholders.join(", "));
                if *include_null {
                    clauses.push(format!("({in_clause} OR ce.organization_id IS NULL)"));
                } else {
                    clauses.push(in_clause);
                }
            }
        }
    }

    if !options.with_deleted {
        clauses.push("ce.deleted_at IS NULL".to_string());
    }

    for filter in &options.filters {
        let key = filter.field.trim_start_matches("cf:");
        let expr = format!("ce.doc -> '{}'", escape_json_key(key));
        for op in &filter.ops {
            clauses.push(cf_op_sql(&expr, op, b));
        }
    }

    clauses.join(" AND ")
}

fn custom_entity_order(options: &QueryOptions) -> String {
    let parts: Vec<String> = options
        .sort
        .iter()
        .map(|spec| {
            let key = spec.field.trim_start_matches("cf:");
            let direction = if spec.desc { "DESC" } else { "ASC" };
            format!(
                "(ce.doc -> '{}' #>> '{{}}') {direction}",
                escape_json_key(key)
            )
        })
        .collect();
    parts.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{FieldFilter, IncludeCustomFields, QueryOptions, SortSpec};
    use serde_json::json;

    fn cols_all() -> ScopeColumns {
        ScopeColumns {
            has_organization: true,
            has_tenant: true,
            has_deleted: true,
            has_updated: true,
        }
    }

    fn inputs<'a>(options: &'a QueryOptions, cf_keys: &'a [String]) -> PlanInputs<'a> {
        PlanInputs {
            entity_type: "example:todo",
            table: "todos",
            base_cols: cols_all(),
            options,
            use_index: true,
            cf_keys,
        }
    }

    #[test]
    fn test_select_joins_index_once() {
        let options = QueryOptions::new("t1")
            .unwrap()
            .with_fields(vec!["id".to_string(), "cf:priority".to_string()])
            .with_organization("o1");
        let query = build_select(&inputs(&options, &[])).unwrap();

        assert!(query.sql.contains("LEFT JOIN entity_indexes ei"));
        assert!(query.sql.contains("ei.record_id = b.id::text"));
        assert!(query.sql.contains("ei.deleted_at IS NULL"));
        assert!(query.sql.contains("COALESCE(ei.doc -> 'cf:priority', ei.doc -> 'priority') AS cf_priority"));
        assert!(query.sql.contains("b.tenant_id::text = $2"));
        assert!(query.sql.contains("b.organization_id::text = $3"));
        assert!(query.sql.contains("LIMIT 20 OFFSET 0"));
        assert_eq!(
            query.binds,
            vec![
                BindValue::Text("example:todo".to_string()),
                BindValue::Text("t1".to_string()),
                BindValue::Text("o1".to_string()),
            ]
        );
    }

    #[test]
    fn test_naive_engine_skips_index() {
        let options = QueryOptions::new("t1")
            .unwrap()
            .with_fields(vec!["id".to_string(), "cf:priority".to_string()])
            .with_filters(vec![FieldFilter {
                field: "cf:priority".to_string(),
                ops: vec![FilterOp::Eq(json!("high"))],
            }]);
        let mut plan = inputs(&options, &[]);
        plan.use_index = false;
        let query = build_select(&plan).unwrap();

        assert!(!query.sql.contains("entity_indexes"));
        assert!(query.sql.contains("NULL::jsonb AS cf_priority"));
        // The cf filter is unservable without the index and is dropped.
        assert!(!query.sql.contains("cf:priority"));
    }

    #[test]
    fn test_cf_eq_uses_containment_fallback() {
        let options = QueryOptions::new("t1").unwrap().with_filters(vec![FieldFilter {
            field: "cf:tags".to_string(),
            ops: vec![FilterOp::Eq(json!("red"))],
        }]);
        let query = build_select(&inputs(&options, &[])).unwrap();
        assert!(query.sql.contains("@>"));
        assert!(query
            .binds
            .contains(&BindValue::Json(json!(["red"]))));
    }

    #[test]
    fn test_cf_range_compares_text_extraction() {
        let options = QueryOptions::new("t1").unwrap().with_filters(vec![FieldFilter {
            field: "cf:priority".to_string(),
            ops: vec![FilterOp::Gte(json!(3))],
        }]);
        let query = build_select(&inputs(&options, &[])).unwrap();
        assert!(query.sql.contains("#>> '{}') >="));
        assert!(query.binds.contains(&BindValue::Text("3".to_string())));
    }

    #[test]
    fn test_empty_organization_set_matches_nothing() {
        let options = QueryOptions::new("t1")
            .unwrap()
            .with_organizations(vec![]);
        let query = build_select(&inputs(&options, &[])).unwrap();
        assert!(query.sql.contains("FALSE"));
    }

    #[test]
    fn test_organization_set_with_null() {
        let options = QueryOptions::new("t1")
            .unwrap()
            .with_organizations(vec![Some("o1".to_string()), None]);
        let query = build_select(&inputs(&options, &[])).unwrap();
        assert!(query
            .sql
            .contains("(b.organization_id::text IN ($3) OR b.organization_id IS NULL)"));
    }

    #[test]
    fn test_count_optimized_without_cf_filter() {
        let options = QueryOptions::new("t1").unwrap().with_filters(vec![FieldFilter {
            field: "title".to_string(),
            ops: vec![FilterOp::Like("%bike%".to_string())],
        }]);
        let query = build_count(&inputs(&options, &[])).unwrap();
        assert!(!query.sql.contains("entity_indexes"));
        assert!(query.sql.contains("GROUP BY b.id"));
    }

    #[test]
    fn test_count_general_with_cf_filter() {
        let options = QueryOptions::new("t1").unwrap().with_filters(vec![FieldFilter {
            field: "cf:priority".to_string(),
            ops: vec![FilterOp::Eq(json!("high"))],
        }]);
        let query = build_count(&inputs(&options, &[])).unwrap();
        assert!(query.sql.contains("COUNT(DISTINCT b.id)"));
        assert!(query.sql.contains("entity_indexes"));
    }

    #[test]
    fn test_sort_on_base_and_cf() {
        let options = QueryOptions::new("t1").unwrap().with_sort(vec![
            SortSpec {
                field: "created_at".to_string(),
                desc: true,
            },
            SortSpec {
                field: "cf:priority".to_string(),
                desc: false,
            },
        ]);
        let query = build_select(&inputs(&options, &[])).unwrap();
        assert!(query.sql.contains("ORDER BY b.created_at DESC"));
        assert!(query.sql.contains("#>> '{}') ASC"));
    }

    #[test]
    fn test_pagination_offset() {
        let options = QueryOptions::new("t1").unwrap().with_page(3, 5);
        let query = build_select(&inputs(&options, &[])).unwrap();
        assert!(query.sql.contains("LIMIT 5 OFFSET 10"));
    }

    #[test]
    fn test_identifier_injection_rejected() {
        let options = QueryOptions::new("t1")
            .unwrap()
            .with_fields(vec!["id; DROP TABLE".to_string()]);
        assert!(build_select(&inputs(&options, &[])).is_err());
    }

    #[test]
    fn test_include_keys_are_appended_once() {
        let options = QueryOptions::new("t1")
            .unwrap()
            .with_fields(vec!["id".to_string(), "cf:priority".to_string()])
            .with_custom_fields(IncludeCustomFields::All);
        let keys = vec!["priority".to_string(), "severity".to_string()];
        let query = build_select(&inputs(&options, &keys)).unwrap();
        assert_eq!(query.sql.matches("AS cf_priority").count(), 1);
        assert!(query.sql.contains("AS cf_severity"));
    }

    #[test]
    fn test_custom_field_source_adds_aliased_joins() {
        let options = QueryOptions::new("t1")
            .unwrap()
            .with_fields(vec!["cf:segment".to_string()])
            .with_source(crate::options::CustomFieldSource {
                table: "customers".to_string(),
                alias: "cust".to_string(),
                join_on: "cust.id = b.customer_id".to_string(),
                record_id_column: "id".to_string(),
                entity_type: Some("crm:customer".to_string()),
                organization_field: Some("organization_id".to_string()),
                tenant_field: None,
            });
        let query = build_select(&inputs(&options, &[])).unwrap();
        assert!(query.sql.contains("LEFT JOIN customers cust ON cust.id = b.customer_id"));
        assert!(query.sql.contains("LEFT JOIN entity_indexes ei_cust"));
        assert!(query.sql.contains("ei_cust.doc -> 'cf:segment'"));
        assert!(query
            .sql
            .contains("ei_cust.organization_id IS NOT DISTINCT FROM cust.organization_id::text"));
    }

    #[test]
    fn test_custom_entity_fast_path() {
        let options = QueryOptions::new("t1")
            .unwrap()
            .with_filters(vec![FieldFilter {
                field: "priority".to_string(),
                ops: vec![FilterOp::Eq(json!("high"))],
            }])
            .with_sort(vec![SortSpec {
                field: "title".to_string(),
                desc: false,
            }])
            .with_page(2, 10);
        let query = build_custom_entity_select("custom:ticket", &options).unwrap();
        assert!(query.sql.contains(CUSTOM_ENTITY_TABLE));
        assert!(query.sql.contains("ce.doc -> 'priority'"));
        assert!(query.sql.contains("LIMIT 10 OFFSET 10"));

        let count = build_custom_entity_count("custom:ticket", &options);
        assert!(count.sql.contains("COUNT(*)"));
    }
}
