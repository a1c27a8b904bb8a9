//! SQL shapes the planner emits for the documented scenarios.

use pretty_assertions::assert_eq;
use qindex_migrations::ScopeColumns;
use qindex_planner::sql::{build_count, build_select, PlanInputs};
use qindex_planner::{
    parse_filters, parse_sort, BindValue, IncludeCustomFields, QueryOptions,
};
use serde_json::json;

fn cols_all() -> ScopeColumns {
    ScopeColumns {
        has_organization: true,
        has_tenant: true,
        has_deleted: true,
        has_updated: true,
    }
}

fn hybrid_inputs<'a>(options: &'a QueryOptions, cf_keys: &'a [String]) -> PlanInputs<'a> {
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
fn full_coverage_hybrid_query_joins_index_once() {
    // Scenario: full coverage, one page of five items.
    let options = QueryOptions::new("t1")
        .unwrap()
        .with_fields(vec!["id".to_string(), "cf:priority".to_string()])
        .with_organization("o1")
        .with_page(1, 5);
    let query = build_select(&hybrid_inputs(&options, &[])).unwrap();

    assert_eq!(query.sql.matches("LEFT JOIN entity_indexes").count(), 1);
    assert!(query.sql.contains("LIMIT 5 OFFSET 0"));
    assert!(query.sql.ends_with("LIMIT 5 OFFSET 0"));
}

#[test]
fn naive_fallback_serves_base_columns_only() {
    // Scenario: partial coverage with force_partial_index = false; the
    // same request is answered from the base table alone.
    let options = QueryOptions::new("t1")
        .unwrap()
        .with_fields(vec!["id".to_string(), "cf:priority".to_string()])
        .with_organization("o1");
    let mut inputs = hybrid_inputs(&options, &[]);
    inputs.use_index = false;
    let query = build_select(&inputs).unwrap();

    assert!(!query.sql.contains("entity_indexes"));
    assert!(query.sql.contains("NULL::jsonb AS cf_priority"));
}

#[test]
fn parsed_filter_pipeline_reaches_sql() {
    let filters = parse_filters(&json!({
        "title": {"$ilike": "%bike%"},
        "cf:priority": {"$in": ["high", "urgent"]}
    }))
    .unwrap();
    let sort = parse_sort(&json!(["-created_at"])).unwrap();
    let options = QueryOptions::new("t1")
        .unwrap()
        .with_filters(filters)
        .with_sort(sort);

    let query = build_select(&hybrid_inputs(&options, &[])).unwrap();
    assert!(query.sql.contains("b.title::text ILIKE"));
    assert!(query.sql.contains("@>"));
    assert!(query.sql.contains("ORDER BY b.created_at DESC"));
    assert!(query
        .binds
        .contains(&BindValue::Text("%bike%".to_string())));
}

#[test]
fn count_strategy_follows_custom_field_usage() {
    // Base-only filters: the count never joins the index.
    let base_options = QueryOptions::new("t1")
        .unwrap()
        .with_filters(parse_filters(&json!({"title": "Hi"})).unwrap());
    let optimized = build_count(&hybrid_inputs(&base_options, &[])).unwrap();
    assert!(!optimized.sql.contains("entity_indexes"));

    // A cf filter forces the joined COUNT(DISTINCT ...).
    let cf_options = QueryOptions::new("t1")
        .unwrap()
        .with_filters(parse_filters(&json!({"cf:priority": "high"})).unwrap());
    let general = build_count(&hybrid_inputs(&cf_options, &[])).unwrap();
    assert!(general.sql.contains("COUNT(DISTINCT b.id)"));
}

#[test]
fn organization_set_boundaries() {
    // Empty set, no null flag: render a contradiction, never an error.
    let empty = QueryOptions::new("t1").unwrap().with_organizations(vec![]);
    assert!(empty.organization.is_empty_match());
    let query = build_select(&hybrid_inputs(&empty, &[])).unwrap();
    assert!(query.sql.contains("FALSE"));

    // Null-only set matches global rows.
    let global_only = QueryOptions::new("t1")
        .unwrap()
        .with_organizations(vec![None]);
    let query = build_select(&hybrid_inputs(&global_only, &[])).unwrap();
    assert!(query.sql.contains("b.organization_id IS NULL"));
}

#[test]
fn include_custom_fields_appends_resolved_keys() {
    let options = QueryOptions::new("t1")
        .unwrap()
        .with_fields(vec!["id".to_string()])
        .with_custom_fields(IncludeCustomFields::All);
    let keys = vec!["priority".to_string(), "due_phase".to_string()];
    let query = build_select(&hybrid_inputs(&options, &keys)).unwrap();

    assert!(query.sql.contains("AS cf_priority"));
    assert!(query.sql.contains("AS cf_due_phase"));
}

#[test]
fn degraded_base_table_drops_scope_clauses() {
    // A base table without tenant/org/deleted columns still queries.
    let options = QueryOptions::new("t1").unwrap().with_organization("o1");
    let inputs = PlanInputs {
        entity_type: "example:todo",
        table: "todos",
        base_cols: ScopeColumns::default(),
        options: &options,
        use_index: true,
        cf_keys: &[],
    };
    let query = build_select(&inputs).unwrap();
    assert!(!query.sql.contains("b.tenant_id"));
    assert!(!query.sql.contains("b.organization_id"));
    assert!(!query.sql.contains("b.deleted_at"));
}
