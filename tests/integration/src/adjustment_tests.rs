//! Coverage adjustment aggregation laws.

use pretty_assertions::assert_eq;
use qindex_core::{EntityType, Scope};
use qindex_coverage::{aggregate_adjustments, CoverageAdjustment};

fn adj(entity: &str, tenant: &str, org: Option<&str>, base: i64, index: i64) -> CoverageAdjustment {
    CoverageAdjustment {
        entity_type: EntityType::new(entity).unwrap(),
        scope: Scope::new(tenant, org.map(ToString::to_string)),
        delta_base: base,
        delta_index: index,
        delta_vector: 0,
    }
}

#[test]
fn same_scope_adjustments_sum() {
    let merged = aggregate_adjustments(vec![
        adj("example:todo", "t1", Some("o1"), 1, 1),
        adj("example:todo", "t1", Some("o1"), 0, 1),
        adj("example:todo", "t1", Some("o1"), -1, 1),
    ]);
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].delta_base, 0);
    assert_eq!(merged[0].delta_index, 3);
}

#[test]
fn disjoint_scopes_are_order_independent() {
    let forward = aggregate_adjustments(vec![
        adj("example:todo", "t1", Some("o1"), 1, 1),
        adj("example:todo", "t1", Some("o2"), 2, 2),
        adj("example:note", "t1", Some("o1"), 3, 3),
    ]);
    let reversed = aggregate_adjustments(vec![
        adj("example:note", "t1", Some("o1"), 3, 3),
        adj("example:todo", "t1", Some("o2"), 2, 2),
        adj("example:todo", "t1", Some("o1"), 1, 1),
    ]);

    let mut forward_keys: Vec<String> = forward
        .iter()
        .map(|a| a.scope.cache_key(&a.entity_type))
        .collect();
    let mut reversed_keys: Vec<String> = reversed
        .iter()
        .map(|a| a.scope.cache_key(&a.entity_type))
        .collect();
    forward_keys.sort();
    reversed_keys.sort();
    assert_eq!(forward_keys, reversed_keys);

    for adjustment in &forward {
        let key = adjustment.scope.cache_key(&adjustment.entity_type);
        let twin = reversed
            .iter()
            .find(|a| a.scope.cache_key(&a.entity_type) == key)
            .unwrap();
        assert_eq!(adjustment.delta_base, twin.delta_base);
        assert_eq!(adjustment.delta_index, twin.delta_index);
    }
}

#[test]
fn zero_sum_adjustments_vanish() {
    let merged = aggregate_adjustments(vec![
        adj("example:todo", "t1", Some("o1"), 1, 2),
        adj("example:todo", "t1", Some("o1"), -1, -2),
        adj("example:todo", "t1", None, 0, 1),
    ]);
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].scope.organization_id, None);
}

#[test]
fn global_and_scoped_buckets_stay_separate() {
    let merged = aggregate_adjustments(vec![
        adj("example:todo", "t1", None, 1, 1),
        adj("example:todo", "t1", Some("o1"), 1, 1),
    ]);
    assert_eq!(merged.len(), 2);
}
