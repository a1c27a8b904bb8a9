//! Partition spec bounds and the generated predicate.

use pretty_assertions::assert_eq;
use qindex_core::{partition_predicate, PartitionSpec};

#[test]
fn last_partition_index_is_valid() {
    assert!(PartitionSpec::new(5, 4).is_ok());
}

#[test]
fn index_equal_to_count_is_rejected() {
    assert!(PartitionSpec::new(5, 5).is_err());
    assert!(PartitionSpec::new(0, 0).is_err());
}

#[test]
fn predicate_matches_storage_convention() {
    let spec = PartitionSpec::new(2, 1).unwrap();
    assert_eq!(
        partition_predicate("ei.record_id", spec),
        "mod(abs(hashtext(ei.record_id::text)), 2) = 1"
    );
}

#[test]
fn partition_predicates_cover_all_indices() {
    // The N predicates together partition the id space: same hash
    // expression, every residue exactly once.
    let count = 5;
    let predicates: Vec<String> = (0..count)
        .map(|index| {
            partition_predicate("b.id", PartitionSpec::new(count, index).unwrap())
        })
        .collect();

    for (index, predicate) in predicates.iter().enumerate() {
        assert!(predicate.starts_with("mod(abs(hashtext(b.id::text)), 5) = "));
        assert!(predicate.ends_with(&format!("= {index}")));
    }
}
