//! Document composition and token extraction seams.

use pretty_assertions::assert_eq;
use qindex_core::doc::{doc_from_value, is_tokenizable};
use qindex_indexer::builder::{compose, group_custom_fields, CustomFieldValue};
use qindex_indexer::tokens::{hash_token, tokenize};
use serde_json::json;

fn cf(key: &str, value: serde_json::Value) -> CustomFieldValue {
    CustomFieldValue {
        field_key: key.to_string(),
        value,
    }
}

#[test]
fn incremental_upsert_document_shape() {
    // The document produced for a freshly created record: base columns
    // plus one visible custom field.
    let base = doc_from_value(json!({
        "id": "r1",
        "organization_id": "o1",
        "tenant_id": "t1",
        "title": "Hi"
    }))
    .unwrap();

    let doc = compose(base, None, vec![cf("priority", json!("hi"))], Vec::new());

    assert_eq!(
        serde_json::Value::Object(doc),
        json!({
            "id": "r1",
            "organization_id": "o1",
            "tenant_id": "t1",
            "title": "Hi",
            "cf:priority": "hi"
        })
    );
}

#[test]
fn layering_profile_over_parent_and_translations_last() {
    let base = doc_from_value(json!({"id": "p1", "name": "profile"})).unwrap();
    let parent = doc_from_value(json!({"id": "c1", "name": "parent", "vip": true})).unwrap();
    let doc = compose(
        base,
        Some(parent),
        vec![cf("name", json!("cf wins nothing"))],
        vec![("l10n:de:name".to_string(), json!("Profil"))],
    );

    // Profile beats parent, cf lands under its own prefixed key, the
    // translation is a separate key.
    assert_eq!(doc.get("id"), Some(&json!("p1")));
    assert_eq!(doc.get("name"), Some(&json!("profile")));
    assert_eq!(doc.get("vip"), Some(&json!(true)));
    assert_eq!(doc.get("cf:name"), Some(&json!("cf wins nothing")));
    assert_eq!(doc.get("l10n:de:name"), Some(&json!("Profil")));
}

#[test]
fn single_and_multi_value_custom_fields() {
    let grouped = group_custom_fields(vec![
        cf("priority", json!("high")),
        cf("labels", json!("red")),
        cf("labels", json!("blue")),
    ]);

    assert_eq!(grouped[0], ("priority".to_string(), json!("high")));
    assert_eq!(grouped[1], ("labels".to_string(), json!(["red", "blue"])));
}

#[test]
fn tokenization_field_value_rules() {
    assert!(is_tokenizable(&json!("text")));
    assert!(is_tokenizable(&json!(["a", "b"])));
    assert!(!is_tokenizable(&json!("")));
    assert!(!is_tokenizable(&json!(["a", 1])));
    assert!(!is_tokenizable(&json!(7)));

    assert_eq!(tokenize("Walking-Shoes, size 42"), vec![
        "walking", "shoes", "size", "42"
    ]);
    assert_eq!(hash_token("shoes").len(), 64);
}
