//! The index document model.
//!
//! A document is an ordered string-keyed mapping of JSON leaf values. The
//! `preserve_order` feature of `serde_json` keeps insertion order observable,
//! which is what makes the builder's layering rule (later layers override
//! earlier ones) deterministic.

use serde_json::{Map, Value};

/// An ordered mapping from field names to JSON values, as stored in the
/// `doc` column of `entity_indexes`.
pub type Doc = Map<String, Value>;

/// Convert a JSON value into a document, if it is an object.
#[must_use]
pub fn doc_from_value(value: Value) -> Option<Doc> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

/// Convert a document back into a JSON value.
#[must_use]
pub fn doc_to_value(doc: Doc) -> Value {
    Value::Object(doc)
}

/// Merge `overlay` into `base`, with overlay keys winning on collision.
///
/// Used by the builder for composite entities where a profile row is merged
/// on top of its parent-entity row.
pub fn merge_over(base: &mut Doc, overlay: Doc) {
    for (key, value) in overlay {
        base.insert(key, value);
    }
}

/// Check whether a value is a non-empty string or a non-empty array of
/// strings. The token extractor only considers such fields.
#[must_use]
pub fn is_tokenizable(value: &Value) -> bool {
    match value {
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => {
            !items.is_empty()
                && items
                    .iter()
                    .all(|v| matches!(v, Value::String(s) if !s.is_empty()))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_doc_from_value() {
        assert!(doc_from_value(json!({"a": 1})).is_some());
        assert!(doc_from_value(json!([1, 2])).is_none());
        assert!(doc_from_value(json!("x")).is_none());
    }

    #[test]
    fn test_merge_over_overlay_wins() {
        let mut base = doc_from_value(json!({"id": "p1", "name": "parent", "email": "p@x"}))
            .unwrap();
        let overlay = doc_from_value(json!({"name": "profile"})).unwrap();
        merge_over(&mut base, overlay);
        assert_eq!(base.get("name"), Some(&json!("profile")));
        assert_eq!(base.get("email"), Some(&json!("p@x")));
    }

    #[test]
    fn test_is_tokenizable() {
        assert!(is_tokenizable(&json!("hello")));
        assert!(is_tokenizable(&json!(["a", "b"])));
        assert!(!is_tokenizable(&json!("")));
        assert!(!is_tokenizable(&json!([])));
        assert!(!is_tokenizable(&json!(["a", ""])));
        assert!(!is_tokenizable(&json!(["a", 3])));
        assert!(!is_tokenizable(&json!(42)));
        assert!(!is_tokenizable(&json!(null)));
        assert!(!is_tokenizable(&json!({"k": "v"})));
    }
}
