//! Relational engine: table models, SQL rendering and query execution over a
//! sqlx `Any` pool.

mod builder;
mod include;
mod model;
mod operators;
mod query;
mod traits;

use serde_json::{Map, Value};

pub use builder::{SqlBuilder, decode_row};
pub use model::{Association, AssociationKind, Attribute, ColumnType, Model, Through};
pub use operators::{Op, translate};
pub use query::Executor;
pub use traits::{
    Attributes, FindOptions, IncludeOptions, OrderDirection, OrderItem, QueryOptions, SqlValue,
    WhereNode, WhereOptions, ensure_attribute, normalize_timestamp,
};

/// A materialized row: property name to JSON value, in column order.
pub type DataObject = Map<String, Value>;

/// Identity of a key value for matching related rows.
///
/// Numbers compare by value (`2` and `2.0` are one key). A string equals a
/// number only when it is that number's canonical form (`"2"` matches `2`,
/// `"02"` and `"2e0"` do not). Strings compare exactly among themselves.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyForm {
    scalar: bool,
    text: String,
}

pub fn key_form(value: &Value) -> KeyForm {
    match value {
        Value::String(s) => KeyForm {
            scalar: true,
            text: s.clone(),
        },
        Value::Number(n) => KeyForm {
            scalar: true,
            text: canonical_number(n),
        },
        other => KeyForm {
            scalar: false,
            text: other.to_string(),
        },
    }
}

fn canonical_number(n: &serde_json::Number) -> String {
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => (f as i64).to_string(),
        _ => n.to_string(),
    }
}

/// Key equality used when stitching related rows to their parents. Null
/// never matches.
pub fn same_key(a: &Value, b: &Value) -> bool {
    if a.is_null() || b.is_null() {
        return false;
    }
    a == b || key_form(a) == key_form(b)
}

/// Distinct non-null values of `key` across `rows`, in first-seen order.
pub fn distinct_keys<'r>(rows: impl IntoIterator<Item = &'r DataObject>, key: &str) -> Vec<Value> {
    let mut seen = std::collections::HashSet::new();
    let mut keys = Vec::new();
    for row in rows {
        if let Some(value) = row.get(key).filter(|v| !v.is_null()) {
            if seen.insert(key_form(value)) {
                keys.push(value.clone());
            }
        }
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_loose_key_equality() {
        assert!(same_key(&json!(2), &json!("2")));
        assert!(same_key(&json!(2.0), &json!(2)));
        assert!(same_key(&json!("abc"), &json!("abc")));
        assert!(!same_key(&json!(2), &json!(3)));
        assert!(!same_key(&Value::Null, &Value::Null));
    }

    #[test]
    fn test_text_keys_compare_exactly() {
        assert!(!same_key(&json!("01"), &json!("1")));
        assert!(!same_key(&json!("1e3"), &json!("1000")));
        assert!(!same_key(&json!("1e3"), &json!(1000)));
        assert!(!same_key(&json!("02"), &json!(2)));
        assert!(!same_key(&json!(true), &json!("true")));
        assert!(same_key(&json!("1000"), &json!(1000.0)));
    }

    #[test]
    fn test_distinct_keys() {
        let rows: Vec<DataObject> = [json!({"k": 1}), json!({"k": "1"}), json!({"k": null}), json!({"k": 3})]
            .into_iter()
            .filter_map(|v| v.as_object().cloned())
            .collect();
        assert_eq!(distinct_keys(&rows, "k"), vec![json!(1), json!(3)]);

        let codes: Vec<DataObject> = [json!({"k": "01"}), json!({"k": "1"}), json!({"k": "01"})]
            .into_iter()
            .filter_map(|v| v.as_object().cloned())
            .collect();
        assert_eq!(distinct_keys(&codes, "k"), vec![json!("01"), json!("1")]);
    }
}
