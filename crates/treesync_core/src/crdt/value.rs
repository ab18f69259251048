//! Conversion between JSON values and yrs values.
//!
//! Attribute and formatting values travel as `serde_json::Value` and are
//! stored in the tree as [`Any`]. Integers are stored as `Any::BigInt`; any
//! integral `Any::Number` written by another peer reads back as a JSON
//! integer, the way `JSON.stringify` renders it.

use std::sync::Arc;

use serde_json::{Number, Value};
use yrs::types::Attrs;
use yrs::{Any, Out, ReadTxn};

use super::types::AttributeMap;

/// Largest integer an `f64` represents exactly.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// Convert a JSON value into a yrs value.
pub fn json_to_any(value: &Value) -> Any {
    match value {
        Value::Null => Any::Null,
        Value::Bool(b) => Any::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Any::BigInt(i),
            None => Any::Number(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => Any::String(Arc::from(s.as_str())),
        Value::Array(items) => Any::Array(items.iter().map(json_to_any).collect()),
        Value::Object(map) => Any::Map(Arc::new(
            map.iter()
                .map(|(key, value)| (key.clone(), json_to_any(value)))
                .collect(),
        )),
    }
}

/// Convert a yrs value into a JSON value.
pub fn any_to_json(any: &Any) -> Value {
    match any {
        Any::Null | Any::Undefined => Value::Null,
        Any::Bool(b) => Value::Bool(*b),
        Any::Number(n) => number_to_json(*n),
        Any::BigInt(i) => Value::from(*i),
        Any::String(s) => Value::String(s.to_string()),
        Any::Buffer(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
        Any::Array(items) => Value::Array(items.iter().map(any_to_json).collect()),
        Any::Map(map) => Value::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), any_to_json(value)))
                .collect(),
        ),
    }
}

fn number_to_json(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        return Value::from(n as i64);
    }
    // NaN and infinities have no JSON form
    Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
}

/// Convert a value read from the tree into JSON.
///
/// Attribute values written through this crate are always plain values;
/// shared types placed there by other writers are rendered as strings.
pub fn out_to_json<T: ReadTxn>(txn: &T, out: &Out) -> Value {
    match out {
        Out::Any(any) => any_to_json(any),
        other => Value::String(other.clone().to_string(txn)),
    }
}

/// Convert a JSON attribute map into yrs formatting attributes.
pub fn attrs_from_map(map: &AttributeMap) -> Attrs {
    map.iter()
        .map(|(key, value)| (Arc::from(key.as_str()), json_to_any(value)))
        .collect()
}

/// Convert yrs formatting attributes into a JSON attribute map, sorted by name.
pub fn attrs_to_map(attrs: &Attrs) -> AttributeMap {
    let mut entries: Vec<(String, Value)> = attrs
        .iter()
        .map(|(key, value)| (key.to_string(), any_to_json(value)))
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries.into_iter().collect()
}
