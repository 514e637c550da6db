//! Conversions between script values and [`Value`].

use std::collections::BTreeMap;

use rhai::{Array, Dynamic, Map};

use crate::rpc::Value;

/// Convert a script value. Kinds without a [`Value`] counterpart (custom
/// types, function pointers) are rendered as their display string.
pub fn to_value(value: &Dynamic) -> Value {
    if value.is_unit() {
        return Value::Unit;
    }
    if let Ok(b) = value.as_bool() {
        return Value::Bool(b);
    }
    if let Ok(i) = value.as_int() {
        return Value::Int(i);
    }
    if let Ok(f) = value.as_float() {
        return Value::Float(f);
    }
    if value.is_string() {
        return Value::Str(value.to_string());
    }
    if let Ok(c) = value.as_char() {
        return Value::Str(c.to_string());
    }
    if let Ok(items) = value.clone().into_array() {
        return Value::List(items.iter().map(to_value).collect());
    }
    if let Some(map) = value.clone().try_cast::<Map>() {
        return Value::Map(
            map.iter()
                .map(|(k, v)| (k.to_string(), to_value(v)))
                .collect(),
        );
    }
    Value::Str(value.to_string())
}

pub fn to_dynamic(value: Value) -> Dynamic {
    match value {
        Value::Unit => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from_bool(b),
        Value::Int(i) => Dynamic::from_int(i),
        Value::Float(f) => Dynamic::from_float(f),
        Value::Str(s) => Dynamic::from(s),
        Value::List(items) => Dynamic::from_array(items.into_iter().map(to_dynamic).collect()),
        Value::Map(map) => Dynamic::from_map(
            map.into_iter()
                .map(|(k, v)| (k.into(), to_dynamic(v)))
                .collect::<Map>(),
        ),
    }
}

/// Array of script values as a list of [`Value`]s.
pub fn array_to_values(items: &Array) -> Vec<Value> {
    items.iter().map(to_value).collect()
}

/// `#{x, y}` for a point.
pub fn point(x: i64, y: i64) -> Dynamic {
    let mut map = BTreeMap::new();
    map.insert("x".to_string(), Value::Int(x));
    map.insert("y".to_string(), Value::Int(y));
    to_dynamic(Value::Map(map))
}
