//! Values carried across the RPC boundary.
//!
//! A closed tagged union: every value knows its concrete type tag, and the
//! tag travels next to the JSON encoding so the receiver decodes into the
//! same kind (an `int` stays an `int`, a `float` of `2.0` stays a `float`).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde_json::{Map as JsonMap, Number, Value as Json};

use super::RpcError;

/// Concrete type tag of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TypeTag {
    Unit,
    Bool,
    Int,
    Float,
    Str,
    List,
    Map,
}

impl TypeTag {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Unit => "unit",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::Str => "string",
            Self::List => "list",
            Self::Map => "map",
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TypeTag {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "unit" => Self::Unit,
            "bool" => Self::Bool,
            "int" => Self::Int,
            "float" => Self::Float,
            "string" => Self::Str,
            "list" => Self::List,
            "map" => Self::Map,
            other => return Err(RpcError::UnknownType(other.to_string())),
        })
    }
}

/// A value of one of the supported kinds.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub const fn tag(&self) -> TypeTag {
        match self {
            Self::Unit => TypeTag::Unit,
            Self::Bool(_) => TypeTag::Bool,
            Self::Int(_) => TypeTag::Int,
            Self::Float(_) => TypeTag::Float,
            Self::Str(_) => TypeTag::Str,
            Self::List(_) => TypeTag::List,
            Self::Map(_) => TypeTag::Map,
        }
    }

    pub const fn is_unit(&self) -> bool {
        matches!(self, Self::Unit)
    }

    /// JSON form. Non-finite floats become `null`.
    pub fn to_json(&self) -> Json {
        match self {
            Self::Unit => Json::Null,
            Self::Bool(b) => Json::Bool(*b),
            Self::Int(i) => Json::from(*i),
            Self::Float(f) => Number::from_f64(*f).map_or(Json::Null, Json::Number),
            Self::Str(s) => Json::String(s.clone()),
            Self::List(items) => Json::Array(items.iter().map(Self::to_json).collect()),
            Self::Map(map) => Json::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect::<JsonMap<_, _>>(),
            ),
        }
    }

    /// Untagged conversion from JSON: integers that fit in `i64` become
    /// `Int`, other numbers `Float`.
    pub fn from_json(json: Json) -> Self {
        match json {
            Json::Null => Self::Unit,
            Json::Bool(b) => Self::Bool(b),
            Json::Number(n) => n
                .as_i64()
                .map_or_else(|| Self::Float(n.as_f64().unwrap_or(f64::NAN)), Self::Int),
            Json::String(s) => Self::Str(s),
            Json::Array(items) => Self::List(items.into_iter().map(Self::from_json).collect()),
            Json::Object(map) => Self::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Encoded text sent on the wire.
    pub fn encode(&self) -> String {
        self.to_json().to_string()
    }

    /// Decode `data` as a value of kind `tag`.
    pub fn decode(tag: TypeTag, data: &str) -> Result<Self, RpcError> {
        let json: Json = serde_json::from_str(data).map_err(|e| RpcError::Decode(e.to_string()))?;
        Self::from_tagged_json(tag, json)
    }

    fn from_tagged_json(tag: TypeTag, json: Json) -> Result<Self, RpcError> {
        let mismatch = |json: &Json| RpcError::TypeMismatch {
            expected: tag,
            found: json.to_string(),
        };
        match (tag, json) {
            (TypeTag::Unit, Json::Null) => Ok(Self::Unit),
            (TypeTag::Bool, Json::Bool(b)) => Ok(Self::Bool(b)),
            (TypeTag::Int, Json::Number(n)) => n.as_i64().map(Self::Int).ok_or_else(|| mismatch(&Json::Number(n))),
            (TypeTag::Float, Json::Number(n)) => n.as_f64().map(Self::Float).ok_or_else(|| mismatch(&Json::Number(n))),
            (TypeTag::Float, Json::Null) => Ok(Self::Float(f64::NAN)),
            (TypeTag::Str, Json::String(s)) => Ok(Self::Str(s)),
            (TypeTag::List, json @ Json::Array(_)) | (TypeTag::Map, json @ Json::Object(_)) => {
                Ok(Self::from_json(json))
            }
            (_, other) => Err(mismatch(&other)),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => f.write_str(s),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

/// Conversion from a decoded argument into a handler parameter.
pub trait FromValue: Sized {
    const TAG: TypeTag;

    fn from_value(value: Value) -> Result<Self, RpcError>;
}

/// Conversion from a handler return value into a wire value.
pub trait IntoValue {
    fn into_value(self) -> Value;
}

macro_rules! value_kind {
    ($ty:ty, $tag:ident, $variant:ident) => {
        impl FromValue for $ty {
            const TAG: TypeTag = TypeTag::$tag;

            fn from_value(value: Value) -> Result<Self, RpcError> {
                match value {
                    Value::$variant(v) => Ok(v),
                    other => Err(RpcError::TypeMismatch {
                        expected: TypeTag::$tag,
                        found: other.encode(),
                    }),
                }
            }
        }

        impl IntoValue for $ty {
            fn into_value(self) -> Value {
                Value::$variant(self)
            }
        }

        impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::$variant(v)
            }
        }
    };
}

value_kind!(bool, Bool, Bool);
value_kind!(i64, Int, Int);
value_kind!(f64, Float, Float);
value_kind!(String, Str, Str);
value_kind!(Vec<Value>, List, List);
value_kind!(BTreeMap<String, Value>, Map, Map);

impl FromValue for () {
    const TAG: TypeTag = TypeTag::Unit;

    fn from_value(value: Value) -> Result<Self, RpcError> {
        match value {
            Value::Unit => Ok(()),
            other => Err(RpcError::TypeMismatch {
                expected: TypeTag::Unit,
                found: other.encode(),
            }),
        }
    }
}

impl IntoValue for () {
    fn into_value(self) -> Value {
        Value::Unit
    }
}

impl IntoValue for Value {
    fn into_value(self) -> Value {
        self
    }
}

impl<T: IntoValue> IntoValue for Option<T> {
    fn into_value(self) -> Value {
        self.map_or(Value::Unit, IntoValue::into_value)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<()> for Value {
    fn from((): ()) -> Self {
        Self::Unit
    }
}
