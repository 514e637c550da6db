//! RPC wire records: one `CallDescriptor` line in, one `CallResult` line out.

use serde::{Deserialize, Serialize};

use super::value::{TypeTag, Value};
use super::RpcError;

/// One argument: its type tag name and its JSON encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallArg {
    #[serde(rename = "type")]
    pub type_name: String,
    pub data: String,
}

/// A method invocation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallDescriptor {
    pub method: String,
    #[serde(default)]
    pub args: Vec<CallArg>,
}

impl CallDescriptor {
    /// Build a descriptor tagging every argument with its runtime type.
    pub fn new(method: impl Into<String>, args: &[Value]) -> Self {
        Self {
            method: method.into(),
            args: args
                .iter()
                .map(|v| CallArg {
                    type_name: v.tag().name().to_string(),
                    data: v.encode(),
                })
                .collect(),
        }
    }

    /// Declared parameter type list, in order.
    pub fn signature(&self) -> Result<Vec<TypeTag>, RpcError> {
        self.args.iter().map(|a| a.type_name.parse()).collect()
    }

    /// Decode the arguments against the declared tags.
    pub fn decode_args(&self) -> Result<Vec<Value>, RpcError> {
        self.args
            .iter()
            .map(|a| Value::decode(a.type_name.parse()?, &a.data))
            .collect()
    }
}

/// A method invocation result. Both fields absent means void.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallResult {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl CallResult {
    /// Tag a return value with its concrete runtime type.
    pub fn from_value(value: &Value) -> Self {
        if value.is_unit() {
            return Self::default();
        }
        Self {
            type_name: Some(value.tag().name().to_string()),
            data: Some(value.encode()),
        }
    }

    /// Decode using the carried type; void results become `Value::Unit`.
    pub fn into_value(self) -> Result<Value, RpcError> {
        match (self.type_name, self.data) {
            (Some(type_name), Some(data)) => Value::decode(type_name.parse()?, &data),
            _ => Ok(Value::Unit),
        }
    }
}
