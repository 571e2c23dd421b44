// File: src/value.rs
//
// Runtime value type for the Spool dialogue runtime.
// Variables, stack elements, and line substitutions are all Values.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A tagged runtime value.
///
/// Numbers are 32-bit floats to match the operand encoding of compiled
/// programs. Serialized form is a self-describing document, e.g.
/// `{"type": "float", "value": 2.5}`, so save files remain readable.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "ValueRepr", into = "ValueRepr")]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f32),
    String(String),
}

impl Value {
    /// Truthiness used by conditional jumps: null, false, and zero are
    /// falsy; any string is truthy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0,
            Value::String(_) => true,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
        }
    }

    pub fn as_number(&self) -> Option<f32> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f32> for Value {
    fn from(n: f32) -> Self {
        Value::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

/// Wire shape for Value: `{"type": ..., "value": ...}`.
/// The "float" tag matches the operand naming of the compiled format.
#[derive(Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
enum ValueRepr {
    Null,
    Bool(bool),
    Float(f32),
    String(String),
}

impl From<ValueRepr> for Value {
    fn from(repr: ValueRepr) -> Self {
        match repr {
            ValueRepr::Null => Value::Null,
            ValueRepr::Bool(b) => Value::Bool(b),
            ValueRepr::Float(n) => Value::Number(n),
            ValueRepr::String(s) => Value::String(s),
        }
    }
}

impl From<Value> for ValueRepr {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => ValueRepr::Null,
            Value::Bool(b) => ValueRepr::Bool(b),
            Value::Number(n) => ValueRepr::Float(n),
            Value::String(s) => ValueRepr::String(s),
        }
    }
}
