use serde::{Deserialize, Serialize};
use std::fmt;

/// A decoded, optionally scaled tag value.
///
/// Serialized untagged, so on the wire it is a plain JSON bool, number or
/// string. Deserializing sniffs the JSON kind: integers land in the
/// narrowest integer variant that holds them, other numbers become floats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DecodedValue {
    Bool(bool),
    Int16(i16),
    Int32(i32),
    Float32(f32),
    Str(String),
}

impl DecodedValue {
    /// Numeric view used by scaling, alarm fallback and write coercion.
    ///
    /// Strings are parsed after trimming; anything unparsable is `None`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DecodedValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            DecodedValue::Int16(v) => Some(f64::from(*v)),
            DecodedValue::Int32(v) => Some(f64::from(*v)),
            DecodedValue::Float32(v) => Some(f64::from(*v)),
            DecodedValue::Str(s) => s.trim().parse::<f64>().ok(),
        }
    }

    /// Raw bit pattern of integer values; `None` for every other kind.
    pub fn as_bit_word(&self) -> Option<u32> {
        match self {
            DecodedValue::Int16(v) => Some(u32::from(*v as u16)),
            DecodedValue::Int32(v) => Some(*v as u32),
            _ => None,
        }
    }

    /// Truthiness for bit writes and "non-zero" alarm conditions.
    pub fn is_truthy(&self) -> bool {
        match self {
            DecodedValue::Bool(b) => *b,
            DecodedValue::Str(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "on" => true,
                other => other.parse::<f64>().map(|v| v != 0.0).unwrap_or(false),
            },
            other => other.as_f64().is_some_and(|v| v != 0.0),
        }
    }

    /// Build a value from a JSON scalar. Arrays, objects and null are rejected.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Null
            | serde_json::Value::Array(_)
            | serde_json::Value::Object(_) => None,
            other => serde_json::from_value(other.clone()).ok(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl fmt::Display for DecodedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodedValue::Bool(v) => write!(f, "{v}"),
            DecodedValue::Int16(v) => write!(f, "{v}"),
            DecodedValue::Int32(v) => write!(f, "{v}"),
            DecodedValue::Float32(v) => write!(f, "{v}"),
            DecodedValue::Str(v) => write!(f, "{v:?}"),
        }
    }
}

impl From<bool> for DecodedValue {
    fn from(v: bool) -> Self {
        DecodedValue::Bool(v)
    }
}

impl From<i16> for DecodedValue {
    fn from(v: i16) -> Self {
        DecodedValue::Int16(v)
    }
}

impl From<i32> for DecodedValue {
    fn from(v: i32) -> Self {
        DecodedValue::Int32(v)
    }
}

impl From<f32> for DecodedValue {
    fn from(v: f32) -> Self {
        DecodedValue::Float32(v)
    }
}

impl From<&str> for DecodedValue {
    fn from(v: &str) -> Self {
        DecodedValue::Str(v.to_string())
    }
}
