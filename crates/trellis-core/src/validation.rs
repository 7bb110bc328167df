//! Parameter validation primitives.
//!
//! Validation is a pre-dispatch step: the dispatcher checks request args
//! against declared [`ParameterMetadata`](crate::types::ParameterMetadata)
//! before the handler ever runs, and surfaces failures as a structured
//! `validation_error` detail rather than an opaque string.

use serde::Deserialize;
use serde::Serialize;

use crate::types::ParamType;

/// Wire identifier for structured validation failures.
pub const VALIDATION_ERROR_TYPE: &str = "validation_error";

/// Runtime kind of a JSON argument value.
///
/// `Integer` and `Float` never come out of [`infer_kind`] (JSON numbers
/// are just numbers) but other SDK implementations report them, so the
/// compatibility check accepts both as aliases of `number`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Null,
    Boolean,
    Number,
    Integer,
    Float,
    String,
    Array,
    Object,
    /// A required parameter that was absent from the args map.
    Missing,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Boolean => "boolean",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::String => "string",
            Self::Array => "array",
            Self::Object => "object",
            Self::Missing => "missing",
        }
    }

    /// Parse a kind reported by a remote peer.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "null" => Some(Self::Null),
            "boolean" => Some(Self::Boolean),
            "number" => Some(Self::Number),
            "integer" => Some(Self::Integer),
            "float" => Some(Self::Float),
            "string" => Some(Self::String),
            "array" => Some(Self::Array),
            "object" => Some(Self::Object),
            "missing" => Some(Self::Missing),
            _ => None,
        }
    }
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Infer the runtime kind of a JSON value.
pub fn infer_kind(value: &serde_json::Value) -> ValueKind {
    match value {
        serde_json::Value::Null => ValueKind::Null,
        serde_json::Value::Bool(_) => ValueKind::Boolean,
        serde_json::Value::Number(_) => ValueKind::Number,
        serde_json::Value::String(_) => ValueKind::String,
        serde_json::Value::Array(_) => ValueKind::Array,
        serde_json::Value::Object(_) => ValueKind::Object,
    }
}

/// Check whether a runtime kind satisfies a declared parameter type.
///
/// Compatibility is exact match, plus `number` accepting the `integer`
/// and `float` aliases.
pub fn is_type_compatible(expected: ParamType, actual: ValueKind) -> bool {
    if expected.as_str() == actual.as_str() {
        return true;
    }
    matches!(
        (expected, actual),
        (ParamType::Number, ValueKind::Integer) | (ParamType::Number, ValueKind::Float)
    )
}

/// A parameter validation failure, carried both as a Rust error and as
/// the structured `result` detail of a failed RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationError {
    pub parameter_name: String,
    pub expected_type: String,
    pub actual_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_value: Option<serde_json::Value>,
    pub message: String,
}

impl ValidationError {
    /// Failure for a required parameter that was not supplied.
    pub fn missing(param: &str, expected: ParamType) -> Self {
        Self {
            parameter_name: param.to_string(),
            expected_type: expected.as_str().to_string(),
            actual_type: ValueKind::Missing.as_str().to_string(),
            actual_value: None,
            message: format!("required parameter '{param}' is missing"),
        }
    }

    /// Failure for a parameter whose runtime kind does not satisfy its
    /// declared type.
    pub fn mismatch(param: &str, expected: ParamType, actual: ValueKind, value: &serde_json::Value) -> Self {
        Self {
            parameter_name: param.to_string(),
            expected_type: expected.as_str().to_string(),
            actual_type: actual.as_str().to_string(),
            actual_value: Some(value.clone()),
            message: format!("parameter '{param}': expected type {expected}, got {actual}"),
        }
    }

    /// Generic fallback when the offending parameter cannot be identified.
    pub fn generic(message: impl Into<String>) -> Self {
        Self {
            parameter_name: String::new(),
            expected_type: String::new(),
            actual_type: String::new(),
            actual_value: None,
            message: message.into(),
        }
    }

    /// Structured detail carried in the `result` field of the failed
    /// response, tagged with [`VALIDATION_ERROR_TYPE`].
    pub fn detail(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut detail = serde_json::Map::new();
        detail.insert("type".to_string(), VALIDATION_ERROR_TYPE.into());
        detail.insert("parameter_name".to_string(), self.parameter_name.clone().into());
        detail.insert("expected_type".to_string(), self.expected_type.clone().into());
        detail.insert("actual_type".to_string(), self.actual_type.clone().into());
        if let Some(value) = &self.actual_value {
            detail.insert("actual_value".to_string(), value.clone());
        }
        detail.insert("message".to_string(), self.message.clone().into());
        detail
    }
}

impl std::fmt::Display for ValidationError {
    // The message field is authoritative; Display never reformats it.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ValidationError {}
