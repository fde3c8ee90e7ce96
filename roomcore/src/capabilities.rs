//! Shared capability descriptor delivered on room join.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("no capability descriptor in join confirmation")]
    Missing,
    #[error("capability descriptor must be a non-empty object, got {0}")]
    NotAnObject(String),
    #[error("capability field `codecs` must be an array")]
    InvalidCodecs,
}

/// The session's negotiated codec/extension set.
///
/// The content is opaque to the client; it is validated for shape only and
/// handed to the media engine as-is. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct CapabilityDescriptor(Value);

impl CapabilityDescriptor {
    pub fn parse(value: Option<&Value>) -> Result<Self, CapabilityError> {
        let value = match value {
            None | Some(Value::Null) => return Err(CapabilityError::Missing),
            Some(v) => v,
        };
        let map = match value {
            Value::Object(map) if !map.is_empty() => map,
            other => return Err(CapabilityError::NotAnObject(type_name(other).to_string())),
        };
        if let Some(codecs) = map.get("codecs") {
            if !codecs.is_array() {
                return Err(CapabilityError::InvalidCodecs);
            }
        }
        Ok(Self(value.clone()))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Codec names advertised by the descriptor, for logging and diagnostics.
    ///
    /// Reads `codecs[].mimeType` when present and falls back to a
    /// top-level `codec` string.
    pub fn codec_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .0
            .get("codecs")
            .and_then(Value::as_array)
            .map(|codecs| {
                codecs
                    .iter()
                    .filter_map(|c| c.get("mimeType").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if let Some(codec) = self.0.get("codec").and_then(Value::as_str) {
            names.push(codec.to_string());
        }
        names
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "empty object",
    }
}
