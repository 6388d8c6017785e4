//! Payload column codec
//!
//! Arbitrary values are stored as JSON-then-base64 TEXT so the same column
//! shape works across backends and survives copy/dump tooling untouched.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use mainstay_core::ExecutionError;
use serde_json::Value;

pub fn encode(value: &Value) -> Result<String, ExecutionError> {
    let json = serde_json::to_vec(value)?;
    Ok(BASE64.encode(json))
}

pub fn decode(text: &str) -> Result<Value, ExecutionError> {
    let bytes = BASE64
        .decode(text)
        .map_err(|e| ExecutionError::Serialization(format!("invalid payload column: {e}")))?;
    serde_json::from_slice(&bytes).map_err(ExecutionError::from)
}

pub fn encode_opt(value: &Option<Value>) -> Result<Option<String>, ExecutionError> {
    value.as_ref().map(encode).transpose()
}

pub fn decode_opt(text: &Option<String>) -> Result<Option<Value>, ExecutionError> {
    text.as_deref().map(decode).transpose()
}

/// Encode any serializable type through its JSON representation.
pub fn encode_typed<T: serde::Serialize>(value: &T) -> Result<String, ExecutionError> {
    encode(&serde_json::to_value(value)?)
}

pub fn decode_typed<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, ExecutionError> {
    serde_json::from_value(decode(text)?).map_err(ExecutionError::from)
}

/// Raw bytes (workflow source bundles) as base64 TEXT.
pub fn encode_bytes(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

pub fn decode_bytes(text: &str) -> Result<Vec<u8>, ExecutionError> {
    BASE64
        .decode(text)
        .map_err(|e| ExecutionError::Serialization(format!("invalid source column: {e}")))
}
