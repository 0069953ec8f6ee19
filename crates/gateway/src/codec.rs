//! Bus wire codec.
//!
//! Encodes the request payloads sent to services and decodes their
//! response envelopes (`{"result": ...}` or `{"error": {...}}`), plus
//! the `system.reset` event payload.

use crate::error::ResError;
use crate::pattern::is_valid_rid;
use crate::value::{Resource, Value};
use bytes::Bytes;
use serde::Deserialize;
use std::collections::HashMap;

/// Access check result: `get` gates subscriptions and traversals,
/// `call` grants methods (`*` or a comma-separated list).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AccessResult {
    /// Read access.
    #[serde(default)]
    pub get: bool,
    /// Call access: `"*"`, a comma-separated method list, or absent.
    #[serde(default)]
    pub call: Option<String>,
}

impl AccessResult {
    /// Whether the given method may be called.
    pub fn can_call(&self, method: &str) -> bool {
        match self.call.as_deref() {
            Some("*") => true,
            Some(list) => list.split(',').any(|m| m.trim() == method),
            None => false,
        }
    }
}

/// Decoded `system.reset` payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SystemReset {
    /// Patterns whose resources must be refetched.
    #[serde(default)]
    pub resources: Vec<String>,
    /// Patterns whose access must be re-evaluated.
    #[serde(default)]
    pub access: Vec<String>,
}

/// Encode a service request payload `{cid, token, query?, params?}`.
pub fn request_payload(
    cid: &str,
    token: Option<&serde_json::Value>,
    query: &str,
    params: Option<&serde_json::Value>,
) -> Bytes {
    let mut obj = serde_json::Map::new();
    obj.insert("cid".to_string(), serde_json::Value::String(cid.to_string()));
    obj.insert(
        "token".to_string(),
        token.cloned().unwrap_or(serde_json::Value::Null),
    );
    if !query.is_empty() {
        obj.insert(
            "query".to_string(),
            serde_json::Value::String(query.to_string()),
        );
    }
    if let Some(p) = params {
        obj.insert("params".to_string(), p.clone());
    }
    Bytes::from(serde_json::Value::Object(obj).to_string())
}

/// Encode a `get.<rid>` request payload. Empty unless the resource
/// carries a query.
pub fn get_payload(query: &str) -> Bytes {
    if query.is_empty() {
        Bytes::new()
    } else {
        Bytes::from(serde_json::json!({ "query": query }).to_string())
    }
}

/// Decode a response envelope into its result value.
pub fn decode_response(data: &[u8]) -> Result<serde_json::Value, ResError> {
    let v: serde_json::Value = serde_json::from_slice(data)
        .map_err(|e| ResError::internal_error(format!("Malformed response: {}", e)))?;

    if let Some(err) = v.get("error") {
        let err: ResError = serde_json::from_value(err.clone())
            .map_err(|e| ResError::internal_error(format!("Malformed error: {}", e)))?;
        return Err(err);
    }

    Ok(v.get("result").cloned().unwrap_or(serde_json::Value::Null))
}

/// Decode a `get.<rid>` result into a resource snapshot.
pub fn decode_get(result: serde_json::Value) -> Result<Resource, ResError> {
    if let Some(serde_json::Value::Object(model)) = result.get("model") {
        let m: HashMap<String, Value> = model
            .iter()
            .map(|(k, v)| (k.clone(), Value::from_json(v.clone())))
            .collect();
        return Ok(Resource::Model(m));
    }
    if let Some(serde_json::Value::Array(coll)) = result.get("collection") {
        let c: Vec<Value> = coll.iter().map(|v| Value::from_json(v.clone())).collect();
        return Ok(Resource::Collection(c));
    }
    Err(ResError::internal_error("Get response missing resource"))
}

/// Decode an `access.<rid>` result.
pub fn decode_access(result: serde_json::Value) -> Result<AccessResult, ResError> {
    serde_json::from_value(result)
        .map_err(|e| ResError::internal_error(format!("Malformed access response: {}", e)))
}

/// Decode a `call.<rid>.new` result into the created resource ID.
pub fn decode_new(result: serde_json::Value) -> Result<String, ResError> {
    match result.get("rid").and_then(|v| v.as_str()) {
        Some(rid) if is_valid_rid(rid) => Ok(rid.to_string()),
        _ => Err(ResError::internal_error("New response missing rid")),
    }
}

/// Decode a `system.reset` event payload.
pub fn decode_system_reset(payload: &[u8]) -> Result<SystemReset, serde_json::Error> {
    if payload.is_empty() {
        return Ok(SystemReset::default());
    }
    serde_json::from_slice(payload)
}
