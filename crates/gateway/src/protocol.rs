//! Client WebSocket protocol frames.
//!
//! Requests are JSON objects `{"id", "method", "params"}`; the gateway
//! answers with `{"id", "result"}` or `{"id", "error"}` and pushes
//! resource events as `{"event": "<rid>.<kind>", "data"}`.

use crate::error::ResError;
use serde::{Deserialize, Serialize};

/// Protocol version reported in the `version` handshake.
pub const PROTOCOL_VERSION: &str = "1.2.1";

/// Parsed client request frame.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientRequest {
    /// Request ID, echoed back verbatim in the response.
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    /// Request method, e.g. `subscribe.library.books.42`.
    pub method: String,
    /// Method parameters.
    #[serde(default)]
    pub params: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct ResultFrame<'a> {
    id: &'a Option<serde_json::Value>,
    result: &'a serde_json::Value,
}

#[derive(Serialize)]
struct ErrorFrame<'a> {
    id: &'a Option<serde_json::Value>,
    error: &'a ResError,
}

#[derive(Serialize)]
struct EventFrame<'a> {
    event: &'a str,
    data: &'a serde_json::Value,
}

/// Serialize a successful response frame.
pub fn result_frame(id: &Option<serde_json::Value>, result: &serde_json::Value) -> String {
    serde_json::to_string(&ResultFrame { id, result }).expect("response frame serialization")
}

/// Serialize an error response frame.
pub fn error_frame(id: &Option<serde_json::Value>, error: &ResError) -> String {
    serde_json::to_string(&ErrorFrame { id, error }).expect("error frame serialization")
}

/// Serialize an event frame for `<rid>.<kind>`.
pub fn event_frame(rid: &str, kind: &str, data: &serde_json::Value) -> String {
    let event = format!("{}.{}", rid, kind);
    serde_json::to_string(&EventFrame {
        event: &event,
        data,
    })
    .expect("event frame serialization")
}

/// Validate a `version` handshake protocol string (`M.m.p`).
pub fn is_valid_protocol(protocol: &str) -> bool {
    let parts: Vec<&str> = protocol.split('.').collect();
    parts.len() == 3 && parts.iter().all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
}
