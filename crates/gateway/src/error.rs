//! Gateway error types.

use bus_client::BusError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol error surfaced to clients and embedded in composite
/// responses. Serializes to the wire shape `{code, message, data?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{code}: {message}")]
pub struct ResError {
    /// Dot-separated error code (e.g. `system.accessDenied`).
    pub code: String,
    /// Human readable message.
    pub message: String,
    /// Optional additional error data.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<serde_json::Value>,
}

impl ResError {
    /// Create an error with the given code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }

    /// `system.accessDenied`
    pub fn access_denied() -> Self {
        Self::new("system.accessDenied", "Access denied")
    }

    /// `system.timeout`
    pub fn timeout() -> Self {
        Self::new("system.timeout", "Request timeout")
    }

    /// `system.notFound`
    pub fn not_found() -> Self {
        Self::new("system.notFound", "Not found")
    }

    /// `system.invalidParams`
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new("system.invalidParams", message)
    }

    /// `system.invalidRequest`
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new("system.invalidRequest", message)
    }

    /// `system.internalError`
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new("system.internalError", message)
    }

    /// `system.connectionError`
    pub fn connection_error(message: impl Into<String>) -> Self {
        Self::new("system.connectionError", message)
    }

    /// `system.noSubscription`
    pub fn no_subscription() -> Self {
        Self::new("system.noSubscription", "No subscription")
    }

    /// Serialize to a JSON value.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| {
            serde_json::json!({"code": "system.internalError", "message": "Internal error"})
        })
    }
}

impl From<BusError> for ResError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Timeout => ResError::timeout(),
            BusError::NoResponders => ResError::not_found(),
            BusError::Closed | BusError::Connect(_) => {
                ResError::connection_error("Connection error")
            }
            BusError::Subscribe(msg) | BusError::Request(msg) => ResError::internal_error(msg),
        }
    }
}

impl From<GatewayError> for ResError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Bus(e) => ResError::from(e),
            other => ResError::internal_error(other.to_string()),
        }
    }
}

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Bus error.
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Channel send error.
    #[error("channel send error")]
    ChannelSend,
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
