//! Resource value grammar and snapshot types.
//!
//! Model fields and collection elements are either JSON primitives,
//! resource references (`{"rid": "..."}`), soft references
//! (`{"rid": "...", "soft": true}`), data values (`{"data": ...}`),
//! or the delete sentinel (`{"action": "delete"}`) used in change
//! payloads and old-value maps.

use crate::error::ResError;
use std::collections::HashMap;

/// A single model field or collection element.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// JSON primitive (null, bool, number, or string).
    Primitive(serde_json::Value),
    /// Reference to another resource.
    Ref {
        /// Referenced resource ID.
        rid: String,
        /// Soft references are not followed by the transitive loader.
        soft: bool,
    },
    /// Nested JSON carried opaquely.
    Data(serde_json::Value),
    /// Delete sentinel.
    Delete,
}

impl Value {
    /// Interpret a raw JSON value.
    pub fn from_json(v: serde_json::Value) -> Value {
        if let serde_json::Value::Object(obj) = &v {
            if let Some(serde_json::Value::String(rid)) = obj.get("rid") {
                let soft = matches!(obj.get("soft"), Some(serde_json::Value::Bool(true)));
                return Value::Ref {
                    rid: rid.clone(),
                    soft,
                };
            }
            if matches!(obj.get("action"), Some(serde_json::Value::String(a)) if a == "delete") {
                return Value::Delete;
            }
            if let Some(data) = obj.get("data") {
                return Value::Data(data.clone());
            }
        }
        Value::Primitive(v)
    }

    /// Serialize back to wire JSON.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Primitive(v) => v.clone(),
            Value::Ref { rid, soft } => {
                if *soft {
                    serde_json::json!({"rid": rid, "soft": true})
                } else {
                    serde_json::json!({"rid": rid})
                }
            }
            Value::Data(v) => serde_json::json!({"data": v}),
            Value::Delete => serde_json::json!({"action": "delete"}),
        }
    }

    /// The referenced resource ID, for non-soft references.
    pub fn ref_rid(&self) -> Option<&str> {
        match self {
            Value::Ref { rid, soft: false } => Some(rid),
            _ => None,
        }
    }
}

/// Unordered field map of a model resource.
pub type Model = HashMap<String, Value>;

/// Ordered element list of a collection resource.
pub type Collection = Vec<Value>;

/// A resource snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum Resource {
    /// Model: unordered field → value mapping.
    Model(Model),
    /// Collection: ordered value sequence.
    Collection(Collection),
    /// Terminal error placeholder.
    Error(ResError),
}

impl Resource {
    /// Short type tag, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Resource::Model(_) => "model",
            Resource::Collection(_) => "collection",
            Resource::Error(_) => "error",
        }
    }

    /// Serialize the resource body to wire JSON.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Resource::Model(m) => {
                let map: serde_json::Map<String, serde_json::Value> =
                    m.iter().map(|(k, v)| (k.clone(), v.to_json())).collect();
                serde_json::Value::Object(map)
            }
            Resource::Collection(c) => {
                serde_json::Value::Array(c.iter().map(Value::to_json).collect())
            }
            Resource::Error(e) => e.to_json(),
        }
    }

    /// Collect every non-soft resource reference, one entry per
    /// occurrence.
    pub fn collect_refs(&self) -> Vec<String> {
        let mut refs = Vec::new();
        match self {
            Resource::Model(m) => {
                for v in m.values() {
                    if let Some(rid) = v.ref_rid() {
                        refs.push(rid.to_string());
                    }
                }
            }
            Resource::Collection(c) => {
                for v in c {
                    if let Some(rid) = v.ref_rid() {
                        refs.push(rid.to_string());
                    }
                }
            }
            Resource::Error(_) => {}
        }
        refs
    }
}
