//! JSON-RPC 2.0 envelopes as they appear on the wire.
//!
//! Only the subset this client speaks is modeled:
//!
//! ```text
//! call:          {"jsonrpc":"2.0","id":"<string>","method":"<name>","params":<payload>}
//! notification:  {"jsonrpc":"2.0","method":"<name>","params":<payload>}
//! response:      {"jsonrpc":"2.0","id":"<string>","result":<payload-or-null>}
//! ```
//!
//! There is no `error` object. A server error response decodes as a response
//! without a result.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol tag carried by every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// Outgoing request envelope (call or notification).
///
/// `id` is present iff the request is a call. For notifications the key is
/// omitted from the serialized form entirely, never written as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request<P> {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub method: String,
    pub params: P,
}

impl<P> Request<P> {
    /// Build a call envelope with the given id.
    pub fn call(id: impl Into<String>, method: impl Into<String>, params: P) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id.into()),
            method: method.into(),
            params,
        }
    }

    /// Build a notification envelope (no id).
    pub fn notification(method: impl Into<String>, params: P) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.into(),
            params,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// Inbound reply to a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response<R> {
    pub jsonrpc: String,
    pub id: String,
    /// Absent and `null` both decode to `None`.
    pub result: Option<R>,
}

/// Inbound server-pushed notification.
///
/// An `id` on the frame, if any, is ignored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Notification<P> {
    pub jsonrpc: String,
    pub method: String,
    pub params: P,
}

/// An inbound text frame parsed once into a JSON tree, with its routing keys.
///
/// The `id` and `method` are pulled out up front so dispatch can do a single
/// keyed lookup before any typed decode is attempted. Ids that are not strings
/// are treated as absent since this client only ever issues string ids.
#[derive(Debug, Clone)]
pub struct Frame {
    value: Value,
    id: Option<String>,
    method: Option<String>,
}

impl Frame {
    /// Parse a raw text frame.
    ///
    /// # Errors
    ///
    /// Returns the JSON error if the text is not a JSON document.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(text)?;
        let id = value.get("id").and_then(Value::as_str).map(str::to_string);
        let method = value
            .get("method")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(Self { value, id, method })
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    /// The full JSON tree, for typed decoding.
    pub fn value(&self) -> &Value {
        &self.value
    }
}
