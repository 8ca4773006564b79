//! TrueNAS Wire Types
//!
//! The middleware speaks DDP (Distributed Data Protocol) over a WebSocket:
//!
//! - [`DdpConnect`] - Initial handshake message
//! - [`MethodRequest`] - Outgoing method calls
//! - [`ServerMessage`] - Any inbound frame (results, pings, collection events)
//! - [`RpcError`] - Error object attached to a failed `result` or `error` frame
//!
//! Call parameters are carried by [`Params`], which keeps the positional or
//! keyed shape chosen by the caller.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Parameters of a single method call.
#[derive(Debug, Clone, PartialEq)]
pub enum Params {
    /// Ordered arguments, e.g. `[id, {"name": "tank"}]`.
    Positional(Vec<Value>),
    /// A single keyed argument object.
    Keyed(Map<String, Value>),
}

impl Params {
    pub fn none() -> Self {
        Params::Positional(Vec::new())
    }

    /// Argument list as sent in the DDP `params` field.
    ///
    /// DDP always carries a list, so a keyed object travels as the only
    /// element of that list.
    pub fn into_wire(self) -> Vec<Value> {
        match self {
            Params::Positional(args) => args,
            Params::Keyed(map) => vec![Value::Object(map)],
        }
    }
}

impl Default for Params {
    fn default() -> Self {
        Params::none()
    }
}

impl From<Value> for Params {
    fn from(value: Value) -> Self {
        match value {
            Value::Array(args) => Params::Positional(args),
            Value::Object(map) => Params::Keyed(map),
            Value::Null => Params::none(),
            scalar => Params::Positional(vec![scalar]),
        }
    }
}

impl From<Vec<Value>> for Params {
    fn from(args: Vec<Value>) -> Self {
        Params::Positional(args)
    }
}

impl From<Map<String, Value>> for Params {
    fn from(map: Map<String, Value>) -> Self {
        Params::Keyed(map)
    }
}

/// DDP Connect message
#[derive(Debug, Serialize)]
pub struct DdpConnect {
    pub msg: String,
    pub version: String,
    pub support: Vec<String>,
}

impl Default for DdpConnect {
    fn default() -> Self {
        Self {
            msg: "connect".to_string(),
            version: "1".to_string(),
            support: vec!["1".to_string()],
        }
    }
}

/// DDP method call
#[derive(Debug, Serialize)]
pub struct MethodRequest {
    pub id: String,
    pub msg: String,
    pub method: String,
    pub params: Vec<Value>,
}

impl MethodRequest {
    pub fn new(id: String, method: &str, params: Params) -> Self {
        Self {
            id,
            msg: "method".to_string(),
            method: method.to_string(),
            params: params.into_wire(),
        }
    }
}

/// DDP pong, sent in reply to a server ping
#[derive(Debug, Serialize)]
pub struct DdpPong {
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl DdpPong {
    pub fn reply_to(id: Option<String>) -> Self {
        Self {
            msg: "pong".to_string(),
            id,
        }
    }
}

/// Any frame the middleware sends us.
#[derive(Debug, Deserialize)]
pub struct ServerMessage {
    pub msg: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    /// Usually an [`RpcError`] object, but kept raw since older middleware
    /// and proxies also send plain strings.
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub session: Option<String>,
}

impl ServerMessage {
    /// Normalized text of the frame's error, if it carries one.
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(RpcError::describe)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RpcError {
    #[serde(default)]
    pub error: Option<i64>,
    #[serde(default)]
    pub errname: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub extra: Option<Value>,
}

impl RpcError {
    /// Human-readable form of the error.
    ///
    /// `reason` already carries the `[CODE]` prefix. Validation failures
    /// sometimes leave it empty and put `[field, message, code]` triples in
    /// `extra` instead.
    pub fn message(&self) -> String {
        if let Some(reason) = self.reason.as_deref().filter(|r| !r.is_empty()) {
            return reason.to_string();
        }

        if let Some(Value::Array(entries)) = &self.extra {
            if let Some(Value::Array(entry)) = entries.first() {
                if let (Some(field), Some(message)) = (entry.first(), entry.get(1)) {
                    return format!("{}: {}", display_value(field), display_value(message));
                }
            }
        }

        serde_json::to_string(self).unwrap_or_else(|_| "unknown middleware error".to_string())
    }

    /// Text of an arbitrary `error` value: the [`message`](Self::message) of
    /// an error object, a string as-is, anything else as JSON.
    pub fn describe(error: &Value) -> String {
        match error {
            Value::String(text) => text.clone(),
            Value::Object(_) => match RpcError::deserialize(error) {
                Ok(rpc) => rpc.message(),
                Err(_) => error.to_string(),
            },
            other => other.to_string(),
        }
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
