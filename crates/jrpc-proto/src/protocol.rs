//! JSON-RPC 1.0/2.0 envelope types.
//!
//! Requests carry positional parameters only. Responses always serialize all
//! three members (`result`, `error`, `id`) with exactly one of `result` and
//! `error` populated, matching what Bitcoin-style node clients expect.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{Error, ErrorKind};

pub const JSONRPC_V1: &str = "1.0";
pub const JSONRPC_V2: &str = "2.0";
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

/// Raw JSON-RPC request as read off the wire.
///
/// A missing `jsonrpc` member decodes as the empty string and a missing or
/// `null` id decodes as `None`; both matter for notification detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub jsonrpc: String,
    #[serde(default)]
    pub method: String,
    #[serde(default, deserialize_with = "deserialize_params")]
    pub params: Vec<Value>,
    #[serde(default)]
    pub id: Option<Value>,
}

fn deserialize_params<'de, D>(deserializer: D) -> Result<Vec<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default())
}

impl Request {
    #[must_use]
    pub fn new(method: impl Into<String>, params: Vec<Value>, id: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_V1.to_string(),
            method: method.into(),
            params,
            id: Some(id),
        }
    }

    /// Build a server-initiated notification (`"id": null`).
    #[must_use]
    pub fn notification(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_V1.to_string(),
            method: method.into(),
            params,
            id: None,
        }
    }

    /// Parse a request envelope from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns a `ParseError` if the bytes are not a JSON object of the
    /// request shape.
    pub fn parse(bytes: &[u8]) -> crate::error::Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::new(ErrorKind::ParseError, e.to_string()))
    }

    /// Whether this request must not be answered.
    ///
    /// Any request without an id is treated as a notification unless RPC
    /// quirks are enabled and the request does not declare a protocol version,
    /// in which case it is answered with `"id": null` like Bitcoin Core does.
    #[must_use]
    pub fn is_notification(&self, rpc_quirks: bool) -> bool {
        self.id.is_none() && !(rpc_quirks && self.jsonrpc.is_empty())
    }
}

/// JSON-RPC response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Option<RpcError>,
    #[serde(default)]
    pub id: Option<Value>,
}

impl Response {
    #[must_use]
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            result,
            error: None,
            id,
        }
    }

    #[must_use]
    pub fn error(id: Option<Value>, error: RpcError) -> Self {
        Self {
            result: Value::Null,
            error: Some(error),
            id,
        }
    }

    #[must_use]
    pub fn from_result(id: Option<Value>, result: Result<Value, RpcError>) -> Self {
        match result {
            Ok(value) => Self::success(id, value),
            Err(err) => Self::error(id, err),
        }
    }

    /// Serialize this response to bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the result value cannot be serialized.
    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Marshal a reply for the given request id and handler outcome.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn marshal_response(
    id: Option<Value>,
    result: Result<Value, RpcError>,
) -> Result<Vec<u8>, serde_json::Error> {
    Response::from_result(id, result).to_vec()
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcError {
    #[must_use]
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn parse_error(detail: impl std::fmt::Display) -> Self {
        Self::new(PARSE_ERROR, format!("Failed to parse request: {detail}"))
    }

    #[must_use]
    pub fn invalid_request() -> Self {
        Self::new(INVALID_REQUEST, "Invalid Request")
    }

    #[must_use]
    pub fn method_not_found() -> Self {
        Self::new(METHOD_NOT_FOUND, "Method not found")
    }

    #[must_use]
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }

    /// Build an internal error. These should not happen, so they are logged.
    #[must_use]
    pub fn internal_error(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!("Internal RPC error: {}", message);
        Self::new(INTERNAL_ERROR, message)
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RPC error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}
