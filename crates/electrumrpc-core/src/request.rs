//! JSON-RPC 2.0 wire types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CodingError;

/// JSON-RPC correlation id, string or number.
///
/// Ids minted by this crate are uuid-v4 strings; numeric ids are accepted
/// because some servers echo them back that way.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    Number(u64),
    String(String),
}

impl RpcId {
    /// A fresh id, unique for the lifetime of the process.
    pub fn random() -> Self {
        Self::String(uuid::Uuid::new_v4().to_string())
    }
}

impl From<&str> for RpcId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for RpcId {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<u64> for RpcId {
    fn from(n: u64) -> Self {
        Self::Number(n)
    }
}

impl std::fmt::Display for RpcId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

/// An outbound JSON-RPC 2.0 call envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: RpcId,
    pub method: String,
    pub params: Value,
}

impl Request {
    /// Create a request with an explicit id.
    ///
    /// `Value::Null` params are sent as an empty array.
    pub fn new(id: impl Into<RpcId>, method: impl Into<String>, params: Value) -> Self {
        let params = match params {
            Value::Null => Value::Array(vec![]),
            other => other,
        };
        Self {
            jsonrpc: "2.0".into(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    /// Create a request with a freshly minted id.
    pub fn with_random_id(method: impl Into<String>, params: Value) -> Self {
        Self::new(RpcId::random(), method, params)
    }

    /// Serialize to the text frame sent over the wire.
    pub fn to_text(&self) -> Result<String, CodingError> {
        serde_json::to_string(self).map_err(|e| CodingError::Encode(e.to_string()))
    }
}

/// A JSON-RPC 2.0 error object as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}
