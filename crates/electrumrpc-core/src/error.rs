//! Error taxonomy shared by every electrumrpc component.
//!
//! All error types are `Clone`: a single connection loss has to be delivered
//! to every pending waiter.

use std::time::Duration;

use thiserror::Error;

use crate::request::RpcId;
use crate::transport::CloseCode;

/// Failures of the underlying connection.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    /// Dial or handshake did not complete.
    #[error("connection setup failed: {0}")]
    SetupFailed(String),

    /// The connection was closed, locally or by the peer.
    #[error("connection closed ({code}){}", reason_suffix(.reason))]
    ConnectionClosed {
        code: CloseCode,
        reason: Option<String>,
    },

    /// `send` was called while the transport is not connected.
    #[error("transport is not connected")]
    NotConnected,

    /// Read/write failure on an established connection.
    #[error("I/O error: {0}")]
    Io(String),
}

fn reason_suffix(reason: &Option<String>) -> String {
    match reason {
        Some(r) => format!(": {r}"),
        None => String::new(),
    }
}

/// Failures raised by the client-side call machinery.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClientError {
    #[error("call cancelled")]
    Cancelled,

    #[error("call timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// A waiter for this id or method path is already registered.
    #[error("duplicate handler for {0}")]
    DuplicateHandler(String),

    /// The method was invoked through the wrong call path, e.g. a
    /// subscription method through the unary path.
    #[error("protocol mismatch: {method} cannot be called this way")]
    ProtocolMismatch { method: String },

    /// The server replied with a null or missing result where a value was required.
    #[error("empty response for request {0}")]
    EmptyResponse(RpcId),
}

/// An error object returned by the server, tagged with the call it answers.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("RPC error {code} for {method} (id {id}): {message}")]
pub struct RpcError {
    pub id: RpcId,
    pub method: String,
    pub code: i64,
    pub message: String,
}

/// Encoding and decoding failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodingError {
    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error for {method}: {message}")]
    Decode { method: String, message: String },

    /// The frame or payload does not have any of the expected shapes.
    #[error("unexpected format{}: {payload}", method_suffix(.method))]
    UnexpectedFormat {
        method: Option<String>,
        payload: String,
    },
}

fn method_suffix(method: &Option<String>) -> String {
    match method {
        Some(m) => format!(" for {m}"),
        None => String::new(),
    }
}

/// Lookup failures in the result store.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StorageError {
    #[error("request {0} not found")]
    RequestNotFound(RpcId),

    #[error("request {0} already exists")]
    RequestAlreadyExists(RpcId),

    #[error("result for request {0} not found")]
    ResultNotFound(RpcId),

    #[error("result for request {0} already exists")]
    ResultAlreadyExists(RpcId),

    #[error("no notification recorded for {0}")]
    NotificationNotFound(String),

    #[error("unknown method path: {0}")]
    UnknownMethodPath(String),
}

/// Every public operation fails with exactly one of these.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Coding(#[from] CodingError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl Error {
    /// Returns `true` if the same call may succeed when issued again
    /// (connection loss, timeout).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(
                TransportError::ConnectionClosed { .. }
                    | TransportError::NotConnected
                    | TransportError::Io(_)
            ) | Self::Client(ClientError::Timeout(_))
        )
    }

    /// Returns `true` if the server rejected the call.
    pub fn is_rpc_error(&self) -> bool {
        matches!(self, Self::Rpc(_))
    }
}

/// Maximum number of payload characters kept in an error for diagnosis.
pub(crate) const PAYLOAD_SNIPPET_LEN: usize = 256;

/// Truncate a payload so errors stay loggable.
pub(crate) fn snippet(payload: &str) -> String {
    if payload.chars().count() <= PAYLOAD_SNIPPET_LEN {
        return payload.to_string();
    }
    let mut out: String = payload.chars().take(PAYLOAD_SNIPPET_LEN).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_closed_display_includes_reason() {
        let err = TransportError::ConnectionClosed {
            code: CloseCode::GoingAway,
            reason: Some("test".into()),
        };
        assert_eq!(err.to_string(), "connection closed (1001 going away): test");
    }

    #[test]
    fn retryable_classification() {
        assert!(Error::from(ClientError::Timeout(Duration::from_secs(1))).is_retryable());
        assert!(Error::from(TransportError::NotConnected).is_retryable());
        assert!(!Error::from(ClientError::Cancelled).is_retryable());
        assert!(!Error::from(StorageError::UnknownMethodPath("x".into())).is_retryable());
    }

    #[test]
    fn snippet_truncates_long_payloads() {
        let long = "a".repeat(1_000);
        let s = snippet(&long);
        assert_eq!(s.chars().count(), PAYLOAD_SNIPPET_LEN + 1);
        assert_eq!(snippet("short"), "short");
    }
}
