//! Inbound frame classification.
//!
//! The protocol carries replies and push notifications over the same
//! socket; the two are told apart only by which envelope fields are
//! present. Shapes are probed in a fixed order and the first structural
//! match wins:
//!
//! 1. `id`, no `method`, no `error`   → [`ResponseKind::Regular`] / [`ResponseKind::Empty`]
//! 2. `method` + `params`, no `id`    → [`ResponseKind::Subscription`]
//! 3. `id` + `error` object           → [`ResponseKind::Error`]
//! 4. anything else                   → [`CodingError::UnexpectedFormat`]

use serde_json::{Map, Value};

use crate::error::{snippet, CodingError};
use crate::request::{JsonRpcError, RpcId};

/// Whether the caller accepts `null` as a valid result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResultShape {
    /// `null` means the server sent nothing: classified as `Empty`.
    #[default]
    Required,
    /// `null` is a legitimate absent value: classified as `Regular(None)`.
    Optional,
}

/// The shape of one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseKind {
    Regular { id: RpcId, result: Option<Value> },
    Subscription { method: String, params: Value },
    Error { id: RpcId, error: JsonRpcError },
    Empty { id: RpcId },
}

impl ResponseKind {
    /// Correlation id, for every kind except notifications.
    pub fn id(&self) -> Option<&RpcId> {
        match self {
            Self::Regular { id, .. } | Self::Error { id, .. } | Self::Empty { id } => Some(id),
            Self::Subscription { .. } => None,
        }
    }
}

/// Classify `frame`. `shape_of` reports the result shape the caller declared
/// for a given id; it is consulted only for replies whose result is `null`
/// or missing.
pub fn classify<F>(frame: &[u8], shape_of: F) -> Result<ResponseKind, CodingError>
where
    F: FnOnce(&RpcId) -> ResultShape,
{
    let Some(obj) = parse_object(frame) else {
        return Err(unexpected(None, frame));
    };

    let id = match obj.get("id") {
        None | Some(Value::Null) => None,
        Some(raw) => match serde_json::from_value::<RpcId>(raw.clone()) {
            Ok(id) => Some(id),
            Err(_) => return Err(unexpected(method_of(&obj), frame)),
        },
    };
    let has_method = obj.contains_key("method");
    let error = obj.get("error").filter(|e| !e.is_null());

    match (id, has_method, error) {
        (Some(id), false, None) => {
            let result = obj.get("result").filter(|r| !r.is_null()).cloned();
            match (result, shape_of(&id)) {
                (Some(value), _) => Ok(ResponseKind::Regular { id, result: Some(value) }),
                (None, ResultShape::Optional) => Ok(ResponseKind::Regular { id, result: None }),
                (None, ResultShape::Required) => Ok(ResponseKind::Empty { id }),
            }
        }
        (None, true, None) => {
            let method = obj.get("method").and_then(Value::as_str);
            match (method, obj.get("params")) {
                (Some(method), Some(params)) => Ok(ResponseKind::Subscription {
                    method: method.to_string(),
                    params: params.clone(),
                }),
                _ => Err(unexpected(method_of(&obj), frame)),
            }
        }
        (Some(id), _, Some(error)) => match serde_json::from_value::<JsonRpcError>(error.clone()) {
            Ok(error) => Ok(ResponseKind::Error { id, error }),
            Err(_) => Err(unexpected(method_of(&obj), frame)),
        },
        _ => Err(unexpected(method_of(&obj), frame)),
    }
}

/// Best-effort id extraction from a frame that failed classification.
pub fn probe_id(frame: &[u8]) -> Option<RpcId> {
    let obj = parse_object(frame)?;
    serde_json::from_value(obj.get("id")?.clone()).ok()
}

fn parse_object(frame: &[u8]) -> Option<Map<String, Value>> {
    match serde_json::from_slice::<Value>(frame) {
        Ok(Value::Object(obj)) => Some(obj),
        _ => None,
    }
}

fn method_of(obj: &Map<String, Value>) -> Option<String> {
    obj.get("method").and_then(Value::as_str).map(String::from)
}

fn unexpected(method: Option<String>, frame: &[u8]) -> CodingError {
    CodingError::UnexpectedFormat {
        method,
        payload: snippet(&String::from_utf8_lossy(frame)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn required(_: &RpcId) -> ResultShape {
        ResultShape::Required
    }

    fn optional(_: &RpcId) -> ResultShape {
        ResultShape::Optional
    }

    #[test]
    fn regular_reply_carries_result() {
        let frame = br#"{"jsonrpc":"2.0","id":"U1","result":{"height":800000,"hex":"00"}}"#;
        let kind = classify(frame, required).unwrap();
        assert_eq!(
            kind,
            ResponseKind::Regular {
                id: "U1".into(),
                result: Some(json!({"height": 800000, "hex": "00"})),
            }
        );
    }

    #[test]
    fn notification_is_subscription() {
        let frame = br#"{"jsonrpc":"2.0","method":"blockchain.headers.subscribe","params":[{"height":1,"hex":"00"}]}"#;
        let kind = classify(frame, required).unwrap();
        assert_eq!(
            kind,
            ResponseKind::Subscription {
                method: "blockchain.headers.subscribe".into(),
                params: json!([{"height": 1, "hex": "00"}]),
            }
        );
        assert!(kind.id().is_none());
    }

    #[test]
    fn error_reply_is_error_not_regular() {
        let frame = br#"{"jsonrpc":"2.0","id":7,"error":{"code":-32601,"message":"unknown method"}}"#;
        match classify(frame, optional).unwrap() {
            ResponseKind::Error { id, error } => {
                assert_eq!(id, RpcId::Number(7));
                assert_eq!(error.code, -32601);
                assert_eq!(error.message, "unknown method");
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn null_error_field_is_ignored() {
        let frame = br#"{"id":"a","result":5,"error":null}"#;
        assert!(matches!(
            classify(frame, required).unwrap(),
            ResponseKind::Regular { result: Some(_), .. }
        ));
    }

    #[test]
    fn missing_result_depends_on_declared_shape() {
        let frame = br#"{"id":"U3"}"#;
        assert_eq!(
            classify(frame, required).unwrap(),
            ResponseKind::Empty { id: "U3".into() }
        );
        assert_eq!(
            classify(frame, optional).unwrap(),
            ResponseKind::Regular { id: "U3".into(), result: None }
        );
    }

    #[test]
    fn null_result_depends_on_declared_shape() {
        let frame = br#"{"jsonrpc":"2.0","id":"p","result":null}"#;
        assert!(matches!(classify(frame, required).unwrap(), ResponseKind::Empty { .. }));
        assert!(matches!(
            classify(frame, optional).unwrap(),
            ResponseKind::Regular { result: None, .. }
        ));
    }

    #[test]
    fn shape_is_asked_for_the_frame_id() {
        let frame = br#"{"id":"wanted","result":null}"#;
        let kind = classify(frame, |id| {
            assert_eq!(id, &RpcId::from("wanted"));
            ResultShape::Optional
        })
        .unwrap();
        assert!(matches!(kind, ResponseKind::Regular { .. }));
    }

    #[test]
    fn unrecognized_shapes_are_unexpected_format() {
        let cases: [&[u8]; 6] = [
            b"not json",
            b"[1,2,3]",
            br#"{"jsonrpc":"2.0"}"#,
            br#"{"method":"blockchain.headers.subscribe"}"#,
            br#"{"id":"x","method":"server.ping","params":[]}"#,
            br#"{"id":true,"result":1}"#,
        ];
        for frame in cases {
            let err = classify(frame, required).unwrap_err();
            assert!(
                matches!(err, CodingError::UnexpectedFormat { .. }),
                "{}",
                String::from_utf8_lossy(frame)
            );
        }
    }

    #[test]
    fn unexpected_format_names_the_method() {
        let frame = br#"{"method":"blockchain.scripthash.subscribe"}"#;
        match classify(frame, required).unwrap_err() {
            CodingError::UnexpectedFormat { method, payload } => {
                assert_eq!(method.as_deref(), Some("blockchain.scripthash.subscribe"));
                assert!(payload.contains("scripthash"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn malformed_error_object_is_unexpected_format() {
        let frame = br#"{"id":"e","error":{"oops":1}}"#;
        assert!(matches!(
            classify(frame, required).unwrap_err(),
            CodingError::UnexpectedFormat { .. }
        ));
        assert_eq!(probe_id(frame), Some(RpcId::from("e")));
    }
}
