// SPDX-License-Identifier: MIT OR Apache-2.0
//! Wire shapes for the newline-delimited JSON-RPC channel spoken to the
//! supervised child process.

use serde::{Deserialize, Serialize};

/// A JSON-RPC style error object, as carried in a `response.error` field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcErrorObject {
    /// Numeric error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional structured error payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// An outgoing request: `{"method", "id", "params"?}`.
#[derive(Debug, Clone, Serialize)]
pub struct RequestOut {
    pub method: String,
    pub id: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

/// An outgoing notification: `{"method", "params"?}`, no `id`.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationOut {
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

/// An outgoing response to a server-initiated request.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseOut {
    pub id: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

/// Raw shape used only to classify an incoming line before dispatch.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RawIncoming {
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<RpcErrorObject>,
}

/// A line received from the child, classified per §6: both `method` and
/// `id` present ⇒ server request; `method` only ⇒ notification; `id` only
/// ⇒ response.
#[derive(Debug, Clone)]
pub enum Incoming {
    /// A request the child is initiating toward us.
    ServerRequest {
        method: String,
        id: serde_json::Value,
        params: Option<serde_json::Value>,
    },
    /// A fire-and-forget notification from the child.
    Notification {
        method: String,
        params: Option<serde_json::Value>,
    },
    /// A response to one of our own `Call`s.
    Response {
        id: serde_json::Value,
        result: Option<serde_json::Value>,
        error: Option<RpcErrorObject>,
    },
}

impl Incoming {
    /// Classify a raw JSON line.
    ///
    /// Returns `Ok(None)` if the line parses as JSON but matches none of the
    /// three shapes (neither `method` nor `id` present) — the caller logs
    /// and drops such lines per §6.
    pub(crate) fn classify(line: &str) -> Result<Option<Self>, serde_json::Error> {
        let raw: RawIncoming = serde_json::from_str(line)?;
        Ok(match (raw.method, raw.id) {
            (Some(method), Some(id)) => Some(Incoming::ServerRequest {
                method,
                id,
                params: raw.params,
            }),
            (Some(method), None) => Some(Incoming::Notification {
                method,
                params: raw.params,
            }),
            (None, Some(id)) => Some(Incoming::Response {
                id,
                result: raw.result,
                error: raw.error,
            }),
            (None, None) => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_server_request() {
        let line = r#"{"method":"applyPatch","id":7,"params":{"a":1}}"#;
        match Incoming::classify(line).unwrap().unwrap() {
            Incoming::ServerRequest { method, id, params } => {
                assert_eq!(method, "applyPatch");
                assert_eq!(id, serde_json::json!(7));
                assert_eq!(params, Some(serde_json::json!({"a":1})));
            }
            other => panic!("expected ServerRequest, got {other:?}"),
        }
    }

    #[test]
    fn classifies_notification() {
        let line = r#"{"method":"tokenCount","params":{"n":5}}"#;
        match Incoming::classify(line).unwrap().unwrap() {
            Incoming::Notification { method, params } => {
                assert_eq!(method, "tokenCount");
                assert_eq!(params, Some(serde_json::json!({"n":5})));
            }
            other => panic!("expected Notification, got {other:?}"),
        }
    }

    #[test]
    fn classifies_response_with_result() {
        let line = r#"{"id":1,"result":{"ok":true}}"#;
        match Incoming::classify(line).unwrap().unwrap() {
            Incoming::Response { id, result, error } => {
                assert_eq!(id, serde_json::json!(1));
                assert_eq!(result, Some(serde_json::json!({"ok":true})));
                assert!(error.is_none());
            }
            other => panic!("expected Response, got {other:?}"),
        }
    }

    #[test]
    fn classifies_response_with_error() {
        let line = r#"{"id":1,"error":{"code":-32000,"message":"boom"}}"#;
        match Incoming::classify(line).unwrap().unwrap() {
            Incoming::Response { error: Some(e), .. } => {
                assert_eq!(e.code, -32000);
                assert_eq!(e.message, "boom");
            }
            other => panic!("expected Response with error, got {other:?}"),
        }
    }

    #[test]
    fn unclassifiable_line_with_neither_method_nor_id_is_none() {
        let line = r#"{"foo":"bar"}"#;
        assert!(Incoming::classify(line).unwrap().is_none());
    }

    #[test]
    fn invalid_json_is_an_error() {
        assert!(Incoming::classify("not json").is_err());
    }
}
