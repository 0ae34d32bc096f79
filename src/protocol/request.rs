//! JSON-RPC 2.0 envelopes.
//!
//! Inbound text is classified into requests, notifications and batches
//! before any typed parsing of params happens. Anything that cannot be
//! classified is answered with a ready-made error [`Response`].
//!
//! # Format
//!
//! ```json
//! { "jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": { ... } }
//! { "jsonrpc": "2.0", "id": 1, "result": { ... } }
//! { "jsonrpc": "2.0", "id": 1, "error": { "code": -32601, "message": "..." } }
//! { "jsonrpc": "2.0", "method": "notifications/initialized" }
//! ```

// ============================================================================
// Imports
// ============================================================================

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;
use crate::identifiers::RequestId;

// ============================================================================
// JsonRpcVersion
// ============================================================================

/// The `"jsonrpc": "2.0"` marker. Deserialization rejects any other value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JsonRpcVersion;

impl JsonRpcVersion {
    /// The only supported version string.
    pub const VALUE: &'static str = "2.0";
}

impl Serialize for JsonRpcVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(Self::VALUE)
    }
}

impl<'de> Deserialize<'de> for JsonRpcVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        if value == Self::VALUE {
            Ok(Self)
        } else {
            Err(de::Error::custom(format!("unsupported jsonrpc version {value:?}")))
        }
    }
}

// ============================================================================
// Request
// ============================================================================

/// A request expecting a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Protocol marker.
    pub jsonrpc: JsonRpcVersion,
    /// Correlation id echoed in the response.
    pub id: RequestId,
    /// Method name, e.g. `tools/call`.
    pub method: String,
    /// Method parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    /// Creates a request.
    #[must_use]
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

// ============================================================================
// Notification
// ============================================================================

/// A one-way message. Never answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Protocol marker.
    pub jsonrpc: JsonRpcVersion,
    /// Method name, e.g. `notifications/progress`.
    pub method: String,
    /// Method parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    /// Creates a notification.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            method: method.into(),
            params,
        }
    }
}

// ============================================================================
// Response
// ============================================================================

/// Error member of an error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// JSON-RPC error code.
    pub code: i32,
    /// Human-readable message.
    pub message: String,
    /// Structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Success or failure body of a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponsePayload {
    /// `result` member.
    Result(Value),
    /// `error` member.
    Error(ErrorObject),
}

/// A response to one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Protocol marker.
    pub jsonrpc: JsonRpcVersion,
    /// Id of the answered request; `null` when it could not be determined.
    pub id: Option<RequestId>,
    /// Result or error.
    #[serde(flatten)]
    pub payload: ResponsePayload,
}

impl Response {
    /// Creates a success response.
    #[must_use]
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            id: Some(id),
            payload: ResponsePayload::Result(result),
        }
    }

    /// Creates an error response from a crate error.
    #[must_use]
    pub fn error(id: Option<RequestId>, error: &Error) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            id,
            payload: ResponsePayload::Error(error.to_error_object()),
        }
    }

    /// Returns `true` for an error response.
    #[inline]
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self.payload, ResponsePayload::Error(_))
    }

    /// Returns the result member, if successful.
    #[must_use]
    pub fn result(&self) -> Option<&Value> {
        match &self.payload {
            ResponsePayload::Result(v) => Some(v),
            ResponsePayload::Error(_) => None,
        }
    }

    /// Returns the error member, if failed.
    #[must_use]
    pub fn error_object(&self) -> Option<&ErrorObject> {
        match &self.payload {
            ResponsePayload::Error(e) => Some(e),
            ResponsePayload::Result(_) => None,
        }
    }
}

// ============================================================================
// Outbound
// ============================================================================

/// Any message the server writes to a transport.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Message {
    /// Single response.
    Response(Response),
    /// Batch of responses.
    Batch(Vec<Response>),
    /// Server-originated notification.
    Notification(Notification),
}

impl Message {
    /// Serializes to compact JSON text.
    #[must_use]
    pub fn to_json(&self) -> String {
        // Serializing these types cannot fail: every map key is a string.
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Self::Response(response)
    }
}

impl From<Notification> for Message {
    fn from(notification: Notification) -> Self {
        Self::Notification(notification)
    }
}

// ============================================================================
// Inbound
// ============================================================================

/// One classified inbound envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Request expecting a response.
    Request(Request),
    /// Fire-and-forget notification.
    Notification(Notification),
}

/// Parsed inbound text.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// A single envelope.
    Single(Envelope),
    /// A non-empty batch; invalid members carry their error response.
    Batch(Vec<Result<Envelope, Response>>),
}

/// Parses and classifies inbound text.
///
/// # Errors
///
/// Returns the error [`Response`] to send back: `-32700` with a null id for
/// invalid JSON, `-32600` for an empty batch or a malformed envelope.
pub fn parse_incoming(text: &str) -> Result<Incoming, Response> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| Response::error(None, &Error::parse(e.to_string())))?;

    match value {
        Value::Array(items) if items.is_empty() => Err(Response::error(
            None,
            &Error::invalid_request("empty batch"),
        )),
        Value::Array(items) => Ok(Incoming::Batch(items.into_iter().map(classify).collect())),
        single => classify(single).map(Incoming::Single),
    }
}

/// Classifies one envelope value.
fn classify(value: Value) -> Result<Envelope, Response> {
    let Value::Object(map) = &value else {
        return Err(Response::error(
            None,
            &Error::invalid_request("envelope must be an object"),
        ));
    };

    // Best-effort id so the error response can be correlated.
    let id = map
        .get("id")
        .and_then(|v| serde_json::from_value::<RequestId>(v.clone()).ok());
    let invalid = |message: String| Response::error(id.clone(), &Error::invalid_request(message));

    if !map.contains_key("method") {
        return Err(invalid("missing method".to_string()));
    }

    if map.contains_key("id") {
        serde_json::from_value::<Request>(value)
            .map(Envelope::Request)
            .map_err(|e| invalid(e.to_string()))
    } else {
        serde_json::from_value::<Notification>(value)
            .map(Envelope::Notification)
            .map_err(|e| invalid(e.to_string()))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use crate::error::codes;

    fn code(response: &Response) -> i32 {
        response.error_object().map(|e| e.code).unwrap_or_default()
    }

    #[test]
    fn test_classifies_request_and_notification() {
        let req = parse_incoming(r#"{"jsonrpc":"2.0","id":7,"method":"ping"}"#).expect("parse");
        assert!(matches!(req, Incoming::Single(Envelope::Request(ref r)) if r.id == RequestId::Number(7)));

        let note = parse_incoming(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .expect("parse");
        assert!(matches!(note, Incoming::Single(Envelope::Notification(_))));
    }

    #[test]
    fn test_parse_error_has_null_id() {
        let err = parse_incoming("{not json").expect_err("invalid");
        assert_eq!(code(&err), codes::PARSE_ERROR);
        let encoded = Message::from(err).to_json();
        assert!(encoded.contains(r#""id":null"#));
    }

    #[test]
    fn test_invalid_envelopes() {
        let wrong_version = parse_incoming(r#"{"jsonrpc":"1.0","id":"a","method":"ping"}"#)
            .expect_err("invalid");
        assert_eq!(code(&wrong_version), codes::INVALID_REQUEST);
        assert_eq!(wrong_version.id, Some(RequestId::from("a")));

        let no_method = parse_incoming(r#"{"jsonrpc":"2.0","id":1}"#).expect_err("invalid");
        assert_eq!(code(&no_method), codes::INVALID_REQUEST);

        let empty = parse_incoming("[]").expect_err("invalid");
        assert_eq!(code(&empty), codes::INVALID_REQUEST);
    }

    #[test]
    fn test_batch_keeps_invalid_members() {
        let batch = parse_incoming(
            r#"[{"jsonrpc":"2.0","id":1,"method":"ping"}, 42, {"jsonrpc":"2.0","method":"x"}]"#,
        )
        .expect("parse");
        let Incoming::Batch(items) = batch else {
            panic!("expected batch");
        };
        assert_eq!(items.len(), 3);
        assert!(items[0].is_ok());
        assert!(items[1].is_err());
        assert!(matches!(items[2], Ok(Envelope::Notification(_))));
    }

    #[test]
    fn test_response_wire_shape() {
        let ok = Response::success(RequestId::from("r1"), json!({ "tools": [] }));
        assert_eq!(
            serde_json::to_value(&ok).expect("encode"),
            json!({ "jsonrpc": "2.0", "id": "r1", "result": { "tools": [] } })
        );

        let err = Response::error(Some(1.into()), &Error::method_not_found("nope"));
        let value = serde_json::to_value(&err).expect("encode");
        assert_eq!(value["error"]["code"], codes::METHOD_NOT_FOUND);
        assert!(value.get("result").is_none());

        let back: Response = serde_json::from_value(value).expect("decode");
        assert!(back.is_error());
    }
}
