//! Error types for the automation MCP server.
//!
//! This module defines all error types used throughout the crate and maps
//! them onto JSON-RPC error codes so every failure can be answered with a
//! structured error object.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use browser_mcp_server::{Error, Result};
//!
//! async fn example(pool: &ResourcePool) -> Result<()> {
//!     let browser = pool.acquire_top(BrowserKind::Chromium, TopOptions::default()).await?;
//!     pool.close(&browser).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants | JSON-RPC code |
//! |----------|----------|---------------|
//! | Configuration | [`Error::Config`] | -32603 |
//! | Protocol | [`Error::Parse`], [`Error::InvalidRequest`], [`Error::NotInitialized`], [`Error::MethodNotFound`], [`Error::InvalidParams`], [`Error::VersionMismatch`] | -32700 / -32600 / -32601 / -32602 |
//! | Lifecycle | [`Error::RequestTimeout`], [`Error::RequestCancelled`], [`Error::TooManyRequests`] | -32001 / -32603 |
//! | Resource | [`Error::ResourceNotFound`], [`Error::ResourceDisconnected`], [`Error::PoolExhausted`], [`Error::Backend`] | -32002 / -32003 |
//! | Cache | [`Error::ChecksumMismatch`], [`Error::BackupNotFound`] | -32603 |
//! | Transport | [`Error::TransportNotFound`], [`Error::TransportUnavailable`], [`Error::DuplicateTransport`], [`Error::MessageTooLarge`], [`Error::ConnectionClosed`], [`Error::Connection`] | -32603 |
//! | Rate limit | [`Error::RateLimited`] | -32000 |
//! | Internal | [`Error::Internal`] | -32603 |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`], [`Error::ChannelClosed`] | -32603 |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::oneshot::error::RecvError;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::identifiers::{ConnectionId, RequestId, ResourceId};
use crate::protocol::ErrorObject;

// ============================================================================
// Error Codes
// ============================================================================

/// JSON-RPC and application error codes.
pub mod codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON sent is not a valid request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error.
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Caller exceeded its rate limit and should back off.
    pub const RATE_LIMITED: i32 = -32000;
    /// Request did not complete within its timeout window.
    pub const REQUEST_TIMEOUT: i32 = -32001;
    /// Referenced automation resource does not exist.
    pub const RESOURCE_NOT_FOUND: i32 = -32002;
    /// Automation backend failed to execute a call.
    pub const BACKEND_ERROR: i32 = -32003;
}

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when server configuration is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Inbound bytes were not valid JSON.
    #[error("Parse error: {message}")]
    Parse {
        /// Parser diagnostic.
        message: String,
    },

    /// Envelope is JSON but not a valid request.
    #[error("Invalid request: {message}")]
    InvalidRequest {
        /// Description of the violation.
        message: String,
    },

    /// A method other than `initialize` arrived before the handshake.
    #[error("Server not initialized")]
    NotInitialized,

    /// Unknown method.
    #[error("Method not found: {method}")]
    MethodNotFound {
        /// The unrecognized method.
        method: String,
    },

    /// Parameters failed validation.
    #[error("Invalid params: {message}")]
    InvalidParams {
        /// Description of the invalid parameter.
        message: String,
    },

    /// Client requested a protocol version the server does not speak.
    #[error("Unsupported protocol version: requested {requested}, supported {supported}")]
    VersionMismatch {
        /// Version sent by the client.
        requested: String,
        /// Version this server speaks.
        supported: String,
    },

    // ========================================================================
    // Lifecycle Errors
    // ========================================================================
    /// Request exceeded its timeout window.
    #[error("Request {request_id} timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// The request ID that timed out.
        request_id: RequestId,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Request was cancelled by the client.
    #[error("Request {request_id} was cancelled")]
    RequestCancelled {
        /// The cancelled request ID.
        request_id: RequestId,
    },

    /// Too many requests are in flight.
    #[error("Too many in-flight requests: {in_flight}/{max}")]
    TooManyRequests {
        /// Current number of tracked requests.
        in_flight: usize,
        /// Configured maximum.
        max: usize,
    },

    // ========================================================================
    // Resource Errors
    // ========================================================================
    /// Resource id is unknown to the pool.
    #[error("Resource not found: {resource_id}")]
    ResourceNotFound {
        /// The missing resource.
        resource_id: ResourceId,
    },

    /// Resource exists but its backend connection is gone.
    #[error("Resource disconnected: {resource_id}")]
    ResourceDisconnected {
        /// The disconnected resource.
        resource_id: ResourceId,
    },

    /// A configured pool capacity would be exceeded.
    #[error("Pool exhausted: {message}")]
    PoolExhausted {
        /// Which limit was hit.
        message: String,
    },

    /// The automation backend reported a failure.
    #[error("Backend error: {message}")]
    Backend {
        /// Backend failure description.
        message: String,
        /// Structured detail from the backend.
        data: Option<Value>,
    },

    // ========================================================================
    // Cache Errors
    // ========================================================================
    /// Stored state failed checksum validation.
    #[error("Checksum mismatch for cache entry {key}")]
    ChecksumMismatch {
        /// Cache entry key.
        key: String,
    },

    /// Named backup does not exist.
    #[error("Backup not found: {name}")]
    BackupNotFound {
        /// Backup name.
        name: String,
    },

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// Transport name is not registered.
    #[error("Transport not found: {name}")]
    TransportNotFound {
        /// Transport name.
        name: String,
    },

    /// No connected transport can carry the message.
    #[error("Transport unavailable: {message}")]
    TransportUnavailable {
        /// Why no transport was usable.
        message: String,
    },

    /// Transport name is already registered.
    #[error("Transport already registered: {name}")]
    DuplicateTransport {
        /// Transport name.
        name: String,
    },

    /// Inbound frame exceeded the configured byte limit.
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge {
        /// Size of the offending message.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Connection id is unknown to the transport.
    #[error("Connection not found: {connection_id}")]
    ConnectionNotFound {
        /// The missing connection.
        connection_id: ConnectionId,
    },

    /// Connection failed.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // Rate Limit
    // ========================================================================
    /// Connection exceeded its request budget.
    #[error("Rate limit exceeded for {connection_id}: retry after {retry_after_ms}ms")]
    RateLimited {
        /// Offending connection.
        connection_id: ConnectionId,
        /// Milliseconds until the oldest window entry expires.
        retry_after_ms: u64,
    },

    /// Unexpected failure inside the server.
    #[error("Internal error: {message}")]
    Internal {
        /// What went wrong.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Channel receive error.
    #[error("Channel closed")]
    ChannelClosed(#[from] RecvError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a parse error.
    #[inline]
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    /// Creates an invalid request error.
    #[inline]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Creates a method not found error.
    #[inline]
    pub fn method_not_found(method: impl Into<String>) -> Self {
        Self::MethodNotFound {
            method: method.into(),
        }
    }

    /// Creates an invalid params error.
    #[inline]
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams {
            message: message.into(),
        }
    }

    /// Creates a request timeout error.
    #[inline]
    pub fn request_timeout(request_id: RequestId, timeout_ms: u64) -> Self {
        Self::RequestTimeout {
            request_id,
            timeout_ms,
        }
    }

    /// Creates a resource not found error.
    #[inline]
    pub fn resource_not_found(resource_id: impl Into<ResourceId>) -> Self {
        Self::ResourceNotFound {
            resource_id: resource_id.into(),
        }
    }

    /// Creates a resource disconnected error.
    #[inline]
    pub fn resource_disconnected(resource_id: impl Into<ResourceId>) -> Self {
        Self::ResourceDisconnected {
            resource_id: resource_id.into(),
        }
    }

    /// Creates a pool exhausted error.
    #[inline]
    pub fn pool_exhausted(message: impl Into<String>) -> Self {
        Self::PoolExhausted {
            message: message.into(),
        }
    }

    /// Creates a backend error.
    #[inline]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            data: None,
        }
    }

    /// Creates a backend error carrying structured detail.
    #[inline]
    pub fn backend_with_data(message: impl Into<String>, data: Value) -> Self {
        Self::Backend {
            message: message.into(),
            data: Some(data),
        }
    }

    /// Creates a transport not found error.
    #[inline]
    pub fn transport_not_found(name: impl Into<String>) -> Self {
        Self::TransportNotFound { name: name.into() }
    }

    /// Creates a transport unavailable error.
    #[inline]
    pub fn transport_unavailable(message: impl Into<String>) -> Self {
        Self::TransportUnavailable {
            message: message.into(),
        }
    }

    /// Creates an internal error.
    #[inline]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this error is a protocol-level violation.
    #[inline]
    #[must_use]
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Parse { .. }
                | Self::InvalidRequest { .. }
                | Self::NotInitialized
                | Self::MethodNotFound { .. }
                | Self::InvalidParams { .. }
                | Self::VersionMismatch { .. }
        )
    }

    /// Returns `true` if this error concerns an automation resource.
    #[inline]
    #[must_use]
    pub fn is_resource_error(&self) -> bool {
        matches!(
            self,
            Self::ResourceNotFound { .. }
                | Self::ResourceDisconnected { .. }
                | Self::PoolExhausted { .. }
                | Self::Backend { .. }
        )
    }

    /// Returns `true` if this is a transport error.
    #[inline]
    #[must_use]
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::TransportNotFound { .. }
                | Self::TransportUnavailable { .. }
                | Self::DuplicateTransport { .. }
                | Self::MessageTooLarge { .. }
                | Self::ConnectionNotFound { .. }
                | Self::Connection { .. }
                | Self::ConnectionClosed
                | Self::WebSocket(_)
        )
    }

    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::RequestTimeout { .. })
    }

    /// Returns `true` if this error may succeed on retry.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::RequestTimeout { .. }
                | Self::RateLimited { .. }
                | Self::ResourceDisconnected { .. }
                | Self::PoolExhausted { .. }
                | Self::TransportUnavailable { .. }
        )
    }
}

// ============================================================================
// JSON-RPC Mapping
// ============================================================================

impl Error {
    /// Returns the JSON-RPC error code for this error.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::Parse { .. } => codes::PARSE_ERROR,
            Self::InvalidRequest { .. } | Self::NotInitialized => codes::INVALID_REQUEST,
            Self::MethodNotFound { .. } => codes::METHOD_NOT_FOUND,
            Self::InvalidParams { .. } | Self::VersionMismatch { .. } => codes::INVALID_PARAMS,
            Self::RateLimited { .. } => codes::RATE_LIMITED,
            Self::RequestTimeout { .. } => codes::REQUEST_TIMEOUT,
            Self::ResourceNotFound { .. } | Self::ResourceDisconnected { .. } => {
                codes::RESOURCE_NOT_FOUND
            }
            Self::Backend { .. } | Self::PoolExhausted { .. } => codes::BACKEND_ERROR,
            _ => codes::INTERNAL_ERROR,
        }
    }

    /// Structured detail attached to the error object, if any.
    #[must_use]
    pub fn data(&self) -> Option<Value> {
        match self {
            Self::RateLimited { retry_after_ms, .. } => {
                Some(json!({ "retryAfterMs": retry_after_ms }))
            }
            Self::ResourceNotFound { resource_id } | Self::ResourceDisconnected { resource_id } => {
                Some(json!({ "resourceId": resource_id }))
            }
            Self::VersionMismatch { supported, .. } => {
                Some(json!({ "supported": [supported] }))
            }
            Self::Backend { data, .. } => data.clone(),
            _ => None,
        }
    }

    /// Converts this error into a JSON-RPC error object.
    #[must_use]
    pub fn to_error_object(&self) -> ErrorObject {
        ErrorObject {
            code: self.code(),
            message: self.to_string(),
            data: self.data(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::ErrorKind;

    #[test]
    fn test_error_display() {
        let err = Error::method_not_found("tools/explode");
        assert_eq!(err.to_string(), "Method not found: tools/explode");
    }

    #[test]
    fn test_protocol_codes() {
        assert_eq!(Error::parse("eof").code(), -32700);
        assert_eq!(Error::invalid_request("no method").code(), -32600);
        assert_eq!(Error::NotInitialized.code(), -32600);
        assert_eq!(Error::method_not_found("x").code(), -32601);
        assert_eq!(Error::invalid_params("x").code(), -32602);
        assert_eq!(Error::config("x").code(), -32603);
    }

    #[test]
    fn test_rate_limit_object_carries_retry_hint() {
        let err = Error::RateLimited {
            connection_id: ConnectionId::generate(),
            retry_after_ms: 1500,
        };
        let obj = err.to_error_object();
        assert_eq!(obj.code, codes::RATE_LIMITED);
        assert_eq!(obj.data, Some(json!({ "retryAfterMs": 1500 })));
    }

    #[test]
    fn test_version_mismatch_is_invalid_params() {
        let err = Error::VersionMismatch {
            requested: "1999-01-01".into(),
            supported: "2024-11-05".into(),
        };
        assert_eq!(err.code(), codes::INVALID_PARAMS);
        assert!(err.is_protocol_error());
    }

    #[test]
    fn test_predicates() {
        assert!(Error::resource_not_found("b-1").is_resource_error());
        assert!(Error::ConnectionClosed.is_transport_error());
        assert!(!Error::config("x").is_transport_error());
        assert!(Error::request_timeout(RequestId::from(1), 10).is_timeout());
        assert!(Error::pool_exhausted("full").is_recoverable());
        assert!(!Error::NotInitialized.is_recoverable());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(err.code(), codes::INTERNAL_ERROR);
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
