//! Transport abstraction.
//!
//! A [`Transport`] moves serialized envelopes between the server and its
//! clients. Inbound traffic and connection changes flow to the owner as
//! [`TransportEvent`]s over the sink handed to [`Transport::start`].

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::error::Result;
use crate::identifiers::ConnectionId;

use super::connection::ConnectionStats;

// ============================================================================
// Types
// ============================================================================

/// Channel on which a transport reports events.
pub type EventSink = mpsc::UnboundedSender<TransportEvent>;

/// Transport family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Bidirectional socket.
    WebSocket,
    /// Push stream plus single-shot POST.
    Sse,
    /// Newline-delimited JSON over a byte stream.
    Pipe,
    /// Embedder-provided transport.
    Custom,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::WebSocket => "websocket",
            Self::Sse => "sse",
            Self::Pipe => "pipe",
            Self::Custom => "custom",
        })
    }
}

/// What a transport can do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportCapabilities {
    /// Server can push unsolicited messages.
    pub streaming: bool,
    /// Clients can send on the same channel they receive on.
    pub bidirectional: bool,
    /// More than one client can attach.
    pub multi_client: bool,
    /// Supports single-shot request/response exchanges.
    pub request_response: bool,
}

/// Something that happened on a transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// A client attached.
    Connected {
        /// Transport name.
        transport: String,
        /// New connection.
        connection: ConnectionId,
    },
    /// A client detached.
    Disconnected {
        /// Transport name.
        transport: String,
        /// Departed connection.
        connection: ConnectionId,
        /// Why it left.
        reason: String,
    },
    /// Inbound envelope text.
    Message {
        /// Transport name.
        transport: String,
        /// Sending connection.
        connection: ConnectionId,
        /// Raw text.
        payload: String,
        /// Set when the reply must travel on the same exchange.
        reply: Option<oneshot::Sender<String>>,
    },
    /// The transport went from zero to some connections or back.
    StateChanged {
        /// Transport name.
        transport: String,
        /// New connected state.
        connected: bool,
    },
}

/// Aggregated traffic of one transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportStats {
    /// Transport name.
    pub name: String,
    /// Transport family.
    pub kind: TransportKind,
    /// Started and not stopped.
    pub running: bool,
    /// Running with at least one connection.
    pub connected: bool,
    /// Messages sent across all connections ever.
    pub messages_sent: u64,
    /// Messages received across all connections ever.
    pub messages_received: u64,
    /// Bytes sent.
    pub bytes_sent: u64,
    /// Bytes received.
    pub bytes_received: u64,
    /// Failures.
    pub errors: u64,
    /// Live connections.
    pub connections: Vec<ConnectionStats>,
}

// ============================================================================
// Transport
// ============================================================================

/// A communication channel to clients.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Unique name used for routing.
    fn name(&self) -> &str;

    /// Transport family.
    fn kind(&self) -> TransportKind;

    /// Declared capabilities.
    fn capabilities(&self) -> TransportCapabilities;

    /// Starts accepting clients and reporting to `sink`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::Error::Io) if the transport cannot bind
    /// or open its stream.
    async fn start(&self, sink: EventSink) -> Result<()>;

    /// Stops the transport and closes every connection.
    ///
    /// # Errors
    ///
    /// Implementations may report teardown failures; the transport is
    /// considered stopped regardless.
    async fn stop(&self) -> Result<()>;

    /// Running with at least one live connection.
    fn is_connected(&self) -> bool;

    /// Sends to every connection of this transport.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransportUnavailable`](crate::Error::TransportUnavailable)
    /// if there is no connection to send to.
    async fn send(&self, message: &str) -> Result<()>;

    /// Sends to one connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionNotFound`](crate::Error::ConnectionNotFound)
    /// for an unknown connection.
    async fn send_to(&self, connection: ConnectionId, message: &str) -> Result<()>;

    /// Traffic counters.
    fn stats(&self) -> TransportStats;
}
