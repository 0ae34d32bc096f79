//! Newline-delimited JSON over a byte stream.
//!
//! One envelope per line in each direction. The pipe carries exactly one
//! connection, opened on start and closed when the input ends.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::identifiers::ConnectionId;

use super::base::{EventSink, Transport, TransportCapabilities, TransportKind, TransportStats};
use super::connection::{ConnectionRegistry, Outbound};

// ============================================================================
// Types
// ============================================================================

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Default transport name.
pub const DEFAULT_NAME: &str = "pipe";

struct PipeInner {
    name: String,
    max_message_bytes: usize,
    registry: ConnectionRegistry,
    io: Mutex<Option<(BoxedReader, BoxedWriter)>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

// ============================================================================
// PipeTransport
// ============================================================================

/// Single-client transport over any reader/writer pair.
#[derive(Clone)]
pub struct PipeTransport {
    inner: Arc<PipeInner>,
}

impl std::fmt::Debug for PipeTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeTransport")
            .field("name", &self.inner.name)
            .field("connected", &self.inner.registry.is_connected())
            .finish_non_exhaustive()
    }
}

impl PipeTransport {
    /// Wraps a reader/writer pair.
    #[must_use]
    pub fn new<R, W>(reader: R, writer: W, config: &TransportConfig) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Arc::new(PipeInner {
                name: DEFAULT_NAME.to_string(),
                max_message_bytes: config.max_message_bytes,
                registry: ConnectionRegistry::new(DEFAULT_NAME, TransportKind::Pipe),
                io: Mutex::new(Some((Box::new(reader), Box::new(writer)))),
                task: Mutex::new(None),
            }),
        }
    }

    /// Pipe over the process's standard input and output.
    #[must_use]
    pub fn stdio(config: &TransportConfig) -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout(), config)
    }

    /// The single connection, while open.
    #[must_use]
    pub fn connection(&self) -> Option<ConnectionId> {
        self.inner.registry.ids().into_iter().next()
    }
}

// ============================================================================
// Transport impl
// ============================================================================

#[async_trait]
impl Transport for PipeTransport {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Pipe
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities {
            streaming: true,
            bidirectional: true,
            multi_client: false,
            request_response: false,
        }
    }

    async fn start(&self, sink: EventSink) -> Result<()> {
        let (reader, writer) = self
            .inner
            .io
            .lock()
            .take()
            .ok_or_else(|| Error::transport_unavailable("pipe streams already consumed"))?;

        self.inner.registry.attach(sink);
        let (id, outbound) = self.inner.registry.open();

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let reason = pump(&inner, id, reader, writer, outbound).await;
            inner.registry.close(id, &reason);
            info!(transport = %inner.name, reason = %reason, "Pipe closed");
        });
        *self.inner.task.lock() = Some(task);

        info!(transport = %self.inner.name, connection = %id, "Pipe transport started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.inner.registry.detach("server shutdown");
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.registry.is_connected()
    }

    async fn send(&self, message: &str) -> Result<()> {
        self.inner.registry.broadcast(message).map(|_| ())
    }

    async fn send_to(&self, connection: ConnectionId, message: &str) -> Result<()> {
        self.inner.registry.send_to(connection, message)
    }

    fn stats(&self) -> TransportStats {
        self.inner.registry.stats()
    }
}

// ============================================================================
// Pump
// ============================================================================

/// Moves lines both ways until input ends or the connection is released.
/// Returns the close reason.
async fn pump(
    inner: &PipeInner,
    id: ConnectionId,
    reader: BoxedReader,
    mut writer: BoxedWriter,
    mut outbound: tokio::sync::mpsc::UnboundedReceiver<Outbound>,
) -> String {
    let mut lines = BufReader::new(reader).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        if line.len() > inner.max_message_bytes {
                            inner.registry.record_error(id);
                            warn!(size = line.len(), max = inner.max_message_bytes, "Dropping oversize line");
                            continue;
                        }
                        inner.registry.received(id, line.to_string(), None);
                    }
                    Ok(None) => return "end of input".to_string(),
                    Err(e) => {
                        inner.registry.record_error(id);
                        return format!("read failed: {e}");
                    }
                }
            }

            item = outbound.recv() => {
                match item {
                    Some(Outbound::Text(text)) => {
                        let written = async {
                            writer.write_all(text.as_bytes()).await?;
                            writer.write_all(b"\n").await?;
                            writer.flush().await
                        }
                        .await;
                        if let Err(e) = written {
                            inner.registry.record_error(id);
                            return format!("write failed: {e}");
                        }
                    }
                    Some(Outbound::Close { reason, .. }) => {
                        debug!(reason = %reason, "Pipe close requested");
                        let _ = writer.shutdown().await;
                        return reason;
                    }
                    None => return "connection released".to_string(),
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
