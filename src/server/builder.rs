//! Builder pattern for server configuration.
//!
//! Provides a fluent API for configuring and creating [`Server`] instances.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use browser_mcp_server::{AutomationBackend, Server};
//!
//! # fn example(backend: Arc<dyn AutomationBackend>) -> browser_mcp_server::Result<()> {
//! let server = Server::builder()
//!     .backend(backend)
//!     .name("automation", "1.0.0")
//!     .request_timeout(Duration::from_secs(60))
//!     .cache_policy("screenshot", Duration::from_secs(2))
//!     .websocket()
//!     .build()?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashSet;

use crate::cache::PolicyTable;
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::pool::AutomationBackend;
use crate::transport::{PipeTransport, SseTransport, Transport, WebSocketTransport};

use super::core::Server;

// ============================================================================
// Types
// ============================================================================

/// Transports constructed from the configuration at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Builtin {
    WebSocket,
    Sse,
    Stdio,
}

/// Change to the default cache policy table.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PolicyChange {
    Set(String, Duration),
    Remove(String),
}

// ============================================================================
// ServerBuilder
// ============================================================================

/// Builder for configuring a [`Server`] instance.
///
/// Use [`Server::builder()`] to create a new builder.
#[derive(Default, Clone)]
pub struct ServerBuilder {
    /// Base configuration; defaults when unset.
    config: Option<ServerConfig>,
    /// Automation backend.
    backend: Option<Arc<dyn AutomationBackend>>,
    /// Caller-supplied transports with their primary flag.
    transports: Vec<(Arc<dyn Transport>, bool)>,
    /// Transports built from the configuration.
    builtins: Vec<Builtin>,
    /// Cache policy changes, applied in order.
    policies: Vec<PolicyChange>,
    /// Advertised name and version.
    info: Option<(String, String)>,
    /// Request timeout override.
    request_timeout: Option<Duration>,
}

impl std::fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let transports: Vec<&str> = self.transports.iter().map(|(t, _)| t.name()).collect();
        f.debug_struct("ServerBuilder")
            .field("config", &self.config)
            .field("backend", &self.backend.is_some())
            .field("transports", &transports)
            .field("builtins", &self.builtins)
            .field("policies", &self.policies)
            .field("info", &self.info)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

// ============================================================================
// ServerBuilder Implementation
// ============================================================================

impl ServerBuilder {
    /// Creates a new server builder with no configuration.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the base configuration.
    ///
    /// Later setters override the matching fields.
    #[inline]
    #[must_use]
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Sets the automation backend that creates resources and runs tools.
    #[inline]
    #[must_use]
    pub fn backend(mut self, backend: Arc<dyn AutomationBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Sets the name and version reported in the handshake.
    #[inline]
    #[must_use]
    pub fn name(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.info = Some((name.into(), version.into()));
        self
    }

    /// Sets how long a request may run before it times out.
    #[inline]
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Caches results of `tool` for `ttl`.
    #[inline]
    #[must_use]
    pub fn cache_policy(mut self, tool: impl Into<String>, ttl: Duration) -> Self {
        self.policies.push(PolicyChange::Set(tool.into(), ttl));
        self
    }

    /// Never caches results of `tool`.
    #[inline]
    #[must_use]
    pub fn without_cache_policy(mut self, tool: impl Into<String>) -> Self {
        self.policies.push(PolicyChange::Remove(tool.into()));
        self
    }

    /// Adds a transport.
    #[inline]
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.push((transport, false));
        self
    }

    /// Adds a transport and makes it the primary.
    #[inline]
    #[must_use]
    pub fn primary_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        for (_, primary) in &mut self.transports {
            *primary = false;
        }
        self.transports.push((transport, true));
        self
    }

    /// Adds a WebSocket transport on the configured address.
    #[inline]
    #[must_use]
    pub fn websocket(mut self) -> Self {
        self.builtins.push(Builtin::WebSocket);
        self
    }

    /// Adds an SSE + HTTP transport on the configured address.
    #[inline]
    #[must_use]
    pub fn sse(mut self) -> Self {
        self.builtins.push(Builtin::Sse);
        self
    }

    /// Adds a pipe transport over standard input and output.
    #[inline]
    #[must_use]
    pub fn stdio(mut self) -> Self {
        self.builtins.push(Builtin::Stdio);
        self
    }

    /// Builds the server with validation.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if no backend is set
    /// - [`Error::Config`] if the configuration fails validation
    /// - [`Error::Config`] if two transports share a name
    pub fn build(self) -> Result<Server> {
        let config = self.validate_config()?;
        let backend = self.validate_backend()?;
        let transports = self.validate_transports(&config)?;
        let policies = self.policy_table();

        Ok(Server::assemble(config, backend, policies, transports))
    }
}

// ============================================================================
// Validation
// ============================================================================

impl ServerBuilder {
    /// Applies overrides and validates the configuration.
    fn validate_config(&self) -> Result<ServerConfig> {
        let mut config = self.config.clone().unwrap_or_default();
        if let Some((name, version)) = &self.info {
            config.server.name.clone_from(name);
            config.server.version.clone_from(version);
        }
        if let Some(timeout) = self.request_timeout {
            config.protocol.request_timeout = timeout;
        }
        if config.server.name.trim().is_empty() {
            return Err(Error::config("Server name must not be empty"));
        }
        config.validate()?;
        Ok(config)
    }

    /// Validates the backend configuration.
    fn validate_backend(&self) -> Result<Arc<dyn AutomationBackend>> {
        self.backend.clone().ok_or_else(|| {
            Error::config(
                "An automation backend is required. Use .backend() to set it.\n\
                 Example: Server::builder().backend(Arc::new(MyBackend::new()))",
            )
        })
    }

    /// Instantiates built-in transports and rejects duplicate names.
    fn validate_transports(&self, config: &ServerConfig) -> Result<Vec<(Arc<dyn Transport>, bool)>> {
        let mut transports = self.transports.clone();
        for builtin in &self.builtins {
            let transport: Arc<dyn Transport> = match builtin {
                Builtin::WebSocket => Arc::new(WebSocketTransport::new(config.transport.clone())),
                Builtin::Sse => Arc::new(SseTransport::new(config.transport.clone())),
                Builtin::Stdio => Arc::new(PipeTransport::stdio(&config.transport)),
            };
            transports.push((transport, false));
        }

        let mut names = FxHashSet::default();
        for (transport, _) in &transports {
            if !names.insert(transport.name().to_string()) {
                return Err(Error::config(format!(
                    "Transport name '{}' is used twice.\n\
                     Give custom transports distinct names.",
                    transport.name()
                )));
            }
        }

        Ok(transports)
    }

    /// Default policies with the recorded changes applied.
    fn policy_table(&self) -> PolicyTable {
        let mut table = PolicyTable::default();
        for change in &self.policies {
            match change {
                PolicyChange::Set(tool, ttl) => table.set(tool.clone(), *ttl),
                PolicyChange::Remove(tool) => table.remove(tool),
            }
        }
        table
    }
}

// ============================================================================
// Tests
// ============================================================================
