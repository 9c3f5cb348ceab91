//! Protocol upgrade
//!
//! An exchange switches protocols in one of two ways:
//!
//! - An HTTP/1.1 request carries `Connection: upgrade` and names a protocol
//!   registered in the [`UpgradeRegistry`], or the application requests an
//!   upgrade itself with [`Action::Upgrade`](crate::action::Action::Upgrade).
//! - The TLS handshake negotiated a protocol through ALPN, or the client
//!   opened with the HTTP/2 preface (h2c).
//!
//! Either way the connection handler replaces the HTTP processor with an
//! upgrade processor that owns the socket from then on.

use crate::adapter::Adapter;
use crate::error::Result;
use crate::processor::{
    AsyncTimeoutHandle, ExternalUpgradeProcessor, InternalUpgradeProcessor, ProtocolProcessor,
};
use crate::request::Request;
use crate::socket::{SocketEvent, SocketState, SocketWrapper};
use std::collections::HashMap;
use std::sync::Arc;

// ============================================================================
// Handlers
// ============================================================================

/// Upgrade handler driven directly by the core (HTTP/2, WebSocket).
pub trait InternalUpgradeHandler: Send {
    /// Take ownership of the connection.
    fn init(&mut self, socket: Arc<dyn SocketWrapper>) -> Result<()>;

    /// Handle one socket event.
    fn upgrade_dispatch(&mut self, event: SocketEvent) -> Result<SocketState>;

    /// Handle for the async timeout sweep, if the protocol has timeouts.
    fn timeout_handle(&self) -> Option<Arc<dyn AsyncTimeoutHandle>> {
        None
    }

    fn check_async_timeout_generation(&self) -> bool {
        true
    }

    fn pause(&self) {}

    /// Whether the handler performs its own non-blocking I/O.
    fn has_async_io(&self) -> bool {
        false
    }

    fn destroy(&mut self) {}
}

/// What an external upgrade handler sees of its connection.
#[derive(Clone)]
pub struct UpgradeConnection {
    socket: Arc<dyn SocketWrapper>,
}

impl UpgradeConnection {
    pub fn new(socket: Arc<dyn SocketWrapper>) -> Self {
        Self { socket }
    }

    pub fn socket(&self) -> &Arc<dyn SocketWrapper> {
        &self.socket
    }

    pub fn read(&self, max: usize) -> Result<bytes::Bytes> {
        self.socket.read(max)
    }

    pub fn write(&self, data: &[u8]) -> Result<usize> {
        self.socket.write(data)
    }

    pub fn close(&self) {
        self.socket.close();
    }
}

impl std::fmt::Debug for UpgradeConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpgradeConnection")
            .field("socket", &self.socket.id())
            .finish()
    }
}

/// Application-owned upgrade handler.
///
/// The core only forwards read and write readiness.
pub trait HttpUpgradeHandler: Send {
    fn init(&mut self, connection: UpgradeConnection) -> Result<()>;

    fn on_data_available(&mut self) -> Result<()>;

    fn on_write_possible(&mut self) -> Result<()> {
        Ok(())
    }

    /// Both directions are finished and the connection can close.
    fn is_closed(&self) -> bool;

    /// The endpoint is stopping.
    fn on_stop(&mut self) {}

    fn destroy(&mut self) {}
}

/// The handler half of an upgrade.
pub enum UpgradeHandler {
    Internal(Box<dyn InternalUpgradeHandler>),
    External(Box<dyn HttpUpgradeHandler>),
}

/// A pending switch of protocols.
pub struct UpgradeToken {
    pub handler: UpgradeHandler,
    /// Protocol name as sent in the `Upgrade:` response header
    pub protocol: String,
}

impl UpgradeToken {
    pub fn internal(protocol: impl Into<String>, handler: Box<dyn InternalUpgradeHandler>) -> Self {
        Self {
            handler: UpgradeHandler::Internal(handler),
            protocol: protocol.into(),
        }
    }

    pub fn external(protocol: impl Into<String>, handler: Box<dyn HttpUpgradeHandler>) -> Self {
        Self {
            handler: UpgradeHandler::External(handler),
            protocol: protocol.into(),
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self.handler, UpgradeHandler::Internal(_))
    }

    /// Build the processor that owns the connection after the upgrade.
    pub fn into_processor(self) -> ProtocolProcessor {
        match self.handler {
            UpgradeHandler::Internal(handler) => {
                ProtocolProcessor::UpgradeInternal(InternalUpgradeProcessor::new(handler))
            }
            UpgradeHandler::External(handler) => {
                ProtocolProcessor::UpgradeExternal(ExternalUpgradeProcessor::new(handler))
            }
        }
    }
}

impl std::fmt::Debug for UpgradeToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpgradeToken")
            .field("protocol", &self.protocol)
            .field("internal", &self.is_internal())
            .finish()
    }
}

// ============================================================================
// Upgrade protocols
// ============================================================================

/// A protocol the connector can switch to.
pub trait UpgradeProtocol: Send + Sync {
    /// Token in the `Upgrade:` header, if HTTP/1.1 upgrade is supported.
    fn http_upgrade_name(&self, secure: bool) -> Option<&str>;

    /// ALPN identifier, if TLS negotiation is supported.
    fn alpn_name(&self) -> Option<&str> {
        None
    }

    /// Create the handler that takes over the connection.
    ///
    /// `request` is the HTTP/1.1 request that asked for the upgrade, or
    /// `None` when the protocol was selected by ALPN or the h2c preface.
    fn internal_upgrade_handler(
        &self,
        socket: &Arc<dyn SocketWrapper>,
        adapter: &Arc<dyn Adapter>,
        request: Option<&Request>,
    ) -> Result<Box<dyn InternalUpgradeHandler>>;

    /// Whether the upgrade request is acceptable.
    fn accept(&self, _request: &Request) -> bool {
        true
    }

    /// Processor for a connection that starts out in this protocol.
    fn processor(
        &self,
        socket: &Arc<dyn SocketWrapper>,
        adapter: &Arc<dyn Adapter>,
    ) -> Result<ProtocolProcessor> {
        let handler = self.internal_upgrade_handler(socket, adapter, None)?;
        Ok(ProtocolProcessor::UpgradeInternal(
            InternalUpgradeProcessor::new(handler),
        ))
    }
}

/// Upgrade protocols registered with a protocol handler.
#[derive(Default, Clone)]
pub struct UpgradeRegistry {
    by_name: HashMap<String, Arc<dyn UpgradeProtocol>>,
    by_alpn: HashMap<String, Arc<dyn UpgradeProtocol>>,
}

impl UpgradeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under its upgrade name and ALPN identifier.
    pub fn register(&mut self, protocol: Arc<dyn UpgradeProtocol>) {
        if let Some(name) = protocol.http_upgrade_name(false) {
            self.by_name.insert(name.to_ascii_lowercase(), protocol.clone());
        }
        if let Some(alpn) = protocol.alpn_name() {
            self.by_alpn.insert(alpn.to_string(), protocol.clone());
        }
    }

    /// Look up an `Upgrade:` header token (case-insensitive).
    pub fn by_name(&self, name: &str) -> Option<&Arc<dyn UpgradeProtocol>> {
        self.by_name.get(&name.to_ascii_lowercase())
    }

    pub fn by_alpn(&self, alpn: &str) -> Option<&Arc<dyn UpgradeProtocol>> {
        self.by_alpn.get(alpn)
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty() && self.by_alpn.is_empty()
    }

    /// ALPN identifiers to advertise during the TLS handshake.
    pub fn alpn_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_alpn.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for UpgradeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.by_name.keys().collect();
        names.sort();
        f.debug_struct("UpgradeRegistry")
            .field("names", &names)
            .field("alpn", &self.alpn_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullHandler;

    impl InternalUpgradeHandler for NullHandler {
        fn init(&mut self, _socket: Arc<dyn SocketWrapper>) -> Result<()> {
            Ok(())
        }

        fn upgrade_dispatch(&mut self, _event: SocketEvent) -> Result<SocketState> {
            Ok(SocketState::Upgraded)
        }
    }

    struct H2c;

    impl UpgradeProtocol for H2c {
        fn http_upgrade_name(&self, secure: bool) -> Option<&str> {
            if secure { None } else { Some("h2c") }
        }

        fn alpn_name(&self) -> Option<&str> {
            Some("h2")
        }

        fn internal_upgrade_handler(
            &self,
            _socket: &Arc<dyn SocketWrapper>,
            _adapter: &Arc<dyn Adapter>,
            _request: Option<&Request>,
        ) -> Result<Box<dyn InternalUpgradeHandler>> {
            Ok(Box::new(NullHandler))
        }
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = UpgradeRegistry::new();
        assert!(registry.is_empty());
        registry.register(Arc::new(H2c));

        assert!(registry.by_name("h2c").is_some());
        assert!(registry.by_name("H2C").is_some());
        assert!(registry.by_alpn("h2").is_some());
        assert!(registry.by_alpn("h2c").is_none());
        assert_eq!(registry.alpn_names(), vec!["h2".to_string()]);
    }

    #[test]
    fn test_token_builds_matching_processor() {
        let token = UpgradeToken::internal("h2c", Box::new(NullHandler));
        assert!(token.is_internal());
        assert_eq!(format!("{token:?}"), "UpgradeToken { protocol: \"h2c\", internal: true }");

        let processor = token.into_processor();
        assert!(matches!(processor, ProtocolProcessor::UpgradeInternal(_)));
    }
}
