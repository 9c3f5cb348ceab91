//! Protocol handler
//!
//! One [`ProtocolHandler`] per connector: it owns the configuration, the
//! adapter, the upgrade registry, the [`ConnectionHandler`] and the async
//! timeout sweep thread.
//!
//! ```rust,ignore
//! use portico_core::protocol::ProtocolHandler;
//!
//! let protocol = ProtocolHandler::http11()
//!     .adapter(adapter)
//!     .codecs(|| Box::new(MyCodec::new()) as Box<dyn ExchangeCodec>)
//!     .upgrade(Arc::new(H2cProtocol))
//!     .build()?;
//!
//! protocol.init()?;
//! protocol.start()?;
//!
//! // From the endpoint's workers
//! let state = protocol.process(&socket, SocketEvent::OpenRead);
//!
//! protocol.pause();
//! protocol.stop();
//! protocol.destroy();
//! ```

mod handler;
mod recycle;
mod timeout;

pub use handler::{ConnectionHandler, ProcessorKind};
pub use recycle::RecycledProcessors;
pub use timeout::{AsyncTimeoutSweeper, WaitingProcessors};

use crate::adapter::Adapter;
use crate::codec::CodecFactory;
use crate::config::ProtocolConfig;
use crate::error::{Error, Result};
use crate::processor::ProcessorContext;
use crate::socket::{SocketEvent, SocketId, SocketState, SocketWrapper};
use crate::stats::RequestStats;
use crate::upgrade::{UpgradeProtocol, UpgradeRegistry};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{info, warn};

/// Lifecycle of a protocol handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    New,
    Initialized,
    Started,
    Paused,
    Stopped,
    Destroyed,
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`ProtocolHandler`].
pub struct ProtocolHandlerBuilder {
    kind: ProcessorKind,
    config: ProtocolConfig,
    adapter: Option<Arc<dyn Adapter>>,
    codecs: Option<Arc<dyn CodecFactory>>,
    upgrades: UpgradeRegistry,
}

impl ProtocolHandlerBuilder {
    fn new(kind: ProcessorKind) -> Self {
        Self {
            kind,
            config: ProtocolConfig::default(),
            adapter: None,
            codecs: None,
            upgrades: UpgradeRegistry::new(),
        }
    }

    pub fn config(mut self, config: ProtocolConfig) -> Self {
        self.config = config;
        self
    }

    pub fn adapter(mut self, adapter: Arc<dyn Adapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn codecs(mut self, codecs: impl CodecFactory + 'static) -> Self {
        self.codecs = Some(Arc::new(codecs));
        self
    }

    /// Register a protocol that connections can upgrade to.
    pub fn upgrade(mut self, protocol: Arc<dyn UpgradeProtocol>) -> Self {
        self.upgrades.register(protocol);
        self
    }

    pub fn build(self) -> Result<ProtocolHandler> {
        self.config.validate()?;
        let adapter = self
            .adapter
            .ok_or_else(|| Error::Config("an adapter is required".to_string()))?;
        let codecs = self
            .codecs
            .ok_or_else(|| Error::Config("a codec factory is required".to_string()))?;
        if self.kind == ProcessorKind::Ajp && !self.upgrades.is_empty() {
            return Err(Error::Config("AJP does not support upgrade protocols".to_string()));
        }

        let ctx = ProcessorContext::new(adapter, self.config).with_upgrades(self.upgrades);
        Ok(ProtocolHandler {
            handler: Arc::new(ConnectionHandler::new(self.kind, ctx.clone(), codecs)),
            ctx,
            sweeper: Mutex::new(None),
            state: Mutex::new(LifecycleState::New),
        })
    }
}

// ============================================================================
// Protocol handler
// ============================================================================

/// Connector-level owner of processors and their shared resources.
pub struct ProtocolHandler {
    handler: Arc<ConnectionHandler>,
    ctx: ProcessorContext,
    sweeper: Mutex<Option<AsyncTimeoutSweeper>>,
    state: Mutex<LifecycleState>,
}

impl ProtocolHandler {
    pub fn http11() -> ProtocolHandlerBuilder {
        ProtocolHandlerBuilder::new(ProcessorKind::Http11)
    }

    pub fn ajp() -> ProtocolHandlerBuilder {
        ProtocolHandlerBuilder::new(ProcessorKind::Ajp)
    }

    pub fn name(&self) -> &'static str {
        self.handler.kind().name()
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.ctx.config
    }

    pub fn handler(&self) -> &Arc<ConnectionHandler> {
        &self.handler
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    pub fn is_paused(&self) -> bool {
        self.ctx.is_paused()
    }

    /// ALPN identifiers to offer during the TLS handshake.
    pub fn alpn_names(&self) -> Vec<String> {
        self.ctx.upgrades.alpn_names()
    }

    fn transition(&self, allowed: &[LifecycleState], next: LifecycleState) -> Result<()> {
        let mut state = self.state.lock();
        if !allowed.contains(&*state) {
            return Err(Error::Config(format!(
                "cannot move {} from {:?} to {:?}",
                self.name(),
                *state,
                next
            )));
        }
        *state = next;
        Ok(())
    }

    pub fn init(&self) -> Result<()> {
        self.transition(&[LifecycleState::New], LifecycleState::Initialized)?;
        info!(protocol = self.name(), alpn = ?self.alpn_names(), "protocol handler initialized");
        Ok(())
    }

    /// Start the async timeout sweep.
    pub fn start(&self) -> Result<()> {
        self.transition(
            &[LifecycleState::Initialized, LifecycleState::Stopped],
            LifecycleState::Started,
        )?;
        self.ctx.paused.store(false, Ordering::Release);
        let sweeper = AsyncTimeoutSweeper::spawn(
            self.handler.waiting().clone(),
            self.ctx.paused.clone(),
            self.ctx.config.timeout_sweep_interval,
        )?;
        *self.sweeper.lock() = Some(sweeper);
        info!(protocol = self.name(), "protocol handler started");
        Ok(())
    }

    /// Stop accepting new work on existing connections.
    pub fn pause(&self) {
        if self
            .transition(&[LifecycleState::Started], LifecycleState::Paused)
            .is_err()
        {
            warn!(protocol = self.name(), state = ?self.state(), "pause ignored");
            return;
        }
        self.ctx.paused.store(true, Ordering::Release);
        self.handler.pause();
        info!(protocol = self.name(), "protocol handler paused");
    }

    pub fn resume(&self) {
        if self
            .transition(&[LifecycleState::Paused], LifecycleState::Started)
            .is_err()
        {
            warn!(protocol = self.name(), state = ?self.state(), "resume ignored");
            return;
        }
        self.ctx.paused.store(false, Ordering::Release);
        info!(protocol = self.name(), "protocol handler resumed");
    }

    /// Stop the sweep, expiring every waiting suspension, and empty the pool.
    pub fn stop(&self) {
        if self
            .transition(
                &[LifecycleState::Started, LifecycleState::Paused],
                LifecycleState::Stopped,
            )
            .is_err()
        {
            return;
        }
        if let Some(mut sweeper) = self.sweeper.lock().take() {
            sweeper.stop();
        }
        self.handler.recycle();
        info!(protocol = self.name(), stats = ?self.stats(), "protocol handler stopped");
    }

    pub fn destroy(&self) {
        if matches!(self.state(), LifecycleState::Started | LifecycleState::Paused) {
            self.stop();
        }
        *self.state.lock() = LifecycleState::Destroyed;
        info!(protocol = self.name(), "protocol handler destroyed");
    }

    /// Handle one socket event. See [`ConnectionHandler::process`].
    pub fn process(&self, socket: &Arc<dyn SocketWrapper>, event: SocketEvent) -> SocketState {
        self.handler.process(socket, event)
    }

    /// The endpoint closed `socket`.
    pub fn release_socket(&self, socket: SocketId) {
        self.handler.release_socket(socket);
    }

    /// Run one async timeout sweep at `now` (negative expires everything).
    pub fn check_async_timeouts(&self, now: i64) {
        self.handler.waiting().timeout_all(now);
    }

    pub fn waiting_count(&self) -> usize {
        self.handler.waiting().len()
    }

    pub fn connection_count(&self) -> usize {
        self.handler.connection_count()
    }

    pub fn recycled_count(&self) -> usize {
        self.handler.recycled().len()
    }

    /// Request totals across every processor this handler has created.
    pub fn stats(&self) -> RequestStats {
        self.handler.stats()
    }
}

impl Drop for ProtocolHandler {
    fn drop(&mut self) {
        if let Some(mut sweeper) = self.sweeper.get_mut().take() {
            sweeper.stop();
        }
    }
}

impl std::fmt::Debug for ProtocolHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolHandler")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("handler", &self.handler)
            .finish()
    }
}
