//! Processors
//!
//! A processor owns one connection's protocol state between socket events.
//! The [`ConnectionHandler`](crate::protocol::ConnectionHandler) finds or
//! creates the processor for a socket, hands it the event, and acts on the
//! returned [`SocketState`].
//!
//! | Variant | Wire | Pooled | Upgrade |
//! |---------|------|--------|---------|
//! | [`Http11Processor`] | HTTP/1.1 | yes | `Upgrade:` header, h2c preface |
//! | [`AjpProcessor`] | AJP/1.3 | yes | no |
//! | [`InternalUpgradeProcessor`] | handler defined | no | - |
//! | [`ExternalUpgradeProcessor`] | application defined | no | - |

mod ajp;
mod core;
mod exchange;
mod http11;
mod upgrade;

pub use self::ajp::AjpProcessor;
pub use self::core::ProcessorCore;
pub use self::http11::Http11Processor;
pub use self::upgrade::{ExternalUpgradeProcessor, InternalUpgradeProcessor};

use crate::adapter::Adapter;
use crate::config::ProtocolConfig;
use crate::error::Result;
use crate::socket::{DispatchType, SocketEvent, SocketState, SocketWrapper};
use crate::stats::RequestInfo;
use crate::upgrade::{UpgradeRegistry, UpgradeToken};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::trace;
use uuid::Uuid;

// ============================================================================
// Identity
// ============================================================================

/// Unique identifier of a processor instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessorId(Uuid);

impl ProcessorId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ProcessorId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ProcessorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Processor Trait
// ============================================================================

/// Something the async timeout sweep can expire.
pub trait AsyncTimeoutHandle: Send + Sync {
    /// Expire the suspension if it has been waiting too long.
    ///
    /// A negative `now` expires unconditionally.
    fn timeout_async(&self, now: i64);
}

/// Per-connection protocol state machine.
pub trait Processor: Send {
    fn id(&self) -> ProcessorId;

    /// Drive the processor with one socket event.
    fn process(&mut self, socket: &Arc<dyn SocketWrapper>, event: SocketEvent)
        -> Result<SocketState>;

    /// The upgrade requested by the last cycle, if any.
    fn take_upgrade_token(&mut self) -> Option<UpgradeToken>;

    /// Bytes read past the end of the last protocol message.
    fn take_leftover_input(&mut self) -> Bytes;

    fn is_async(&self) -> bool;

    fn is_upgrade(&self) -> bool;

    /// Handle for the async timeout sweep, if this processor can time out.
    fn timeout_handle(&self) -> Option<Arc<dyn AsyncTimeoutHandle>>;

    /// Whether the most recent timeout belongs to the current suspension.
    fn check_async_timeout_generation(&self) -> bool;

    fn pause(&self);

    fn request_info(&self) -> Option<Arc<RequestInfo>>;

    /// Reset for reuse on another connection.
    fn recycle(&mut self);

    /// Release upgrade handler resources; a no-op for pooled processors.
    fn destroy_upgrade(&mut self) {}
}

// ============================================================================
// Shared processor context
// ============================================================================

/// What every processor of one protocol handler shares.
#[derive(Clone)]
pub struct ProcessorContext {
    pub adapter: Arc<dyn Adapter>,
    pub config: Arc<ProtocolConfig>,
    pub upgrades: Arc<UpgradeRegistry>,
    pub paused: Arc<AtomicBool>,
}

impl ProcessorContext {
    pub fn new(adapter: Arc<dyn Adapter>, config: ProtocolConfig) -> Self {
        Self {
            adapter,
            config: Arc::new(config),
            upgrades: Arc::new(UpgradeRegistry::new()),
            paused: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_upgrades(mut self, upgrades: UpgradeRegistry) -> Self {
        self.upgrades = Arc::new(upgrades);
        self
    }

    #[inline]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ProcessorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorContext")
            .field("config", &self.config)
            .field("paused", &self.is_paused())
            .finish()
    }
}

// ============================================================================
// Dispatch queue
// ============================================================================

/// Pending non-blocking I/O dispatches. Each type is queued at most once.
#[derive(Debug, Default)]
pub struct DispatchQueue {
    pending: Mutex<Vec<DispatchType>>,
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, dispatch: DispatchType) {
        let mut pending = self.pending.lock();
        if !pending.contains(&dispatch) {
            pending.push(dispatch);
        }
    }

    /// Take everything queued, oldest first.
    pub fn take(&self) -> Vec<DispatchType> {
        std::mem::take(&mut *self.pending.lock())
    }

    pub fn clear(&self) {
        self.pending.lock().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

// ============================================================================
// Event loop shared by all processors
// ============================================================================

/// The event loop every processor variant runs.
pub(crate) trait LightProcessor {
    fn dispatch_queue(&self) -> &DispatchQueue;

    /// Handle a freshly readable connection.
    fn service(&mut self) -> Result<SocketState>;

    /// Continue an async or upgraded exchange.
    fn dispatch(&mut self, event: SocketEvent) -> Result<SocketState>;

    fn async_post_process(&mut self) -> Result<SocketState>;

    fn is_async(&self) -> bool;

    fn is_upgrade(&self) -> bool;

    fn log_access(&mut self) {}

    fn has_pipelined_data(&self) -> bool {
        false
    }

    /// Serve a request that arrived while the previous one was dispatched.
    fn check_for_pipelined_data(&mut self, state: SocketState) -> Result<SocketState> {
        if state == SocketState::Open && self.has_pipelined_data() {
            self.service()
        } else {
            Ok(state)
        }
    }

    fn drive(&mut self, mut event: SocketEvent) -> Result<SocketState> {
        let mut state = SocketState::Closed;
        let mut dispatches: Vec<DispatchType> = Vec::new();

        loop {
            if !dispatches.is_empty() {
                let next = dispatches.remove(0);
                event = next.event();
                trace!(?next, "processing queued dispatch");
                state = self.dispatch(event)?;
                if dispatches.is_empty() {
                    state = self.check_for_pipelined_data(state)?;
                }
            } else if event == SocketEvent::Disconnect {
                // Nothing to do; the handler closes the socket
            } else if self.is_async() || self.is_upgrade() || state == SocketState::AsyncEnd {
                state = self.dispatch(event)?;
                state = self.check_for_pipelined_data(state)?;
            } else if event == SocketEvent::OpenWrite {
                // Writes are only expected for async or upgraded connections
                state = SocketState::Long;
            } else if event == SocketEvent::OpenRead {
                state = self.service()?;
            } else if event == SocketEvent::ConnectFail {
                self.log_access();
            } else {
                state = SocketState::Closed;
            }

            trace!(?event, ?state, "processor cycle");

            if state != SocketState::Closed && self.is_async() {
                state = self.async_post_process()?;
                trace!(?state, "after async post process");
            }

            if dispatches.is_empty() {
                dispatches = self.dispatch_queue().take();
            }

            let again = state == SocketState::AsyncEnd
                || (!dispatches.is_empty() && state != SocketState::Closed);
            if !again {
                break;
            }
        }

        Ok(state)
    }
}

// ============================================================================
// Processor variants
// ============================================================================

/// Every processor the handler can own.
pub enum ProtocolProcessor {
    Http11(Http11Processor),
    Ajp(AjpProcessor),
    UpgradeInternal(InternalUpgradeProcessor),
    UpgradeExternal(ExternalUpgradeProcessor),
    Custom(Box<dyn Processor>),
}

impl ProtocolProcessor {
    fn inner(&self) -> &dyn Processor {
        match self {
            Self::Http11(p) => p,
            Self::Ajp(p) => p,
            Self::UpgradeInternal(p) => p,
            Self::UpgradeExternal(p) => p,
            Self::Custom(p) => p.as_ref(),
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Processor {
        match self {
            Self::Http11(p) => p,
            Self::Ajp(p) => p,
            Self::UpgradeInternal(p) => p,
            Self::UpgradeExternal(p) => p,
            Self::Custom(p) => p.as_mut(),
        }
    }

    /// Hand the socket to a freshly created upgrade handler.
    pub fn init_upgrade(&mut self, socket: &Arc<dyn SocketWrapper>) -> Result<()> {
        match self {
            Self::UpgradeInternal(p) => p.init(socket),
            Self::UpgradeExternal(p) => p.init(socket),
            _ => Ok(()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Http11(_) => "http/1.1",
            Self::Ajp(_) => "ajp",
            Self::UpgradeInternal(_) => "upgrade-internal",
            Self::UpgradeExternal(_) => "upgrade-external",
            Self::Custom(_) => "custom",
        }
    }
}

impl Processor for ProtocolProcessor {
    fn id(&self) -> ProcessorId {
        self.inner().id()
    }

    fn process(
        &mut self,
        socket: &Arc<dyn SocketWrapper>,
        event: SocketEvent,
    ) -> Result<SocketState> {
        self.inner_mut().process(socket, event)
    }

    fn take_upgrade_token(&mut self) -> Option<UpgradeToken> {
        self.inner_mut().take_upgrade_token()
    }

    fn take_leftover_input(&mut self) -> Bytes {
        self.inner_mut().take_leftover_input()
    }

    fn is_async(&self) -> bool {
        self.inner().is_async()
    }

    fn is_upgrade(&self) -> bool {
        self.inner().is_upgrade()
    }

    fn timeout_handle(&self) -> Option<Arc<dyn AsyncTimeoutHandle>> {
        self.inner().timeout_handle()
    }

    fn check_async_timeout_generation(&self) -> bool {
        self.inner().check_async_timeout_generation()
    }

    fn pause(&self) {
        self.inner().pause()
    }

    fn request_info(&self) -> Option<Arc<RequestInfo>> {
        self.inner().request_info()
    }

    fn recycle(&mut self) {
        self.inner_mut().recycle()
    }

    fn destroy_upgrade(&mut self) {
        self.inner_mut().destroy_upgrade()
    }
}

impl std::fmt::Debug for ProtocolProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolProcessor")
            .field("kind", &self.kind())
            .field("id", &self.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[test]
    fn test_dispatch_queue_is_a_set() {
        let queue = DispatchQueue::new();
        queue.add(DispatchType::NonBlockingWrite);
        queue.add(DispatchType::NonBlockingRead);
        queue.add(DispatchType::NonBlockingWrite);

        assert_eq!(
            queue.take(),
            vec![DispatchType::NonBlockingWrite, DispatchType::NonBlockingRead]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_processor_id_unique() {
        assert_ne!(ProcessorId::new(), ProcessorId::new());
    }

    /// Loop driver with scripted answers.
    #[derive(Default)]
    struct Scripted {
        queue: DispatchQueue,
        service: VecDeque<SocketState>,
        dispatch: VecDeque<SocketState>,
        post: VecDeque<SocketState>,
        is_async: bool,
        pipelined: bool,
        calls: Vec<String>,
    }

    impl LightProcessor for Scripted {
        fn dispatch_queue(&self) -> &DispatchQueue {
            &self.queue
        }

        fn service(&mut self) -> Result<SocketState> {
            self.calls.push("service".to_string());
            Ok(self.service.pop_front().unwrap_or(SocketState::Closed))
        }

        fn dispatch(&mut self, event: SocketEvent) -> Result<SocketState> {
            self.calls.push(format!("dispatch:{event:?}"));
            let state = self.dispatch.pop_front().unwrap_or(SocketState::Closed);
            if state != SocketState::Long {
                self.is_async = false;
            }
            Ok(state)
        }

        fn async_post_process(&mut self) -> Result<SocketState> {
            self.calls.push("post".to_string());
            Ok(self.post.pop_front().unwrap_or(SocketState::Long))
        }

        fn is_async(&self) -> bool {
            self.is_async
        }

        fn is_upgrade(&self) -> bool {
            false
        }

        fn log_access(&mut self) {
            self.calls.push("log_access".to_string());
        }

        fn has_pipelined_data(&self) -> bool {
            self.pipelined
        }
    }

    #[test]
    fn test_drive_open_read_services() {
        let mut p = Scripted {
            service: VecDeque::from([SocketState::Open]),
            ..Default::default()
        };
        assert_eq!(p.drive(SocketEvent::OpenRead).unwrap(), SocketState::Open);
        assert_eq!(p.calls, vec!["service"]);
    }

    #[test]
    fn test_drive_simple_events() {
        let mut p = Scripted::default();
        assert_eq!(p.drive(SocketEvent::OpenWrite).unwrap(), SocketState::Long);
        assert_eq!(p.drive(SocketEvent::Disconnect).unwrap(), SocketState::Closed);
        assert_eq!(p.drive(SocketEvent::Stop).unwrap(), SocketState::Closed);
        assert_eq!(p.drive(SocketEvent::ConnectFail).unwrap(), SocketState::Closed);
        assert_eq!(p.calls, vec!["log_access"]);
    }

    #[test]
    fn test_drive_loops_on_async_end() {
        let mut p = Scripted {
            is_async: true,
            dispatch: VecDeque::from([SocketState::Long, SocketState::Open]),
            post: VecDeque::from([SocketState::AsyncEnd]),
            ..Default::default()
        };

        assert_eq!(p.drive(SocketEvent::Timeout).unwrap(), SocketState::Open);
        assert_eq!(
            p.calls,
            vec!["dispatch:Timeout", "post", "dispatch:Timeout"]
        );
    }

    #[test]
    fn test_drive_runs_queued_dispatches() {
        let mut p = Scripted {
            is_async: true,
            dispatch: VecDeque::from([SocketState::Long, SocketState::Long, SocketState::Long]),
            post: VecDeque::from([SocketState::Long, SocketState::Long, SocketState::Long]),
            ..Default::default()
        };
        p.queue.add(DispatchType::NonBlockingRead);
        p.queue.add(DispatchType::NonBlockingWrite);

        assert_eq!(p.drive(SocketEvent::OpenRead).unwrap(), SocketState::Long);
        assert_eq!(
            p.calls,
            vec![
                "dispatch:OpenRead",
                "post",
                "dispatch:OpenRead",
                "post",
                "dispatch:OpenWrite",
                "post"
            ]
        );
    }

    #[test]
    fn test_drive_checks_pipelined_data() {
        let mut p = Scripted {
            is_async: true,
            pipelined: true,
            dispatch: VecDeque::from([SocketState::Open]),
            service: VecDeque::from([SocketState::Open]),
            ..Default::default()
        };
        assert_eq!(p.drive(SocketEvent::OpenRead).unwrap(), SocketState::Open);
        assert_eq!(p.calls, vec!["dispatch:OpenRead", "service"]);
    }
}
