//! Connection handler
//!
//! Maps each live socket to the processor that owns it between events. For
//! every event the handler finds (or negotiates, pops, or creates) the
//! processor, drives it, and acts on the verdict:
//!
//! | Verdict | Action |
//! |---------|--------|
//! | `Long` | keep mapping, re-arm reads unless async, track if async |
//! | `Open` | drop mapping, recycle processor, re-arm reads |
//! | `Upgrading` | swap in the upgrade processor, replay leftover bytes |
//! | `Upgraded` | keep mapping, re-arm reads unless the event was a write |
//! | `Sendfile`, `Suspended`, `AsyncIo` | keep mapping, lower layers own the socket |
//! | anything else | drop mapping, release processor, close |

use super::recycle::RecycledProcessors;
use super::timeout::WaitingProcessors;
use crate::codec::CodecFactory;
use crate::error::{Error, Result};
use crate::processor::{
    AjpProcessor, Http11Processor, Processor, ProcessorContext, ProtocolProcessor,
};
use crate::socket::{SocketEvent, SocketId, SocketState, SocketWrapper};
use crate::stats::{RequestGroupInfo, RequestStats};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error, trace};

/// Wire protocol spoken by freshly accepted connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessorKind {
    Http11,
    Ajp,
}

impl ProcessorKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Http11 => "http-1.1",
            Self::Ajp => "ajp",
        }
    }
}

/// Per-connector socket to processor routing.
pub struct ConnectionHandler {
    kind: ProcessorKind,
    ctx: ProcessorContext,
    codecs: Arc<dyn CodecFactory>,
    // Processors are Send but not Sync; the mutex is only ever contended by pause()
    connections: DashMap<SocketId, Mutex<ProtocolProcessor>>,
    recycled: RecycledProcessors,
    waiting: Arc<WaitingProcessors>,
    global: Arc<RequestGroupInfo>,
}

impl ConnectionHandler {
    pub fn new(kind: ProcessorKind, ctx: ProcessorContext, codecs: Arc<dyn CodecFactory>) -> Self {
        let global = Arc::new(RequestGroupInfo::new());
        Self {
            kind,
            recycled: RecycledProcessors::new(ctx.config.processor_cache, global.clone()),
            ctx,
            codecs,
            connections: DashMap::new(),
            waiting: Arc::new(WaitingProcessors::new()),
            global,
        }
    }

    pub fn kind(&self) -> ProcessorKind {
        self.kind
    }

    pub fn waiting(&self) -> &Arc<WaitingProcessors> {
        &self.waiting
    }

    pub fn recycled(&self) -> &RecycledProcessors {
        &self.recycled
    }

    pub fn global(&self) -> &Arc<RequestGroupInfo> {
        &self.global
    }

    /// Number of sockets that currently own a processor.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn has_processor(&self, socket: SocketId) -> bool {
        self.connections.contains_key(&socket)
    }

    pub fn stats(&self) -> RequestStats {
        self.global.totals()
    }

    /// Handle one socket event.
    ///
    /// The endpoint must not call this concurrently for the same socket.
    pub fn process(&self, socket: &Arc<dyn SocketWrapper>, event: SocketEvent) -> SocketState {
        let socket_id = socket.id();
        trace!(socket = %socket_id, ?event, "processing socket event");

        let existing = self
            .connections
            .remove(&socket_id)
            .map(|(_, processor)| processor.into_inner());

        // A timeout only matters for a suspended request or an upgraded
        // connection, and only for the suspension it was raised for
        if event == SocketEvent::Timeout {
            let ignore = match &existing {
                None => true,
                Some(p) => {
                    (!p.is_async() && !p.is_upgrade())
                        || (p.is_async() && !p.check_async_timeout_generation())
                }
            };
            if ignore {
                if let Some(processor) = existing {
                    self.connections.insert(socket_id, Mutex::new(processor));
                }
                return SocketState::Open;
            }
        }

        let mut processor = match existing {
            Some(processor) => {
                self.waiting.remove(&processor.id());
                processor
            }
            None if matches!(event, SocketEvent::Disconnect | SocketEvent::Error) => {
                // Nothing to do: the socket closed before it was ever processed
                return SocketState::Closed;
            }
            None => match self.acquire(socket) {
                Ok(Some(processor)) => processor,
                Ok(None) => return SocketState::Closed,
                Err(e) => {
                    self.log_failure(socket_id, &e);
                    return SocketState::Closed;
                }
            },
        };

        let state = match self.drive(socket, &mut processor, event) {
            Ok(state) => state,
            Err(e) => {
                self.log_failure(socket_id, &e);
                SocketState::Closed
            }
        };
        trace!(socket = %socket_id, ?state, "socket event processed");

        match state {
            SocketState::Long => {
                if !processor.is_async() {
                    socket.register_read_interest();
                }
                self.park(socket_id, processor, true);
            }
            SocketState::Open => {
                self.release(processor);
                socket.register_read_interest();
            }
            SocketState::Sendfile | SocketState::Suspended | SocketState::AsyncIo => {
                self.connections.insert(socket_id, Mutex::new(processor));
            }
            SocketState::Upgraded => {
                let long_poll = event != SocketEvent::OpenWrite;
                if long_poll && !processor.is_async() {
                    socket.register_read_interest();
                }
                self.park(socket_id, processor, long_poll);
            }
            _ => {
                if processor.is_upgrade() {
                    processor.destroy_upgrade();
                }
                self.release(processor);
            }
        }

        state
    }

    /// Keep the processor mapped, tracking it for timeouts when it waits.
    fn park(&self, socket_id: SocketId, processor: ProtocolProcessor, track: bool) {
        let waiting = if track && (processor.is_async() || processor.is_upgrade()) {
            processor.timeout_handle().map(|h| (processor.id(), h))
        } else {
            None
        };
        // Mapped before tracked, so a timeout can always find it
        self.connections.insert(socket_id, Mutex::new(processor));
        if let Some((id, handle)) = waiting {
            self.waiting.add(id, handle);
        }
    }

    fn drive(
        &self,
        socket: &Arc<dyn SocketWrapper>,
        processor: &mut ProtocolProcessor,
        event: SocketEvent,
    ) -> Result<SocketState> {
        loop {
            let state = processor.process(socket, event)?;
            if state != SocketState::Upgrading {
                return Ok(state);
            }

            let token = processor.take_upgrade_token();
            let leftover = processor.take_leftover_input();

            let next = match token {
                Some(token) => {
                    debug!(socket = %socket.id(), protocol = %token.protocol, "upgrading connection");
                    token.into_processor()
                }
                None => match self.ctx.upgrades.by_name("h2c") {
                    Some(protocol) => {
                        debug!(socket = %socket.id(), "switching to h2c");
                        protocol.processor(socket, &self.ctx.adapter)?
                    }
                    None => {
                        debug!(socket = %socket.id(), "h2c preface received but no h2c protocol registered");
                        return Ok(SocketState::Closed);
                    }
                },
            };

            let previous = std::mem::replace(processor, next);
            self.release(previous);

            if !leftover.is_empty() {
                trace!(socket = %socket.id(), bytes = leftover.len(), "replaying leftover input");
                socket.unread(leftover);
            }
            processor.init_upgrade(socket)?;
        }
    }

    /// Find the processor for a socket that has none.
    fn acquire(&self, socket: &Arc<dyn SocketWrapper>) -> Result<Option<ProtocolProcessor>> {
        if let Some(negotiated) = socket.negotiated_protocol() {
            if let Some(protocol) = self.ctx.upgrades.by_alpn(&negotiated) {
                let mut processor = protocol.processor(socket, &self.ctx.adapter)?;
                processor.init_upgrade(socket)?;
                debug!(socket = %socket.id(), protocol = %negotiated, "ALPN selected protocol");
                return Ok(Some(processor));
            }
            if negotiated != "http/1.1" {
                debug!(socket = %socket.id(), protocol = %negotiated, "unsupported ALPN protocol");
                return Ok(None);
            }
        }

        if let Some(processor) = self.recycled.pop() {
            trace!(processor = %processor.id(), "reusing pooled processor");
            return Ok(Some(processor));
        }

        Ok(Some(self.create_processor()))
    }

    fn create_processor(&self) -> ProtocolProcessor {
        let codec = self.codecs.create();
        let processor = match self.kind {
            ProcessorKind::Http11 => {
                ProtocolProcessor::Http11(Http11Processor::new(self.ctx.clone(), codec))
            }
            ProcessorKind::Ajp => ProtocolProcessor::Ajp(AjpProcessor::new(self.ctx.clone(), codec)),
        };
        if let Some(info) = processor.request_info() {
            self.global.register(info);
        }
        debug!(processor = %processor.id(), kind = self.kind.name(), "created processor");
        processor
    }

    /// Recycle a processor and return it to the pool when it can be reused.
    fn release(&self, mut processor: ProtocolProcessor) {
        processor.recycle();
        self.waiting.remove(&processor.id());
        match processor {
            ProtocolProcessor::Http11(_) | ProtocolProcessor::Ajp(_) => {
                self.recycled.push(processor);
            }
            other => {
                if let Some(info) = other.request_info() {
                    self.global.unregister(&info);
                }
                trace!(processor = %other.id(), kind = other.kind(), "dropping processor");
            }
        }
    }

    /// The lower layer closed the socket.
    pub fn release_socket(&self, socket: SocketId) {
        if let Some((_, processor)) = self.connections.remove(&socket) {
            let mut processor = processor.into_inner();
            if processor.is_upgrade() {
                processor.destroy_upgrade();
            }
            self.release(processor);
        }
    }

    /// Tell every mapped processor that the connector is pausing.
    pub fn pause(&self) {
        for entry in self.connections.iter() {
            entry.value().lock().pause();
        }
    }

    /// Drop everything parked in the pool.
    pub fn recycle(&self) {
        self.recycled.clear();
    }

    fn log_failure(&self, socket: SocketId, e: &Error) {
        match e {
            Error::Io(_) | Error::StreamClosed(_) | Error::Protocol(_) => {
                debug!(%socket, error = %e, "connection closed after error");
            }
            _ => error!(%socket, error = %e, "error processing socket"),
        }
    }
}

impl std::fmt::Debug for ConnectionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandler")
            .field("kind", &self.kind)
            .field("connections", &self.connection_count())
            .field("recycled", &self.recycled)
            .field("waiting", &self.waiting)
            .finish()
    }
}
