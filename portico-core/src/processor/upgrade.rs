// Processors that own a connection after a protocol upgrade

use super::{
    AsyncTimeoutHandle, DispatchQueue, LightProcessor, Processor, ProcessorId,
};
use crate::error::{Error, Result};
use crate::socket::{SocketEvent, SocketState, SocketWrapper};
use crate::stats::RequestInfo;
use crate::upgrade::{HttpUpgradeHandler, InternalUpgradeHandler, UpgradeConnection, UpgradeToken};
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

// ============================================================================
// Internal
// ============================================================================

/// Drives an [`InternalUpgradeHandler`] with every socket event.
pub struct InternalUpgradeProcessor {
    id: ProcessorId,
    handler: Box<dyn InternalUpgradeHandler>,
    dispatches: DispatchQueue,
}

impl InternalUpgradeProcessor {
    pub fn new(handler: Box<dyn InternalUpgradeHandler>) -> Self {
        Self {
            id: ProcessorId::new(),
            handler,
            dispatches: DispatchQueue::new(),
        }
    }

    pub fn init(&mut self, socket: &Arc<dyn SocketWrapper>) -> Result<()> {
        self.handler.init(socket.clone())
    }

    pub fn has_async_io(&self) -> bool {
        self.handler.has_async_io()
    }
}

impl LightProcessor for InternalUpgradeProcessor {
    fn dispatch_queue(&self) -> &DispatchQueue {
        &self.dispatches
    }

    fn service(&mut self) -> Result<SocketState> {
        Err(Error::Upgrade("upgraded connections are never serviced".to_string()))
    }

    fn dispatch(&mut self, event: SocketEvent) -> Result<SocketState> {
        self.handler.upgrade_dispatch(event)
    }

    fn async_post_process(&mut self) -> Result<SocketState> {
        Ok(SocketState::Upgraded)
    }

    fn is_async(&self) -> bool {
        false
    }

    fn is_upgrade(&self) -> bool {
        true
    }
}

impl Processor for InternalUpgradeProcessor {
    fn id(&self) -> ProcessorId {
        self.id
    }

    fn process(
        &mut self,
        _socket: &Arc<dyn SocketWrapper>,
        event: SocketEvent,
    ) -> Result<SocketState> {
        self.drive(event)
    }

    fn take_upgrade_token(&mut self) -> Option<UpgradeToken> {
        None
    }

    fn take_leftover_input(&mut self) -> Bytes {
        Bytes::new()
    }

    fn is_async(&self) -> bool {
        false
    }

    fn is_upgrade(&self) -> bool {
        true
    }

    fn timeout_handle(&self) -> Option<Arc<dyn AsyncTimeoutHandle>> {
        self.handler.timeout_handle()
    }

    fn check_async_timeout_generation(&self) -> bool {
        self.handler.check_async_timeout_generation()
    }

    fn pause(&self) {
        self.handler.pause();
    }

    fn request_info(&self) -> Option<Arc<RequestInfo>> {
        None
    }

    fn recycle(&mut self) {
        self.dispatches.clear();
    }

    fn destroy_upgrade(&mut self) {
        debug!(processor = %self.id, "destroying internal upgrade handler");
        self.handler.destroy();
    }
}

// ============================================================================
// External
// ============================================================================

/// Forwards read and write readiness to an application [`HttpUpgradeHandler`].
pub struct ExternalUpgradeProcessor {
    id: ProcessorId,
    handler: Box<dyn HttpUpgradeHandler>,
    dispatches: DispatchQueue,
}

impl ExternalUpgradeProcessor {
    pub fn new(handler: Box<dyn HttpUpgradeHandler>) -> Self {
        Self {
            id: ProcessorId::new(),
            handler,
            dispatches: DispatchQueue::new(),
        }
    }

    pub fn init(&mut self, socket: &Arc<dyn SocketWrapper>) -> Result<()> {
        self.handler.init(UpgradeConnection::new(socket.clone()))
    }
}

impl LightProcessor for ExternalUpgradeProcessor {
    fn dispatch_queue(&self) -> &DispatchQueue {
        &self.dispatches
    }

    fn service(&mut self) -> Result<SocketState> {
        Err(Error::Upgrade("upgraded connections are never serviced".to_string()))
    }

    fn dispatch(&mut self, event: SocketEvent) -> Result<SocketState> {
        match event {
            SocketEvent::OpenRead => self.handler.on_data_available()?,
            SocketEvent::OpenWrite => self.handler.on_write_possible()?,
            SocketEvent::Stop => {
                self.handler.on_stop();
                return Ok(SocketState::Closed);
            }
            _ => return Ok(SocketState::Closed),
        }

        Ok(if self.handler.is_closed() {
            SocketState::Closed
        } else {
            SocketState::Upgraded
        })
    }

    fn async_post_process(&mut self) -> Result<SocketState> {
        Ok(SocketState::Upgraded)
    }

    fn is_async(&self) -> bool {
        false
    }

    fn is_upgrade(&self) -> bool {
        true
    }
}

impl Processor for ExternalUpgradeProcessor {
    fn id(&self) -> ProcessorId {
        self.id
    }

    fn process(
        &mut self,
        _socket: &Arc<dyn SocketWrapper>,
        event: SocketEvent,
    ) -> Result<SocketState> {
        self.drive(event)
    }

    fn take_upgrade_token(&mut self) -> Option<UpgradeToken> {
        None
    }

    fn take_leftover_input(&mut self) -> Bytes {
        Bytes::new()
    }

    fn is_async(&self) -> bool {
        false
    }

    fn is_upgrade(&self) -> bool {
        true
    }

    fn timeout_handle(&self) -> Option<Arc<dyn AsyncTimeoutHandle>> {
        None
    }

    fn check_async_timeout_generation(&self) -> bool {
        false
    }

    fn pause(&self) {}

    fn request_info(&self) -> Option<Arc<RequestInfo>> {
        None
    }

    fn recycle(&mut self) {
        self.dispatches.clear();
    }

    fn destroy_upgrade(&mut self) {
        debug!(processor = %self.id, "destroying external upgrade handler");
        self.handler.destroy();
    }
}
