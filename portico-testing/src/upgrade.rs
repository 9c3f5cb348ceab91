// Upgrade protocol test doubles

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use portico_core::{
    Adapter, HttpUpgradeHandler, InternalUpgradeHandler, Request, Result, SocketEvent,
    SocketState, SocketWrapper, UpgradeConnection, UpgradeProtocol,
};
use std::sync::Arc;

/// Something an upgrade handler went through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeEvent {
    /// A handler was created; `from_request` is false for ALPN and h2c
    Created { from_request: bool },
    Init,
    Dispatch(SocketEvent),
    /// Bytes the handler read on a dispatch
    Read(Bytes),
    Paused,
    Destroyed,
}

/// Shared record of every handler a protocol created.
#[derive(Debug, Default, Clone)]
pub struct UpgradeLog {
    events: Arc<Mutex<Vec<UpgradeEvent>>>,
}

impl UpgradeLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: UpgradeEvent) {
        self.events.lock().push(event);
    }

    pub fn events(&self) -> Vec<UpgradeEvent> {
        self.events.lock().clone()
    }

    /// Concatenation of every [`UpgradeEvent::Read`].
    pub fn bytes_read(&self) -> Bytes {
        let mut all = BytesMut::new();
        for event in self.events.lock().iter() {
            if let UpgradeEvent::Read(data) = event {
                all.extend_from_slice(data);
            }
        }
        all.freeze()
    }

    pub fn contains(&self, event: &UpgradeEvent) -> bool {
        self.events.lock().contains(event)
    }
}

/// Upgrade protocol reachable by `Upgrade:` name and/or ALPN.
pub struct MockUpgradeProtocol {
    name: Option<String>,
    alpn: Option<String>,
    accept: bool,
    log: UpgradeLog,
}

impl MockUpgradeProtocol {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            alpn: None,
            accept: true,
            log: UpgradeLog::new(),
        }
    }

    /// A protocol that can only be selected through ALPN.
    pub fn alpn_only(alpn: impl Into<String>) -> Self {
        Self {
            name: None,
            alpn: Some(alpn.into()),
            accept: true,
            log: UpgradeLog::new(),
        }
    }

    pub fn with_alpn(mut self, alpn: impl Into<String>) -> Self {
        self.alpn = Some(alpn.into());
        self
    }

    /// Refuse every `Upgrade:` request.
    pub fn rejecting(mut self) -> Self {
        self.accept = false;
        self
    }

    pub fn log(&self) -> UpgradeLog {
        self.log.clone()
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }
}

impl UpgradeProtocol for MockUpgradeProtocol {
    fn http_upgrade_name(&self, _secure: bool) -> Option<&str> {
        self.name.as_deref()
    }

    fn alpn_name(&self) -> Option<&str> {
        self.alpn.as_deref()
    }

    fn internal_upgrade_handler(
        &self,
        _socket: &Arc<dyn SocketWrapper>,
        _adapter: &Arc<dyn Adapter>,
        request: Option<&Request>,
    ) -> Result<Box<dyn InternalUpgradeHandler>> {
        self.log.push(UpgradeEvent::Created {
            from_request: request.is_some(),
        });
        Ok(Box::new(RecordingUpgradeHandler::new(self.log.clone())))
    }

    fn accept(&self, _request: &Request) -> bool {
        self.accept
    }
}

/// Internal handler that drains the socket on every read event.
pub struct RecordingUpgradeHandler {
    log: UpgradeLog,
    socket: Option<Arc<dyn SocketWrapper>>,
}

impl RecordingUpgradeHandler {
    pub fn new(log: UpgradeLog) -> Self {
        Self { log, socket: None }
    }

    fn drain(&self) -> Result<()> {
        let Some(socket) = &self.socket else {
            return Ok(());
        };
        loop {
            let data = socket.read(4096)?;
            if data.is_empty() {
                return Ok(());
            }
            self.log.push(UpgradeEvent::Read(data));
        }
    }
}

impl InternalUpgradeHandler for RecordingUpgradeHandler {
    fn init(&mut self, socket: Arc<dyn SocketWrapper>) -> Result<()> {
        self.socket = Some(socket);
        self.log.push(UpgradeEvent::Init);
        Ok(())
    }

    fn upgrade_dispatch(&mut self, event: SocketEvent) -> Result<SocketState> {
        self.log.push(UpgradeEvent::Dispatch(event));
        match event {
            SocketEvent::OpenRead => {
                self.drain()?;
                Ok(SocketState::Upgraded)
            }
            SocketEvent::OpenWrite | SocketEvent::Timeout => Ok(SocketState::Upgraded),
            _ => Ok(SocketState::Closed),
        }
    }

    fn pause(&self) {
        self.log.push(UpgradeEvent::Paused);
    }

    fn destroy(&mut self) {
        self.socket = None;
        self.log.push(UpgradeEvent::Destroyed);
    }
}

/// Application-side handler echoing input back to the peer.
pub struct EchoUpgradeHandler {
    log: UpgradeLog,
    connection: Option<UpgradeConnection>,
    closed: bool,
}

impl EchoUpgradeHandler {
    pub fn new(log: UpgradeLog) -> Self {
        Self {
            log,
            connection: None,
            closed: false,
        }
    }
}

impl HttpUpgradeHandler for EchoUpgradeHandler {
    fn init(&mut self, connection: UpgradeConnection) -> Result<()> {
        self.connection = Some(connection);
        self.log.push(UpgradeEvent::Init);
        Ok(())
    }

    fn on_data_available(&mut self) -> Result<()> {
        self.log.push(UpgradeEvent::Dispatch(SocketEvent::OpenRead));
        let Some(connection) = &self.connection else {
            return Ok(());
        };
        let data = connection.read(4096)?;
        if data.is_empty() {
            // Peer finished sending
            self.closed = true;
            return Ok(());
        }
        connection.write(&data)?;
        self.log.push(UpgradeEvent::Read(data));
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn destroy(&mut self) {
        self.connection = None;
        self.log.push(UpgradeEvent::Destroyed);
    }
}
