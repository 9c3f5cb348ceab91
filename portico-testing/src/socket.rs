// In-memory socket for driving processors without a network

use crate::endpoint::Work;
use bytes::{Bytes, BytesMut};
use crossbeam::channel::Sender;
use parking_lot::{Condvar, Mutex, MutexGuard};
use portico_core::{Error, Result, SocketEvent, SocketId, SocketState, SocketWrapper, Task};
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// A socket whose input is supplied by the test and whose every interaction
/// with the core is recorded.
///
/// Detached sockets only record `process_socket` requests and run tasks
/// inline. Once connected to a [`TestEndpoint`](crate::TestEndpoint) both go
/// to the endpoint's workers.
pub struct MockSocket {
    id: SocketId,
    negotiated: Option<String>,
    remote: Option<SocketAddr>,
    input: Mutex<BytesMut>,
    output: Mutex<BytesMut>,
    requested: Mutex<Vec<(SocketEvent, bool)>>,
    verdicts: Mutex<Vec<SocketState>>,
    verdict_changed: Condvar,
    read_interest: AtomicUsize,
    write_interest: AtomicUsize,
    requests: AtomicU32,
    closed: AtomicBool,
    pub(crate) endpoint: OnceLock<Sender<Work>>,
    pub(crate) processing: Mutex<()>,
}

impl MockSocket {
    pub fn new() -> Self {
        Self {
            id: SocketId::next(),
            negotiated: None,
            remote: None,
            input: Mutex::new(BytesMut::new()),
            output: Mutex::new(BytesMut::new()),
            requested: Mutex::new(Vec::new()),
            verdicts: Mutex::new(Vec::new()),
            verdict_changed: Condvar::new(),
            read_interest: AtomicUsize::new(0),
            write_interest: AtomicUsize::new(0),
            requests: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            endpoint: OnceLock::new(),
            processing: Mutex::new(()),
        }
    }

    /// Pretend the TLS handshake selected `protocol`.
    pub fn with_alpn(mut self, protocol: impl Into<String>) -> Self {
        self.negotiated = Some(protocol.into());
        self
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote = Some(addr);
        self
    }

    /// Bytes the peer has sent.
    pub fn push_input(&self, data: &[u8]) {
        self.input.lock().extend_from_slice(data);
    }

    pub fn pending_input(&self) -> usize {
        self.input.lock().len()
    }

    /// Everything written so far.
    pub fn output(&self) -> Bytes {
        self.output.lock().clone().freeze()
    }

    /// `process_socket` requests made by the core, oldest first.
    pub fn requested_events(&self) -> Vec<(SocketEvent, bool)> {
        self.requested.lock().clone()
    }

    pub fn take_requested_events(&self) -> Vec<(SocketEvent, bool)> {
        std::mem::take(&mut *self.requested.lock())
    }

    pub fn read_interest_count(&self) -> usize {
        self.read_interest.load(Ordering::Acquire)
    }

    pub fn write_interest_count(&self) -> usize {
        self.write_interest.load(Ordering::Acquire)
    }

    /// Requests counted against the keep-alive limit.
    pub fn request_count(&self) -> u32 {
        self.requests.load(Ordering::Acquire)
    }

    /// Verdicts the endpoint received for this socket.
    pub fn verdicts(&self) -> Vec<SocketState> {
        self.verdicts.lock().clone()
    }

    pub(crate) fn record_verdict(&self, state: SocketState) {
        self.verdicts.lock().push(state);
        self.verdict_changed.notify_all();
    }

    /// Block until `count` verdicts have been recorded.
    ///
    /// Returns what was recorded by then, possibly fewer on timeout.
    pub fn wait_for_verdicts(&self, count: usize, timeout: Duration) -> Vec<SocketState> {
        let deadline = Instant::now() + timeout;
        let mut verdicts = self.verdicts.lock();
        while verdicts.len() < count {
            if self
                .verdict_changed
                .wait_until(&mut verdicts, deadline)
                .timed_out()
            {
                break;
            }
        }
        verdicts.clone()
    }

    pub(crate) fn lock_processing(&self) -> MutexGuard<'_, ()> {
        self.processing.lock()
    }
}

impl Default for MockSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketWrapper for MockSocket {
    fn id(&self) -> SocketId {
        self.id
    }

    fn negotiated_protocol(&self) -> Option<String> {
        self.negotiated.clone()
    }

    fn register_read_interest(&self) {
        self.read_interest.fetch_add(1, Ordering::AcqRel);
    }

    fn register_write_interest(&self) {
        self.write_interest.fetch_add(1, Ordering::AcqRel);
    }

    fn process_socket(&self, event: SocketEvent, dispatch: bool) -> bool {
        if self.is_closed() {
            return false;
        }
        self.requested.lock().push((event, dispatch));
        match self.endpoint.get() {
            Some(sender) => sender.send(Work::Event(self.id, event)).is_ok(),
            None => true,
        }
    }

    fn read(&self, max: usize) -> Result<Bytes> {
        if self.is_closed() {
            return Err(Error::StreamClosed(format!("{} is closed", self.id)));
        }
        let mut input = self.input.lock();
        let n = max.min(input.len());
        Ok(input.split_to(n).freeze())
    }

    fn write(&self, data: &[u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::StreamClosed(format!("{} is closed", self.id)));
        }
        self.output.lock().extend_from_slice(data);
        Ok(data.len())
    }

    fn unread(&self, data: Bytes) {
        let mut input = self.input.lock();
        let mut replay = BytesMut::with_capacity(data.len() + input.len());
        replay.extend_from_slice(&data);
        replay.extend_from_slice(&input);
        *input = replay;
    }

    fn execute(&self, task: Task) -> Result<()> {
        match self.endpoint.get() {
            Some(sender) => sender
                .send(Work::Task(task))
                .map_err(|_| Error::Adapter("endpoint is shut down".to_string())),
            None => {
                task();
                Ok(())
            }
        }
    }

    fn count_request(&self) -> u32 {
        self.requests.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn has_data_to_read(&self) -> bool {
        !self.input.lock().is_empty()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for MockSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockSocket")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .field("pending_input", &self.pending_input())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_unread_replays_first() {
        let socket = MockSocket::new();
        socket.push_input(b"world");
        socket.unread(Bytes::from_static(b"hello "));
        assert_eq!(socket.read(6).unwrap(), Bytes::from_static(b"hello "));
        assert_eq!(socket.read(64).unwrap(), Bytes::from_static(b"world"));
        assert!(socket.read(64).unwrap().is_empty());
    }

    #[test]
    fn test_detached_records_and_runs_inline() {
        let socket = MockSocket::new();
        assert!(socket.process_socket(SocketEvent::Timeout, true));
        assert_eq!(socket.requested_events(), vec![(SocketEvent::Timeout, true)]);

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        socket
            .execute(Box::new(move || flag.store(true, Ordering::Release)))
            .unwrap();
        assert!(ran.load(Ordering::Acquire));
    }

    #[test]
    fn test_closed_socket_rejects_io() {
        let socket = MockSocket::new();
        socket.close();
        assert!(socket.read(1).is_err());
        assert!(socket.write(b"x").is_err());
        assert!(!socket.process_socket(SocketEvent::OpenRead, true));
    }

    #[test]
    fn test_request_counting() {
        let socket = MockSocket::new();
        assert_eq!(socket.count_request(), 1);
        assert_eq!(socket.count_request(), 2);
        assert_eq!(socket.request_count(), 2);
    }
}
