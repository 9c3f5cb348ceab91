//! Socket-facing vocabulary
//!
//! The core never performs raw I/O. It reacts to [`SocketEvent`]s delivered by
//! the endpoint, returns a [`SocketState`] verdict, and asks the endpoint for
//! more work through the [`SocketWrapper`] trait.

use crate::error::Result;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// Socket Identity
// ============================================================================

/// Identity of a live socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

static SOCKET_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

impl SocketId {
    /// Allocate a fresh process-wide identifier.
    pub fn next() -> Self {
        Self(SOCKET_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SocketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "socket-{}", self.0)
    }
}

// ============================================================================
// Socket Events
// ============================================================================

/// Events delivered by the endpoint.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketEvent {
    /// Data is available to read
    OpenRead = 0,
    /// The socket is ready for writing
    OpenWrite = 1,
    /// The endpoint is stopping
    Stop = 2,
    /// A read, write or async timeout fired
    Timeout = 3,
    /// The client disconnected
    Disconnect = 4,
    /// An error occurred on the socket
    Error = 5,
    /// An outgoing connection attempt failed
    ConnectFail = 6,
}

// ============================================================================
// Socket State
// ============================================================================

/// Verdict returned from processing a socket event.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketState {
    /// Keep-alive: ready for the next request
    Open = 0,
    /// Close the socket
    Closed = 1,
    /// Request in progress; wait for more events
    Long = 2,
    /// Async processing ended; drive the processor again
    AsyncEnd = 3,
    /// A file transfer owns the socket
    Sendfile = 4,
    /// Switching protocols
    Upgrading = 5,
    /// An upgrade handler owns the socket
    Upgraded = 6,
    /// Processing suspended; the processor resumes it
    Suspended = 7,
    /// Non-blocking I/O in progress
    AsyncIo = 8,
}

impl SocketState {
    /// Whether the socket should be closed.
    #[inline]
    pub const fn is_closed(self) -> bool {
        matches!(self, Self::Closed)
    }
}

// ============================================================================
// Dispatch Type
// ============================================================================

/// Non-blocking I/O work queued for the processor.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchType {
    NonBlockingRead = 0,
    NonBlockingWrite = 1,
}

impl DispatchType {
    /// The socket event the dispatch is delivered as.
    pub const fn event(self) -> SocketEvent {
        match self {
            Self::NonBlockingRead => SocketEvent::OpenRead,
            Self::NonBlockingWrite => SocketEvent::OpenWrite,
        }
    }
}

// ============================================================================
// Socket Wrapper
// ============================================================================

/// Unit of work handed to the endpoint's worker pool.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// What the core needs from the endpoint's socket abstraction.
///
/// The endpoint must serialise `process` calls for a given socket: at most
/// one worker drives a socket's processor at a time.
pub trait SocketWrapper: Send + Sync {
    fn id(&self) -> SocketId;

    /// Protocol agreed during the TLS handshake, if any.
    fn negotiated_protocol(&self) -> Option<String> {
        None
    }

    fn register_read_interest(&self);

    fn register_write_interest(&self);

    /// Ask the endpoint to process `event` for this socket.
    ///
    /// With `dispatch` set the event is handed to a worker; otherwise the
    /// endpoint may process it on the calling thread. Returns `false` when
    /// the event could not be scheduled.
    fn process_socket(&self, event: SocketEvent, dispatch: bool) -> bool;

    /// Non-blocking read of up to `max` bytes. An empty result means no
    /// data is available right now.
    ///
    /// Used by codecs and upgrade handlers; the core itself never reads.
    fn read(&self, max: usize) -> Result<Bytes>;

    /// Non-blocking write, returning the number of bytes accepted.
    fn write(&self, data: &[u8]) -> Result<usize>;

    /// Push bytes back so that the next read returns them first.
    fn unread(&self, data: Bytes);

    /// Run `task` on the endpoint's worker pool.
    fn execute(&self, task: Task) -> Result<()>;

    /// Record one more request served on this connection and return the
    /// total so far. Endpoints that do not track requests return 0, which
    /// disables the keep-alive request limit.
    fn count_request(&self) -> u32 {
        0
    }

    /// Whether buffered input is waiting to be read (pipelining).
    fn has_data_to_read(&self) -> bool {
        false
    }

    /// Whether a non-blocking read issued by the endpoint is still in flight.
    fn is_read_pending(&self) -> bool {
        false
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn close(&self);

    fn is_closed(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_id_unique() {
        let a = SocketId::next();
        let b = SocketId::next();
        assert_ne!(a, b);
        assert_eq!(SocketId::from_raw(a.as_u64()), a);
        assert_eq!(SocketId::from_raw(7).to_string(), "socket-7");
    }

    #[test]
    fn test_dispatch_type_events() {
        assert_eq!(DispatchType::NonBlockingRead.event(), SocketEvent::OpenRead);
        assert_eq!(DispatchType::NonBlockingWrite.event(), SocketEvent::OpenWrite);
    }

    #[test]
    fn test_socket_state_sizes() {
        assert_eq!(std::mem::size_of::<SocketState>(), 1);
        assert_eq!(std::mem::size_of::<SocketEvent>(), 1);
        assert!(SocketState::Closed.is_closed());
        assert!(!SocketState::Open.is_closed());
    }
}
