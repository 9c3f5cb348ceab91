//! Action vocabulary
//!
//! Request and response code never calls into a protocol implementation
//! directly. It sends an [`Action`] through the [`ActionHook`] of the
//! processor that owns the exchange and reads back an [`ActionReply`].
//!
//! ```rust,ignore
//! use portico_core::action::{Action, ThreadOrigin};
//!
//! // On the container thread, inside Adapter::service
//! request.action(Action::AsyncStart(callback))?;
//!
//! // Later, from any thread
//! let handle = request.async_handle()?;
//! std::thread::spawn(move || handle.complete());
//! ```

use crate::async_state::AsyncCallback;
use crate::error::{Error, Result};
use crate::socket::{SocketState, Task};
use crate::upgrade::UpgradeToken;
use bytes::Bytes;
use http::{HeaderMap, Method};
use std::net::SocketAddr;
use std::sync::Arc;

pub use crate::async_state::ThreadOrigin;

/// A server-initiated request (HTTP/2 push).
#[derive(Debug, Clone)]
pub struct PushRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
}

/// An intent signalled by request/response code.
pub enum Action<'a> {
    // Response lifecycle
    /// Write the response head
    Commit { status: u16, headers: &'a HeaderMap },
    /// Finish the response
    Close,
    /// Send an interim 100 acknowledgement
    Ack,
    /// Flush buffered response bytes
    ClientFlush,

    // Request body
    /// Bytes that can be read without blocking
    Available { do_read: bool },
    /// Replace the request body with the given bytes
    ReqSetBodyReplay(Bytes),
    RequestBodyFullyRead,
    /// Stop swallowing unread request input; the connection closes afterwards
    DisableSwallowInput,

    // Error state
    IsError,
    IsIoAllowed,
    /// Abandon the response immediately
    CloseNow { cause: Option<&'a Error> },

    // Connection attributes
    ReqRemoteAddr,
    ReqLocalAddr,
    ConnectionId,
    StreamId,

    // Async processing
    AsyncStart(Arc<dyn AsyncCallback>),
    AsyncComplete,
    AsyncDispatch,
    AsyncDispatched,
    AsyncError,
    AsyncRun(Task),
    /// Suspend timeout in milliseconds; zero or negative disables
    AsyncSetTimeout(i64),
    AsyncTimeout,
    AsyncIsAsync,
    AsyncIsStarted,
    AsyncIsCompleting,
    AsyncIsDispatching,
    AsyncIsTimingOut,
    AsyncIsError,
    AsyncPostProcess,

    // Non-blocking I/O
    NbReadInterest,
    NbWriteInterest,
    DispatchRead,
    DispatchWrite,
    DispatchExecute,

    // Protocol
    Upgrade(UpgradeToken),
    IsPushSupported,
    PushRequest(PushRequest),
    IsTrailerFieldsReady,
    IsTrailerFieldsSupported,
}

impl Action<'_> {
    /// Name for logging and error reporting.
    pub fn name(&self) -> &'static str {
        match self {
            Action::Commit { .. } => "commit",
            Action::Close => "close",
            Action::Ack => "ack",
            Action::ClientFlush => "client_flush",
            Action::Available { .. } => "available",
            Action::ReqSetBodyReplay(_) => "req_set_body_replay",
            Action::RequestBodyFullyRead => "request_body_fully_read",
            Action::DisableSwallowInput => "disable_swallow_input",
            Action::IsError => "is_error",
            Action::IsIoAllowed => "is_io_allowed",
            Action::CloseNow { .. } => "close_now",
            Action::ReqRemoteAddr => "req_remote_addr",
            Action::ReqLocalAddr => "req_local_addr",
            Action::ConnectionId => "connection_id",
            Action::StreamId => "stream_id",
            Action::AsyncStart(_) => "async_start",
            Action::AsyncComplete => "async_complete",
            Action::AsyncDispatch => "async_dispatch",
            Action::AsyncDispatched => "async_dispatched",
            Action::AsyncError => "async_error",
            Action::AsyncRun(_) => "async_run",
            Action::AsyncSetTimeout(_) => "async_set_timeout",
            Action::AsyncTimeout => "async_timeout",
            Action::AsyncIsAsync => "async_is_async",
            Action::AsyncIsStarted => "async_is_started",
            Action::AsyncIsCompleting => "async_is_completing",
            Action::AsyncIsDispatching => "async_is_dispatching",
            Action::AsyncIsTimingOut => "async_is_timing_out",
            Action::AsyncIsError => "async_is_error",
            Action::AsyncPostProcess => "async_post_process",
            Action::NbReadInterest => "nb_read_interest",
            Action::NbWriteInterest => "nb_write_interest",
            Action::DispatchRead => "dispatch_read",
            Action::DispatchWrite => "dispatch_write",
            Action::DispatchExecute => "dispatch_execute",
            Action::Upgrade(_) => "upgrade",
            Action::IsPushSupported => "is_push_supported",
            Action::PushRequest(_) => "push_request",
            Action::IsTrailerFieldsReady => "is_trailer_fields_ready",
            Action::IsTrailerFieldsSupported => "is_trailer_fields_supported",
        }
    }
}

impl std::fmt::Debug for Action<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionReply {
    Done,
    Flag(bool),
    Count(usize),
    Text(Option<String>),
    Addr(Option<SocketAddr>),
    State(SocketState),
}

impl ActionReply {
    /// The boolean answer of a query action; `false` for any other reply.
    pub fn flag(&self) -> bool {
        matches!(self, ActionReply::Flag(true))
    }

    pub fn count(&self) -> usize {
        match self {
            ActionReply::Count(n) => *n,
            _ => 0,
        }
    }

    pub fn text(self) -> Option<String> {
        match self {
            ActionReply::Text(t) => t,
            _ => None,
        }
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        match self {
            ActionReply::Addr(a) => *a,
            _ => None,
        }
    }
}

/// Receiver of actions; implemented by the processor that owns an exchange.
pub trait ActionHook: Send + Sync {
    fn action(&self, action: Action<'_>, origin: ThreadOrigin) -> Result<ActionReply>;

    /// Generation of the most recent async suspension, for hooks that track one.
    fn async_generation(&self) -> Option<u64> {
        None
    }

    /// Act on behalf of the suspension numbered `generation`.
    ///
    /// Hooks that track suspensions reject the action with
    /// [`Error::IllegalState`] once that suspension has ended.
    fn suspension_action(
        &self,
        action: Action<'_>,
        origin: ThreadOrigin,
        generation: u64,
    ) -> Result<ActionReply> {
        let _ = generation;
        self.action(action, origin)
    }
}

// ============================================================================
// Async Handle
// ============================================================================

/// Cloneable handle for driving a suspended request from another thread.
///
/// Handles obtained from a request act as [`ThreadOrigin::Foreign`] unless
/// rebound with [`AsyncHandle::on_container`].
///
/// A handle is bound to the suspension that was current when it was created.
/// Once that request completes and its processor moves on, every action
/// through the handle fails with [`Error::IllegalState`].
#[derive(Clone)]
pub struct AsyncHandle {
    hook: Arc<dyn ActionHook>,
    origin: ThreadOrigin,
    generation: Option<u64>,
}

impl AsyncHandle {
    pub fn new(hook: Arc<dyn ActionHook>) -> Self {
        let generation = hook.async_generation();
        Self {
            hook,
            origin: ThreadOrigin::Foreign,
            generation,
        }
    }

    /// Use the handle from the container thread that drives the processor.
    pub fn on_container(mut self) -> Self {
        self.origin = ThreadOrigin::Container;
        self
    }

    pub fn origin(&self) -> ThreadOrigin {
        self.origin
    }

    /// The suspension this handle drives, when the processor tracks one.
    pub fn generation(&self) -> Option<u64> {
        self.generation
    }

    pub fn action(&self, action: Action<'_>) -> Result<ActionReply> {
        match self.generation {
            Some(generation) => self.hook.suspension_action(action, self.origin, generation),
            None => self.hook.action(action, self.origin),
        }
    }

    pub fn complete(&self) -> Result<()> {
        self.action(Action::AsyncComplete).map(|_| ())
    }

    pub fn dispatch(&self) -> Result<()> {
        self.action(Action::AsyncDispatch).map(|_| ())
    }

    pub fn error(&self) -> Result<()> {
        self.action(Action::AsyncError).map(|_| ())
    }

    /// Run `task` on a container worker while the request is suspended.
    pub fn run<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.action(Action::AsyncRun(Box::new(task))).map(|_| ())
    }

    pub fn set_timeout(&self, millis: i64) -> Result<()> {
        self.action(Action::AsyncSetTimeout(millis)).map(|_| ())
    }

    pub fn is_async(&self) -> Result<bool> {
        self.action(Action::AsyncIsAsync).map(|r| r.flag())
    }
}

impl std::fmt::Debug for AsyncHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncHandle")
            .field("origin", &self.origin)
            .field("generation", &self.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingHook {
        calls: Mutex<Vec<(String, ThreadOrigin)>>,
    }

    impl ActionHook for RecordingHook {
        fn action(&self, action: Action<'_>, origin: ThreadOrigin) -> Result<ActionReply> {
            self.calls.lock().push((action.name().to_string(), origin));
            Ok(match action {
                Action::AsyncIsAsync => ActionReply::Flag(true),
                _ => ActionReply::Done,
            })
        }
    }

    #[test]
    fn test_handle_defaults_to_foreign() {
        let hook = Arc::new(RecordingHook::default());
        let handle = AsyncHandle::new(hook.clone());

        handle.complete().unwrap();
        assert!(handle.is_async().unwrap());

        let container = handle.clone().on_container();
        container.dispatch().unwrap();

        let calls = hook.calls.lock();
        assert_eq!(calls[0], ("async_complete".to_string(), ThreadOrigin::Foreign));
        assert_eq!(calls[1], ("async_is_async".to_string(), ThreadOrigin::Foreign));
        assert_eq!(calls[2], ("async_dispatch".to_string(), ThreadOrigin::Container));
    }

    #[test]
    fn test_reply_accessors() {
        assert!(ActionReply::Flag(true).flag());
        assert!(!ActionReply::Done.flag());
        assert_eq!(ActionReply::Count(5).count(), 5);
        assert_eq!(ActionReply::Done.count(), 0);
        assert_eq!(
            ActionReply::Text(Some("1".to_string())).text(),
            Some("1".to_string())
        );
        assert_eq!(ActionReply::Addr(None).addr(), None);
    }
}
