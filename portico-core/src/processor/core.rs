//! State shared between a processor and the threads acting on its exchange
//!
//! The processor owns the request and response carriers; everything that
//! other threads may touch (async state, error severity, queued dispatches,
//! the codec) lives here behind an `Arc` so that an
//! [`AsyncHandle`](crate::action::AsyncHandle) can reach it from anywhere.

use super::{AsyncTimeoutHandle, DispatchQueue, ProcessorId};
use crate::action::{Action, ActionHook, ActionReply, ThreadOrigin};
use crate::async_state::AsyncStateMachine;
use crate::codec::ExchangeCodec;
use crate::error::{Error, Result};
use crate::error_state::ErrorState;
use crate::socket::{DispatchType, SocketEvent, SocketWrapper, Task};
use crate::stats::RequestInfo;
use crate::upgrade::UpgradeToken;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicU64, Ordering};
use tracing::{debug, trace};

/// Shared half of an HTTP or AJP processor.
pub struct ProcessorCore {
    id: ProcessorId,
    machine: AsyncStateMachine,
    error_state: AtomicU8,
    dispatches: DispatchQueue,
    socket: RwLock<Option<Arc<dyn SocketWrapper>>>,
    // Never held across a call into the adapter
    codec: Mutex<Box<dyn ExchangeCodec>>,
    async_timeout: AtomicI64,
    default_async_timeout: i64,
    timeout_generation: AtomicU64,
    upgrade_token: Mutex<Option<UpgradeToken>>,
    force_error_status: AtomicBool,
    response_error: AtomicBool,
    push_supported: bool,
    request_info: Arc<RequestInfo>,
}

impl ProcessorCore {
    pub fn new(codec: Box<dyn ExchangeCodec>, default_async_timeout: i64) -> Self {
        Self {
            id: ProcessorId::new(),
            machine: AsyncStateMachine::new(),
            error_state: AtomicU8::new(ErrorState::None.as_u8()),
            dispatches: DispatchQueue::new(),
            socket: RwLock::new(None),
            codec: Mutex::new(codec),
            async_timeout: AtomicI64::new(-1),
            default_async_timeout,
            timeout_generation: AtomicU64::new(0),
            upgrade_token: Mutex::new(None),
            force_error_status: AtomicBool::new(false),
            response_error: AtomicBool::new(false),
            push_supported: false,
            request_info: Arc::new(RequestInfo::new()),
        }
    }

    pub fn id(&self) -> ProcessorId {
        self.id
    }

    pub fn machine(&self) -> &AsyncStateMachine {
        &self.machine
    }

    pub fn dispatches(&self) -> &DispatchQueue {
        &self.dispatches
    }

    pub fn request_info(&self) -> &Arc<RequestInfo> {
        &self.request_info
    }

    pub fn is_async(&self) -> bool {
        self.machine.is_async()
    }

    // ------------------------------------------------------------------
    // Socket binding
    // ------------------------------------------------------------------

    pub fn socket(&self) -> Option<Arc<dyn SocketWrapper>> {
        self.socket.read().clone()
    }

    /// Attach to `socket` unless already attached to it.
    pub fn bind(&self, socket: &Arc<dyn SocketWrapper>) {
        let mut slot = self.socket.write();
        if slot.as_ref().is_some_and(|s| s.id() == socket.id()) {
            return;
        }
        self.codec.lock().bind(socket.as_ref());
        *slot = Some(socket.clone());
    }

    /// Run `f` with exclusive access to the codec.
    pub fn with_codec<R>(&self, f: impl FnOnce(&mut dyn ExchangeCodec) -> R) -> R {
        let mut codec = self.codec.lock();
        f(codec.as_mut())
    }

    // ------------------------------------------------------------------
    // Error state
    // ------------------------------------------------------------------

    pub fn error_state(&self) -> ErrorState {
        ErrorState::from_u8(self.error_state.load(Ordering::Acquire))
    }

    /// Escalate the error state.
    ///
    /// When the new state stops I/O that was allowed before, the response
    /// status is forced to 500 (unless the cause is a transport failure). A
    /// failure seen off the container thread while suspended is handed back
    /// to a worker as an `Error` socket event.
    pub fn set_error_state(&self, state: ErrorState, origin: ThreadOrigin, cause: Option<&Error>) {
        let previous = ErrorState::from_u8(self.error_state.fetch_max(state.as_u8(), Ordering::AcqRel));
        let first_error = !self.response_error.swap(true, Ordering::AcqRel);
        let block_io = previous.is_io_allowed() && !state.is_io_allowed();

        debug!(
            processor = %self.id,
            ?previous,
            requested = ?state,
            cause = cause.map(|e| e.to_string()),
            "error state escalated"
        );

        if block_io && !cause.is_some_and(Error::is_io) {
            self.force_error_status.store(true, Ordering::Release);
        }

        if block_io && first_error && !origin.is_container() && self.machine.is_async() {
            match self.machine.must_error() {
                Ok(()) => {
                    self.process_socket_event(SocketEvent::Error, true);
                }
                Err(e) => debug!(processor = %self.id, error = %e, "async error not scheduled"),
            }
        }
    }

    /// Escalate for a transport failure.
    pub fn handle_io_error(&self, error: &Error, origin: ThreadOrigin) {
        let state = match error {
            Error::StreamClosed(_) => ErrorState::CloseNow,
            _ => ErrorState::CloseConnectionNow,
        };
        self.set_error_state(state, origin, Some(error));
    }

    /// Whether an error forced the status to 500. Clears the flag.
    pub fn take_forced_error_status(&self) -> bool {
        self.force_error_status.swap(false, Ordering::AcqRel)
    }

    fn effective_status(&self, status: u16) -> u16 {
        if status < 400 && self.force_error_status.load(Ordering::Acquire) {
            500
        } else {
            status
        }
    }

    fn guard_io(&self, result: Result<()>, origin: ThreadOrigin) -> Result<ActionReply> {
        match result {
            Ok(()) => Ok(ActionReply::Done),
            Err(e) if e.is_io() => {
                self.handle_io_error(&e, origin);
                Ok(ActionReply::Done)
            }
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------
    // Async support
    // ------------------------------------------------------------------

    pub fn async_timeout(&self) -> i64 {
        self.async_timeout.load(Ordering::Acquire)
    }

    pub fn set_async_timeout(&self, millis: i64) {
        let millis = if millis <= 0 { -1 } else { millis };
        self.async_timeout.store(millis, Ordering::Release);
    }

    pub fn check_async_timeout_generation(&self) -> bool {
        self.timeout_generation.load(Ordering::Acquire) == self.machine.current_generation()
    }

    fn do_timeout_async(&self) {
        // Only one timeout per suspension
        self.async_timeout.store(-1, Ordering::Release);
        self.timeout_generation
            .store(self.machine.current_generation(), Ordering::Release);
        debug!(processor = %self.id, "async timeout");
        self.process_socket_event(SocketEvent::Timeout, true);
    }

    fn process_socket_event(&self, event: SocketEvent, dispatch: bool) {
        match self.socket() {
            Some(socket) => {
                if !socket.process_socket(event, dispatch) {
                    debug!(processor = %self.id, ?event, "socket event rejected by endpoint");
                }
            }
            None => debug!(processor = %self.id, ?event, "no socket bound, event dropped"),
        }
    }

    fn execute_dispatches(&self) {
        let Some(socket) = self.socket() else {
            return;
        };
        for dispatch in self.dispatches.take() {
            socket.process_socket(dispatch.event(), false);
        }
    }

    pub fn take_upgrade_token(&self) -> Option<UpgradeToken> {
        self.upgrade_token.lock().take()
    }

    pub fn has_upgrade_token(&self) -> bool {
        self.upgrade_token.lock().is_some()
    }

    // ------------------------------------------------------------------
    // Async actions, optionally bound to one suspension
    // ------------------------------------------------------------------

    fn async_complete(&self, origin: ThreadOrigin, suspension: Option<u64>) -> Result<ActionReply> {
        self.machine.verify_suspension(suspension, "complete")?;
        self.dispatches.clear();
        if self.machine.complete_for(suspension, origin)? {
            self.process_socket_event(SocketEvent::OpenRead, true);
        }
        Ok(ActionReply::Done)
    }

    fn async_dispatch(&self, origin: ThreadOrigin, suspension: Option<u64>) -> Result<ActionReply> {
        if self.machine.dispatch_for(suspension, origin)? {
            self.process_socket_event(SocketEvent::OpenRead, true);
        }
        Ok(ActionReply::Done)
    }

    fn async_error(&self, origin: ThreadOrigin, suspension: Option<u64>) -> Result<ActionReply> {
        if self.machine.error_for(suspension, origin)? {
            self.process_socket_event(SocketEvent::Error, true);
        }
        Ok(ActionReply::Done)
    }

    fn async_run(&self, task: Task, suspension: Option<u64>) -> Result<ActionReply> {
        self.machine.run_for(suspension)?;
        let socket = self.socket().ok_or(Error::ProcessorClosed)?;
        socket.execute(task)?;
        Ok(ActionReply::Done)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Prepare for the next request on the same connection.
    ///
    /// The error state survives; only [`recycle`](Self::recycle) clears it.
    pub fn next_request(&self) {
        self.force_error_status.store(false, Ordering::Release);
        self.response_error.store(false, Ordering::Release);
        self.codec.lock().next_request();
    }

    pub fn recycle(&self) {
        self.error_state.store(ErrorState::None.as_u8(), Ordering::Release);
        self.force_error_status.store(false, Ordering::Release);
        self.response_error.store(false, Ordering::Release);
        self.machine.recycle();
        self.dispatches.clear();
        self.async_timeout.store(-1, Ordering::Release);
        self.codec.lock().recycle();
        *self.upgrade_token.lock() = None;
        *self.socket.write() = None;
    }
}

impl ActionHook for ProcessorCore {
    fn action(&self, action: Action<'_>, origin: ThreadOrigin) -> Result<ActionReply> {
        trace!(processor = %self.id, action = action.name(), ?origin, "action");

        match action {
            // Response lifecycle
            Action::Commit { status, headers } => {
                let status = self.effective_status(status);
                let result = self.codec.lock().write_response_head(status, headers);
                self.guard_io(result, origin)
            }
            Action::Close => {
                let result = self.codec.lock().finish_response();
                self.guard_io(result, origin)
            }
            Action::Ack => {
                if !self.error_state().is_io_allowed() {
                    return Ok(ActionReply::Done);
                }
                let result = self.codec.lock().ack();
                self.guard_io(result, origin)
            }
            Action::ClientFlush => {
                let result = self.codec.lock().flush();
                self.guard_io(result, origin)
            }

            // Request body
            Action::Available { do_read } => {
                Ok(ActionReply::Count(self.codec.lock().available(do_read)))
            }
            Action::ReqSetBodyReplay(body) => {
                self.codec.lock().set_body_replay(body);
                Ok(ActionReply::Done)
            }
            Action::RequestBodyFullyRead => Ok(ActionReply::Flag(
                self.codec.lock().is_request_body_fully_read(),
            )),
            Action::DisableSwallowInput => {
                self.codec.lock().set_swallow_input(false);
                self.set_error_state(ErrorState::CloseClean, origin, None);
                Ok(ActionReply::Done)
            }

            // Error state
            Action::IsError => Ok(ActionReply::Flag(self.error_state().is_error())),
            Action::IsIoAllowed => Ok(ActionReply::Flag(self.error_state().is_io_allowed())),
            Action::CloseNow { cause } => {
                self.codec.lock().set_swallow_response();
                self.set_error_state(ErrorState::CloseNow, origin, cause);
                Ok(ActionReply::Done)
            }

            // Connection attributes
            Action::ReqRemoteAddr => Ok(ActionReply::Addr(
                self.socket().and_then(|s| s.remote_addr()),
            )),
            Action::ReqLocalAddr => Ok(ActionReply::Addr(
                self.socket().and_then(|s| s.local_addr()),
            )),
            Action::ConnectionId => Ok(ActionReply::Text(
                self.socket().map(|s| s.id().to_string()),
            )),
            Action::StreamId => Ok(ActionReply::Text(None)),

            // Async processing
            Action::AsyncStart(callback) => {
                self.machine.start(callback)?;
                self.set_async_timeout(self.default_async_timeout);
                Ok(ActionReply::Done)
            }
            Action::AsyncComplete => self.async_complete(origin, None),
            Action::AsyncDispatch => self.async_dispatch(origin, None),
            Action::AsyncDispatched => {
                self.machine.dispatched()?;
                Ok(ActionReply::Done)
            }
            Action::AsyncError => self.async_error(origin, None),
            Action::AsyncRun(task) => self.async_run(task, None),
            Action::AsyncSetTimeout(millis) => {
                self.set_async_timeout(millis);
                Ok(ActionReply::Done)
            }
            Action::AsyncTimeout => Ok(ActionReply::Flag(self.machine.timeout()?)),
            Action::AsyncIsAsync => Ok(ActionReply::Flag(self.machine.is_async())),
            Action::AsyncIsStarted => Ok(ActionReply::Flag(self.machine.is_async_started())),
            Action::AsyncIsCompleting => Ok(ActionReply::Flag(self.machine.is_completing())),
            Action::AsyncIsDispatching => {
                Ok(ActionReply::Flag(self.machine.is_async_dispatching()))
            }
            Action::AsyncIsTimingOut => Ok(ActionReply::Flag(self.machine.is_async_timing_out())),
            Action::AsyncIsError => Ok(ActionReply::Flag(self.machine.is_async_error())),
            Action::AsyncPostProcess => Ok(ActionReply::State(self.machine.post_process()?)),

            // Non-blocking I/O
            Action::NbReadInterest => {
                let mut codec = self.codec.lock();
                if codec.is_ready_for_read() {
                    return Ok(ActionReply::Flag(true));
                }
                let fully_read = codec.is_request_body_fully_read();
                drop(codec);
                if !fully_read {
                    if let Some(socket) = self.socket() {
                        socket.register_read_interest();
                    }
                }
                Ok(ActionReply::Flag(false))
            }
            Action::NbWriteInterest => {
                let ready = self.codec.lock().is_ready_for_write();
                if !ready {
                    if let Some(socket) = self.socket() {
                        socket.register_write_interest();
                    }
                }
                Ok(ActionReply::Flag(ready))
            }
            Action::DispatchRead => {
                self.dispatches.add(DispatchType::NonBlockingRead);
                Ok(ActionReply::Done)
            }
            Action::DispatchWrite => {
                self.dispatches.add(DispatchType::NonBlockingWrite);
                Ok(ActionReply::Done)
            }
            Action::DispatchExecute => {
                self.execute_dispatches();
                Ok(ActionReply::Done)
            }

            // Protocol
            Action::Upgrade(token) => {
                debug!(processor = %self.id, protocol = %token.protocol, "upgrade requested");
                *self.upgrade_token.lock() = Some(token);
                Ok(ActionReply::Done)
            }
            Action::IsPushSupported => Ok(ActionReply::Flag(self.push_supported)),
            Action::PushRequest(_) => Err(Error::UnsupportedAction("push_request")),
            Action::IsTrailerFieldsReady => Ok(ActionReply::Flag(
                self.codec.lock().is_trailer_fields_ready(),
            )),
            Action::IsTrailerFieldsSupported => Ok(ActionReply::Flag(
                self.codec.lock().is_trailer_fields_supported(),
            )),
        }
    }

    fn async_generation(&self) -> Option<u64> {
        Some(self.machine.current_generation())
    }

    fn suspension_action(
        &self,
        action: Action<'_>,
        origin: ThreadOrigin,
        generation: u64,
    ) -> Result<ActionReply> {
        let suspension = Some(generation);
        match action {
            Action::AsyncComplete => self.async_complete(origin, suspension),
            Action::AsyncDispatch => self.async_dispatch(origin, suspension),
            Action::AsyncError => self.async_error(origin, suspension),
            Action::AsyncRun(task) => self.async_run(task, suspension),
            action => {
                self.machine.verify_suspension(suspension, action.name())?;
                self.action(action, origin)
            }
        }
    }
}

impl AsyncTimeoutHandle for ProcessorCore {
    fn timeout_async(&self, now: i64) {
        if now < 0 {
            self.do_timeout_async();
            return;
        }
        let timeout = self.async_timeout();
        if timeout > 0 {
            if now - self.machine.last_async_start() > timeout {
                self.do_timeout_async();
            }
        } else if !self.machine.is_available() {
            // The async context can no longer be used
            self.do_timeout_async();
        }
    }
}

impl std::fmt::Debug for ProcessorCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorCore")
            .field("id", &self.id)
            .field("machine", &self.machine)
            .field("error_state", &self.error_state())
            .field("async_timeout", &self.async_timeout())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::async_state::{AsyncCallback, AsyncState};
    use crate::codec::ParseStatus;
    use crate::request::Request;
    use crate::socket::{SocketId, Task};
    use bytes::Bytes;
    use http::HeaderMap;

    #[derive(Default)]
    struct NullCodec {
        heads: Arc<Mutex<Vec<u16>>>,
        fail_writes: bool,
    }

    impl ExchangeCodec for NullCodec {
        fn bind(&mut self, _socket: &dyn SocketWrapper) {}
        fn parse_request_head(
            &mut self,
            _socket: &dyn SocketWrapper,
            _request: &mut Request,
            _keep_alive: bool,
        ) -> Result<ParseStatus> {
            Ok(ParseStatus::NeedMoreData)
        }
        fn write_response_head(&mut self, status: u16, _headers: &HeaderMap) -> Result<()> {
            if self.fail_writes {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "broken pipe",
                )));
            }
            self.heads.lock().push(status);
            Ok(())
        }
        fn ack(&mut self) -> Result<()> {
            Ok(())
        }
        fn flush(&mut self) -> Result<()> {
            Ok(())
        }
        fn finish_response(&mut self) -> Result<()> {
            Ok(())
        }
        fn end_request(&mut self) -> Result<()> {
            Ok(())
        }
        fn available(&mut self, _do_read: bool) -> usize {
            0
        }
        fn is_request_body_fully_read(&self) -> bool {
            false
        }
        fn set_body_replay(&mut self, _body: Bytes) {}
        fn set_swallow_input(&mut self, _swallow: bool) {}
        fn set_swallow_response(&mut self) {}
        fn next_request(&mut self) {}
        fn recycle(&mut self) {}
    }

    #[derive(Default)]
    struct EventLog {
        events: Mutex<Vec<(SocketEvent, bool)>>,
        read_interest: AtomicU64,
    }

    impl SocketWrapper for EventLog {
        fn id(&self) -> SocketId {
            SocketId::from_raw(42)
        }
        fn register_read_interest(&self) {
            self.read_interest.fetch_add(1, Ordering::SeqCst);
        }
        fn register_write_interest(&self) {}
        fn process_socket(&self, event: SocketEvent, dispatch: bool) -> bool {
            self.events.lock().push((event, dispatch));
            true
        }
        fn read(&self, _max: usize) -> Result<Bytes> {
            Ok(Bytes::new())
        }
        fn write(&self, data: &[u8]) -> Result<usize> {
            Ok(data.len())
        }
        fn unread(&self, _data: Bytes) {}
        fn execute(&self, task: Task) -> Result<()> {
            task();
            Ok(())
        }
        fn close(&self) {}
        fn is_closed(&self) -> bool {
            false
        }
    }

    struct Noop;

    impl AsyncCallback for Noop {
        fn fire_on_complete(&self) {}
    }

    fn bound(codec: NullCodec) -> (Arc<ProcessorCore>, Arc<EventLog>) {
        let core = Arc::new(ProcessorCore::new(Box::new(codec), 30_000));
        let log = Arc::new(EventLog::default());
        let socket: Arc<dyn SocketWrapper> = log.clone();
        core.bind(&socket);
        (core, log)
    }

    fn suspend(core: &ProcessorCore) {
        core.action(Action::AsyncStart(Arc::new(Noop)), ThreadOrigin::Container)
            .unwrap();
        core.machine().post_process().unwrap();
        assert_eq!(core.machine().state(), AsyncState::Started);
    }

    #[test]
    fn test_commit_applies_forced_status() {
        let codec = NullCodec::default();
        let heads = codec.heads.clone();
        let (core, _log) = bound(codec);

        core.set_error_state(ErrorState::CloseNow, ThreadOrigin::Container, None);
        let headers = HeaderMap::new();
        core.action(Action::Commit { status: 200, headers: &headers }, ThreadOrigin::Container)
            .unwrap();
        core.action(Action::Commit { status: 404, headers: &headers }, ThreadOrigin::Container)
            .unwrap();

        assert_eq!(*heads.lock(), vec![500, 404]);
        assert!(core.take_forced_error_status());
    }

    #[test]
    fn test_io_error_never_forces_status() {
        let (core, _log) = bound(NullCodec {
            fail_writes: true,
            ..Default::default()
        });
        let headers = HeaderMap::new();

        // Write failures are absorbed into the error state
        core.action(Action::Commit { status: 200, headers: &headers }, ThreadOrigin::Container)
            .unwrap();
        assert_eq!(core.error_state(), ErrorState::CloseConnectionNow);
        assert!(!core.take_forced_error_status());
    }

    #[test]
    fn test_stream_closed_maps_to_close_now() {
        let (core, _log) = bound(NullCodec::default());
        core.handle_io_error(&Error::StreamClosed("stream 5".into()), ThreadOrigin::Container);
        assert_eq!(core.error_state(), ErrorState::CloseNow);
    }

    #[test]
    fn test_foreign_error_while_suspended_schedules_error_event() {
        let (core, log) = bound(NullCodec::default());
        suspend(&core);

        core.set_error_state(ErrorState::CloseNow, ThreadOrigin::Foreign, None);
        assert_eq!(core.machine().state(), AsyncState::MustError);
        assert_eq!(*log.events.lock(), vec![(SocketEvent::Error, true)]);

        // Only the first error of a cycle is re-homed
        core.set_error_state(ErrorState::CloseConnectionNow, ThreadOrigin::Foreign, None);
        assert_eq!(log.events.lock().len(), 1);
    }

    #[test]
    fn test_container_error_is_not_rescheduled() {
        let (core, log) = bound(NullCodec::default());
        suspend(&core);
        core.set_error_state(ErrorState::CloseNow, ThreadOrigin::Container, None);
        assert_eq!(core.machine().state(), AsyncState::Started);
        assert!(log.events.lock().is_empty());
    }

    #[test]
    fn test_async_complete_from_foreign_thread_dispatches() {
        let (core, log) = bound(NullCodec::default());
        suspend(&core);
        core.dispatches().add(DispatchType::NonBlockingRead);

        core.action(Action::AsyncComplete, ThreadOrigin::Foreign).unwrap();
        assert_eq!(core.machine().state(), AsyncState::Completing);
        assert!(core.dispatches().is_empty());
        assert_eq!(*log.events.lock(), vec![(SocketEvent::OpenRead, true)]);
    }

    #[test]
    fn test_handle_outlives_its_request() {
        let (core, log) = bound(NullCodec::default());
        suspend(&core);
        let hook: Arc<dyn ActionHook> = core.clone();
        let first = crate::action::AsyncHandle::new(hook.clone());

        first.complete().unwrap();
        core.machine().post_process().unwrap();
        core.recycle();

        // Same processor, next request
        let socket: Arc<dyn SocketWrapper> = log.clone();
        core.bind(&socket);
        suspend(&core);
        log.events.lock().clear();
        core.dispatches().add(DispatchType::NonBlockingRead);

        for result in [first.complete(), first.dispatch(), first.error(), first.run(|| {})] {
            assert!(matches!(result, Err(Error::IllegalState { .. })));
        }
        assert!(first.set_timeout(5).is_err());
        assert_eq!(core.machine().state(), AsyncState::Started);
        assert_eq!(core.async_timeout(), 30_000);
        assert!(!core.dispatches().is_empty());
        assert!(log.events.lock().is_empty());

        let second = crate::action::AsyncHandle::new(hook);
        second.complete().unwrap();
        assert_eq!(*log.events.lock(), vec![(SocketEvent::OpenRead, true)]);
    }

    #[test]
    fn test_illegal_action_fails_loudly() {
        let (core, _log) = bound(NullCodec::default());
        let err = core
            .action(Action::AsyncDispatched, ThreadOrigin::Container)
            .unwrap_err();
        assert!(err.is_contract_violation());

        let err = core
            .action(
                Action::PushRequest(crate::action::PushRequest {
                    method: http::Method::GET,
                    path: "/style.css".into(),
                    headers: HeaderMap::new(),
                }),
                ThreadOrigin::Container,
            )
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedAction("push_request")));
    }

    #[test]
    fn test_timeout_async_rules() {
        let (core, log) = bound(NullCodec::default());
        suspend(&core);
        let start = core.machine().last_async_start();

        // Not yet expired
        core.timeout_async(start + 1_000);
        assert!(log.events.lock().is_empty());

        core.timeout_async(start + 30_001);
        assert_eq!(*log.events.lock(), vec![(SocketEvent::Timeout, true)]);
        assert_eq!(core.async_timeout(), -1);
        assert!(core.check_async_timeout_generation());

        // Disabled after firing while the context is still usable
        core.timeout_async(start + 90_000);
        assert_eq!(log.events.lock().len(), 1);

        // Sentinel always fires
        core.timeout_async(-1);
        assert_eq!(log.events.lock().len(), 2);
    }

    #[test]
    fn test_timeout_generation_goes_stale() {
        let (core, _log) = bound(NullCodec::default());
        suspend(&core);
        core.timeout_async(-1);
        assert!(core.check_async_timeout_generation());

        core.recycle();
        core.action(Action::AsyncStart(Arc::new(Noop)), ThreadOrigin::Container)
            .unwrap();
        assert!(!core.check_async_timeout_generation());
    }

    #[test]
    fn test_set_async_timeout_normalises() {
        let (core, _log) = bound(NullCodec::default());
        core.action(Action::AsyncSetTimeout(0), ThreadOrigin::Foreign).unwrap();
        assert_eq!(core.async_timeout(), -1);
        core.action(Action::AsyncSetTimeout(250), ThreadOrigin::Foreign).unwrap();
        assert_eq!(core.async_timeout(), 250);
    }

    #[test]
    fn test_nb_read_interest_registers() {
        let (core, log) = bound(NullCodec::default());
        let ready = core
            .action(Action::NbReadInterest, ThreadOrigin::Container)
            .unwrap();
        assert!(!ready.flag());
        assert_eq!(log.read_interest.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispatch_execute_drains_queue() {
        let (core, log) = bound(NullCodec::default());
        core.action(Action::DispatchWrite, ThreadOrigin::Container).unwrap();
        core.action(Action::DispatchRead, ThreadOrigin::Container).unwrap();
        core.action(Action::DispatchExecute, ThreadOrigin::Foreign).unwrap();

        assert_eq!(
            *log.events.lock(),
            vec![(SocketEvent::OpenWrite, false), (SocketEvent::OpenRead, false)]
        );
        assert!(core.dispatches().is_empty());
    }

    #[test]
    fn test_connection_id_and_recycle() {
        let (core, _log) = bound(NullCodec::default());
        let id = core
            .action(Action::ConnectionId, ThreadOrigin::Container)
            .unwrap()
            .text();
        assert_eq!(id.as_deref(), Some("socket-42"));

        core.set_error_state(ErrorState::CloseClean, ThreadOrigin::Container, None);
        core.recycle();
        assert_eq!(core.error_state(), ErrorState::None);
        assert!(core.socket().is_none());
        assert!(core.machine().post_process().unwrap_err().is_contract_violation());
    }
}
