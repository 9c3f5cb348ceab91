//! Asynchronous request processing state machine
//!
//! A request may be suspended by the hosted application and resumed later,
//! either on a container worker or from an unrelated thread. Every
//! suspension, resumption, completion, timeout and error goes through
//! [`AsyncStateMachine`], which holds exactly one [`AsyncState`] at a time
//! and rejects any (state, trigger) pair it does not define.
//!
//! ## Main paths
//!
//! ```text
//!                           start()
//!   ┌──────────────┐ ─────────────────► ┌──────────────┐
//!   │  Dispatched  │                    │   Starting   │
//!   └──────────────┘ ◄───┐              └──────┬───────┘
//!          ▲             │                     │ post_process()
//!          │ post_       │ post_process()      ▼
//!          │ process()   │              ┌──────────────┐  timeout()  ┌─────────────┐
//!   ┌──────┴───────┐     │              │   Started    │ ──────────► │  TimingOut  │
//!   │  Completing  │ ◄───┼───────────── └──────┬───────┘             └─────────────┘
//!   └──────────────┘     │  complete()         │ dispatch()
//!                        │                     ▼
//!                        │              ┌──────────────┐
//!                        └───────────── │ Dispatching  │
//!                                       └──────────────┘
//! ```
//!
//! Whether `complete()` and `dispatch()` act immediately or leave a pending
//! marker depends on the [`ThreadOrigin`] of the caller, which is always
//! passed explicitly.
//!
//! Application callbacks are never invoked while the machine's lock is held.

use crate::error::{Error, Result};
use crate::socket::SocketState;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, trace};

// ============================================================================
// Thread Origin
// ============================================================================

/// Which kind of thread is asking for a transition.
///
/// `Container` is the worker currently driving the connection's processor.
/// `Foreign` is anything else: an application thread, a timer, or a worker
/// that belongs to another connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadOrigin {
    Container,
    Foreign,
}

impl ThreadOrigin {
    #[inline]
    pub const fn is_container(self) -> bool {
        matches!(self, Self::Container)
    }
}

// ============================================================================
// Async State
// ============================================================================

/// The 13 states of asynchronous processing.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AsyncState {
    /// Ordinary synchronous processing
    #[default]
    Dispatched = 0,
    /// Suspension requested, the original request has not unwound yet
    Starting = 1,
    /// Suspended; may be resumed from any thread
    Started = 2,
    /// Completion requested before the original request finished unwinding
    MustComplete = 3,
    /// Completion requested by a foreign thread while still starting
    CompletePending = 4,
    /// Completion in progress
    Completing = 5,
    /// Suspension timed out, waiting for the application to react
    TimingOut = 6,
    /// Dispatch requested before the original request finished unwinding
    MustDispatch = 7,
    /// Dispatch requested by a foreign thread while still starting
    DispatchPending = 8,
    /// Dispatch in progress
    Dispatching = 9,
    /// Back on a worker for non-blocking I/O while logically suspended
    ReadWriteOp = 10,
    /// Off-thread I/O error while suspended, not yet handled
    MustError = 11,
    /// Errored; stays here until recycled
    Error = 12,
}

impl AsyncState {
    /// Number of states.
    pub const COUNT: usize = 13;

    #[inline]
    pub const fn is_async(self) -> bool {
        !matches!(self, Self::Dispatched)
    }

    #[inline]
    pub const fn is_started(self) -> bool {
        !matches!(
            self,
            Self::Dispatched | Self::Completing | Self::Dispatching
        )
    }

    #[inline]
    pub const fn is_dispatching(self) -> bool {
        matches!(
            self,
            Self::MustComplete
                | Self::Completing
                | Self::MustDispatch
                | Self::Dispatching
                | Self::ReadWriteOp
        )
    }

    #[inline]
    pub const fn is_complete_or_dispatch(self) -> bool {
        matches!(self, Self::MustDispatch | Self::Dispatching)
    }

    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

// ============================================================================
// Completion Callback
// ============================================================================

/// Hook into the hosted layer's async context.
pub trait AsyncCallback: Send + Sync {
    /// Notify completion listeners.
    fn fire_on_complete(&self);

    /// Whether the async context can still be used by the application.
    fn is_available(&self) -> bool {
        true
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ============================================================================
// State Machine
// ============================================================================

struct Inner {
    state: AsyncState,
    last_async_start: i64,
    generation: u64,
    callback: Option<Arc<dyn AsyncCallback>>,
}

/// Per-processor asynchronous state machine.
pub struct AsyncStateMachine {
    inner: Mutex<Inner>,
    changed: Condvar,
}

impl AsyncStateMachine {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: AsyncState::Dispatched,
                last_async_start: 0,
                generation: 0,
                callback: None,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn state(&self) -> AsyncState {
        self.inner.lock().state
    }

    pub fn is_async(&self) -> bool {
        self.state().is_async()
    }

    pub fn is_async_started(&self) -> bool {
        self.state().is_started()
    }

    pub fn is_async_dispatching(&self) -> bool {
        self.state().is_dispatching()
    }

    pub fn is_complete_or_dispatch(&self) -> bool {
        self.state().is_complete_or_dispatch()
    }

    pub fn is_async_timing_out(&self) -> bool {
        self.state() == AsyncState::TimingOut
    }

    pub fn is_async_error(&self) -> bool {
        self.state() == AsyncState::Error
    }

    pub fn is_completing(&self) -> bool {
        matches!(
            self.state(),
            AsyncState::MustComplete | AsyncState::Completing
        )
    }

    /// True when the request was suspended and that suspension is still usable.
    pub fn is_available(&self) -> bool {
        let callback = self.inner.lock().callback.clone();
        callback.is_some_and(|cb| cb.is_available())
    }

    /// Time of the most recent `start()`, or 0 when not suspended.
    pub fn last_async_start(&self) -> i64 {
        self.inner.lock().last_async_start
    }

    /// Incremented on every `start()`.
    pub fn current_generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Fail unless `suspension` names the generation still in progress.
    ///
    /// `None` skips the check. A suspension that has ended (the machine is
    /// back in `Dispatched`) or been superseded by a later `start()` is
    /// rejected as an illegal transition.
    pub fn verify_suspension(
        &self,
        suspension: Option<u64>,
        operation: &'static str,
    ) -> Result<()> {
        Self::check_suspension(&self.inner.lock(), suspension, operation)
    }

    fn check_suspension(
        inner: &Inner,
        suspension: Option<u64>,
        operation: &'static str,
    ) -> Result<()> {
        match suspension {
            Some(generation)
                if generation != inner.generation || inner.state == AsyncState::Dispatched =>
            {
                debug!(
                    generation,
                    current = inner.generation,
                    state = ?inner.state,
                    operation,
                    "stale async handle"
                );
                Err(Error::illegal(inner.state, operation))
            }
            _ => Ok(()),
        }
    }

    /// Suspend the current request.
    pub fn start(&self, callback: Arc<dyn AsyncCallback>) -> Result<()> {
        self.start_at(callback, now_millis())
    }

    /// Suspend the current request, recording `now` as the start time.
    pub fn start_at(&self, callback: Arc<dyn AsyncCallback>, now: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            AsyncState::Dispatched => {
                inner.generation += 1;
                inner.callback = Some(callback);
                inner.last_async_start = now;
                self.update(&mut inner, AsyncState::Starting);
                Ok(())
            }
            state => Err(Error::illegal(state, "start")),
        }
    }

    /// Request completion.
    ///
    /// Returns `true` when the caller must schedule a dispatch so that the
    /// completion runs on a container worker.
    pub fn complete(&self, origin: ThreadOrigin) -> Result<bool> {
        self.complete_for(None, origin)
    }

    /// [`complete`](Self::complete), rejected unless `suspension` is the
    /// generation in progress.
    pub fn complete_for(&self, suspension: Option<u64>, origin: ThreadOrigin) -> Result<bool> {
        let mut inner = self.inner.lock();
        Self::check_suspension(&inner, suspension, "complete")?;
        if !origin.is_container()
            && matches!(inner.state, AsyncState::Starting | AsyncState::ReadWriteOp)
        {
            self.update(&mut inner, AsyncState::CompletePending);
            return Ok(false);
        }
        self.do_complete(&mut inner)
    }

    fn do_complete(&self, inner: &mut Inner) -> Result<bool> {
        match inner.state {
            AsyncState::Starting | AsyncState::CompletePending | AsyncState::MustError => {
                self.update(inner, AsyncState::MustComplete);
                Ok(false)
            }
            AsyncState::Started => {
                self.update(inner, AsyncState::Completing);
                Ok(true)
            }
            AsyncState::TimingOut | AsyncState::Error | AsyncState::ReadWriteOp => {
                self.update(inner, AsyncState::MustComplete);
                Ok(false)
            }
            state => Err(Error::illegal(state, "complete")),
        }
    }

    /// Request a re-dispatch of the suspended request.
    ///
    /// Returns `true` when the caller must schedule the dispatch itself.
    pub fn dispatch(&self, origin: ThreadOrigin) -> Result<bool> {
        self.dispatch_for(None, origin)
    }

    /// [`dispatch`](Self::dispatch) for one suspension only.
    pub fn dispatch_for(&self, suspension: Option<u64>, origin: ThreadOrigin) -> Result<bool> {
        let mut inner = self.inner.lock();
        Self::check_suspension(&inner, suspension, "dispatch")?;
        if !origin.is_container() && inner.state == AsyncState::Starting {
            self.update(&mut inner, AsyncState::DispatchPending);
            return Ok(false);
        }
        self.do_dispatch(&mut inner, origin)
    }

    fn do_dispatch(&self, inner: &mut Inner, origin: ThreadOrigin) -> Result<bool> {
        match inner.state {
            AsyncState::Starting
            | AsyncState::TimingOut
            | AsyncState::Error
            | AsyncState::MustError => {
                self.update(inner, AsyncState::MustDispatch);
                Ok(false)
            }
            AsyncState::Started => {
                self.update(inner, AsyncState::Dispatching);
                Ok(true)
            }
            AsyncState::ReadWriteOp => {
                // The container loop revisits the processor on its own.
                self.update(inner, AsyncState::Dispatching);
                Ok(!origin.is_container())
            }
            AsyncState::DispatchPending => {
                self.update(inner, AsyncState::Dispatching);
                Ok(false)
            }
            state => Err(Error::illegal(state, "dispatch")),
        }
    }

    /// The dispatch triggered by `dispatch()` has run.
    pub fn dispatched(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            AsyncState::Dispatching | AsyncState::MustDispatch => {
                self.update(&mut inner, AsyncState::Dispatched);
                Ok(())
            }
            state => Err(Error::illegal(state, "dispatched")),
        }
    }

    /// The suspension timed out.
    ///
    /// Returns `false` without touching the state when a concurrent
    /// completion or dispatch has already moved past `Started`.
    pub fn timeout(&self) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.state {
            AsyncState::Started => {
                self.update(&mut inner, AsyncState::TimingOut);
                Ok(true)
            }
            AsyncState::Completing | AsyncState::Dispatching | AsyncState::Dispatched => {
                Ok(false)
            }
            state => Err(Error::illegal(state, "timeout")),
        }
    }

    /// Back on a worker for a non-blocking read or write.
    pub fn async_operation(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            AsyncState::Started => {
                self.update(&mut inner, AsyncState::ReadWriteOp);
                Ok(())
            }
            state => Err(Error::illegal(state, "async_operation")),
        }
    }

    /// An I/O error happened off the container thread while suspended.
    pub fn must_error(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            AsyncState::Started => {
                self.update(&mut inner, AsyncState::MustError);
                Ok(())
            }
            state => Err(Error::illegal(state, "must_error")),
        }
    }

    /// Move to `Error`.
    ///
    /// Returns `true` when the caller is not on the container thread and must
    /// schedule an error dispatch.
    pub fn error(&self, origin: ThreadOrigin) -> Result<bool> {
        self.error_for(None, origin)
    }

    /// [`error`](Self::error) for one suspension only.
    pub fn error_for(&self, suspension: Option<u64>, origin: ThreadOrigin) -> Result<bool> {
        let mut inner = self.inner.lock();
        Self::check_suspension(&inner, suspension, "error")?;
        match inner.state {
            AsyncState::Starting
            | AsyncState::Started
            | AsyncState::Dispatched
            | AsyncState::TimingOut
            | AsyncState::MustComplete
            | AsyncState::ReadWriteOp
            | AsyncState::Completing
            | AsyncState::MustError => {
                self.update(&mut inner, AsyncState::Error);
                Ok(!origin.is_container())
            }
            state => Err(Error::illegal(state, "error")),
        }
    }

    /// Check that a task may be run for the suspended request.
    ///
    /// The caller hands the task to an executor once this returns `Ok`.
    pub fn run(&self) -> Result<()> {
        self.run_for(None)
    }

    /// [`run`](Self::run) for one suspension only.
    pub fn run_for(&self, suspension: Option<u64>) -> Result<()> {
        let inner = self.inner.lock();
        Self::check_suspension(&inner, suspension, "run")?;
        match inner.state {
            AsyncState::Starting | AsyncState::Started | AsyncState::ReadWriteOp => Ok(()),
            state => Err(Error::illegal(state, "run")),
        }
    }

    /// Reconcile the state after a socket event has been driven.
    ///
    /// Returns [`SocketState::AsyncEnd`] when suspension ended and
    /// [`SocketState::Long`] when the request stays suspended.
    pub fn post_process(&self) -> Result<SocketState> {
        let fire = {
            let mut inner = self.inner.lock();
            match inner.state {
                AsyncState::CompletePending => {
                    self.update(&mut inner, AsyncState::Completing);
                    return Ok(SocketState::AsyncEnd);
                }
                AsyncState::DispatchPending => {
                    self.update(&mut inner, AsyncState::Dispatching);
                    return Ok(SocketState::AsyncEnd);
                }
                AsyncState::Starting | AsyncState::ReadWriteOp => {
                    self.update(&mut inner, AsyncState::Started);
                    return Ok(SocketState::Long);
                }
                AsyncState::MustComplete | AsyncState::Completing => {
                    self.update(&mut inner, AsyncState::Dispatched);
                    inner.callback.clone()
                }
                AsyncState::MustDispatch => {
                    self.update(&mut inner, AsyncState::Dispatching);
                    return Ok(SocketState::AsyncEnd);
                }
                AsyncState::Dispatching => {
                    self.update(&mut inner, AsyncState::Dispatched);
                    return Ok(SocketState::AsyncEnd);
                }
                state => return Err(Error::illegal(state, "post_process")),
            }
        };

        if let Some(callback) = fire {
            callback.fire_on_complete();
        }
        Ok(SocketState::AsyncEnd)
    }

    /// Reset to `Dispatched`, waking anyone blocked on this machine.
    pub fn recycle(&self) {
        let mut inner = self.inner.lock();
        inner.callback = None;
        inner.last_async_start = 0;
        inner.state = AsyncState::Dispatched;
        self.changed.notify_all();
    }

    /// Block until the state changes or `timeout` elapses.
    ///
    /// Returns the state observed on wake-up.
    pub fn await_state_change(&self, timeout: Duration) -> AsyncState {
        let mut inner = self.inner.lock();
        let before = inner.state;
        let generation = inner.generation;
        let _ = self.changed.wait_while_for(
            &mut inner,
            |i| i.state == before && i.generation == generation,
            timeout,
        );
        inner.state
    }

    fn update(&self, inner: &mut Inner, next: AsyncState) {
        trace!(from = ?inner.state, to = ?next, "async state change");
        inner.state = next;
        self.changed.notify_all();
    }
}

impl Default for AsyncStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AsyncStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("AsyncStateMachine")
            .field("state", &inner.state)
            .field("last_async_start", &inner.last_async_start)
            .field("generation", &inner.generation)
            .finish()
    }
}
