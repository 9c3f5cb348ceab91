// Request/response exchange shared by the HTTP/1.1 and AJP processors

use super::ProcessorContext;
use super::core::ProcessorCore;
use crate::action::{ActionHook, ThreadOrigin};
use crate::async_state::AsyncState;
use crate::codec::ExchangeCodec;
use crate::error::{Error, Result};
use crate::error_state::ErrorState;
use crate::request::Request;
use crate::response::Response;
use crate::socket::{SocketEvent, SocketState, SocketWrapper};
use crate::stats::RequestStage;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// How an async dispatch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchOutcome {
    /// Final verdict for this event
    Done(SocketState),
    /// The exchange finished; the protocol decides whether to keep the
    /// connection
    EndRequest,
}

/// Carriers plus the shared core of one connection.
pub(crate) struct Exchange {
    pub core: Arc<ProcessorCore>,
    pub ctx: ProcessorContext,
    pub request: Request,
    pub response: Response,
}

impl Exchange {
    pub fn new(ctx: ProcessorContext, codec: Box<dyn ExchangeCodec>) -> Self {
        let core = Arc::new(ProcessorCore::new(codec, ctx.config.async_timeout_millis()));
        let hook: Arc<dyn ActionHook> = core.clone();
        let mut request = Request::new();
        let mut response = Response::new();
        request.set_hook(hook.clone());
        response.set_hook(hook);
        Self {
            core,
            ctx,
            request,
            response,
        }
    }

    pub fn bind(&self, socket: &Arc<dyn SocketWrapper>) {
        self.core.bind(socket);
    }

    pub fn socket(&self) -> Result<Arc<dyn SocketWrapper>> {
        self.core.socket().ok_or(Error::ProcessorClosed)
    }

    pub fn error_state(&self) -> ErrorState {
        self.core.error_state()
    }

    pub fn set_error_state(&mut self, state: ErrorState, cause: Option<&Error>) {
        self.core
            .set_error_state(state, ThreadOrigin::Container, cause);
        self.apply_forced_status();
    }

    /// Carry a status forced by an error onto the response carrier.
    pub fn apply_forced_status(&mut self) {
        if self.core.take_forced_error_status()
            && self.response.status() < 400
            && !self.response.is_committed()
        {
            self.response.set_status(500);
        }
    }

    pub fn is_async(&self) -> bool {
        self.core.is_async()
    }

    pub fn set_stage(&self, stage: RequestStage) {
        self.core.request_info().set_stage(stage);
    }

    /// Call the adapter for a freshly parsed request.
    pub fn service_request(&mut self) {
        self.set_stage(RequestStage::Service);
        let result = self
            .ctx
            .adapter
            .service(&mut self.request, &mut self.response);
        if let Err(e) = result {
            error!(error = %e, uri = %self.request.uri(), "error processing request");
            self.response.set_status(500);
            self.set_error_state(ErrorState::CloseClean, Some(&e));
        }
        self.apply_forced_status();
    }

    /// Continue a suspended exchange after `event`.
    ///
    /// A non-blocking write dispatch for an exchange that is not suspended
    /// fails with [`Error::IllegalState`].
    pub fn dispatch(&mut self, mut event: SocketEvent) -> Result<DispatchOutcome> {
        let machine = self.core.machine();

        if event == SocketEvent::OpenWrite && self.response.write_listener().is_some() {
            machine.async_operation()?;
            match self.core.with_codec(|codec| codec.flush_buffered_write()) {
                Ok(true) => return Ok(DispatchOutcome::Done(SocketState::Long)),
                Ok(false) => {}
                Err(e) => {
                    debug!(error = %e, "flushing buffered write failed");
                    self.core.handle_io_error(&e, ThreadOrigin::Container);
                    event = SocketEvent::Error;
                }
            }
        } else if event == SocketEvent::OpenRead && self.request.read_listener().is_some() {
            if machine.state() == AsyncState::Started {
                machine.async_operation()?;
            }
        } else if event == SocketEvent::Error
            && (self.request.read_listener().is_some() || self.response.write_listener().is_some())
            && machine.state() == AsyncState::Started
        {
            // The error happened during non-blocking I/O
            machine.async_operation()?;
        }

        self.set_stage(RequestStage::Service);
        match self
            .ctx
            .adapter
            .async_dispatch(&mut self.request, &mut self.response, event)
        {
            Ok(true) => {}
            Ok(false) => self.set_error_state(ErrorState::CloseNow, None),
            Err(e) => {
                if !e.is_io() {
                    error!(error = %e, ?event, "error dispatching async request");
                }
                self.set_error_state(ErrorState::CloseNow, Some(&e));
            }
        }
        self.apply_forced_status();
        self.set_stage(RequestStage::Ended);

        Ok(if self.error_state().is_error() {
            self.update_counters();
            DispatchOutcome::Done(SocketState::Closed)
        } else if self.is_async() {
            DispatchOutcome::Done(SocketState::Long)
        } else {
            self.request.clear_read_listener();
            self.response.clear_write_listener();
            self.update_counters();
            DispatchOutcome::EndRequest
        })
    }

    /// Commit and complete the response, absorbing transport failures.
    pub fn finish_response(&mut self) {
        let result = self.response.finish();
        if let Err(e) = result {
            if e.is_io() {
                self.core.handle_io_error(&e, ThreadOrigin::Container);
            } else {
                error!(error = %e, "error finishing response");
                self.set_error_state(ErrorState::CloseNow, Some(&e));
            }
        }
    }

    pub fn update_counters(&self) {
        let elapsed = self
            .request
            .start_time()
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO);
        self.core.request_info().record_request(
            self.request.bytes_read(),
            self.response.bytes_written(),
            elapsed,
            self.response.status() >= 400,
        );
    }

    pub fn log_access(&mut self) {
        let elapsed = self
            .request
            .start_time()
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO);
        self.ctx
            .adapter
            .log_access(&self.request, &self.response, elapsed);
    }

    /// Reset the carriers for the next request on this connection.
    pub fn next_request(&mut self) {
        self.request.recycle();
        self.response.recycle();
        self.core.next_request();
        self.set_stage(RequestStage::KeepAlive);
    }

    pub fn recycle(&mut self) {
        self.ctx
            .adapter
            .check_recycled(&self.request, &self.response);
        self.request.recycle();
        self.response.recycle();
        self.core.recycle();
        self.set_stage(RequestStage::New);
    }
}
