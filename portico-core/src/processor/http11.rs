//! HTTP/1.1 processor
//!
//! Serves requests on a persistent connection until one of them suspends,
//! asks for a protocol upgrade, fails, or the keep-alive budget runs out.

use super::exchange::{DispatchOutcome, Exchange};
use super::{
    AsyncTimeoutHandle, DispatchQueue, LightProcessor, Processor, ProcessorContext, ProcessorId,
};
use crate::action::Action;
use crate::codec::{ExchangeCodec, ParseStatus};
use crate::error::Result;
use crate::error_state::ErrorState;
use crate::socket::{SocketEvent, SocketState, SocketWrapper};
use crate::stats::{RequestInfo, RequestStage};
use crate::upgrade::UpgradeToken;
use bytes::Bytes;
use http::header::{CONNECTION, UPGRADE};
use http::{HeaderMap, HeaderValue};
use std::sync::Arc;
use tracing::{debug, trace};

/// Responses after which the connection is not reused.
pub(crate) fn status_drops_connection(status: u16) -> bool {
    matches!(status, 400 | 408 | 411 | 413 | 414 | 500 | 501 | 503)
}

/// Whether `Connection:` lists `token`.
fn has_connection_token(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

pub struct Http11Processor {
    exchange: Exchange,
    keep_alive: bool,
    open_socket: bool,
    read_complete: bool,
}

impl Http11Processor {
    pub fn new(ctx: ProcessorContext, codec: Box<dyn ExchangeCodec>) -> Self {
        Self {
            exchange: Exchange::new(ctx, codec),
            keep_alive: true,
            open_socket: false,
            read_complete: true,
        }
    }

    fn is_paused(&self) -> bool {
        self.exchange.ctx.is_paused()
    }

    /// Answer 101 and hand the connection to a registered upgrade protocol.
    ///
    /// Returns `Ok(false)` when the request names no acceptable protocol.
    fn try_header_upgrade(&mut self, socket: &Arc<dyn SocketWrapper>) -> Result<bool> {
        let ex = &mut self.exchange;
        if !ex.ctx.config.allow_upgrade || !has_connection_token(ex.request.headers(), "upgrade") {
            return Ok(false);
        }
        let Some(requested) = ex.request.header(UPGRADE.as_str()).map(str::to_string) else {
            return Ok(false);
        };
        let Some(protocol) = ex.ctx.upgrades.by_name(&requested).cloned() else {
            return Ok(false);
        };
        if !protocol.accept(&ex.request) {
            debug!(protocol = %requested, "upgrade request not accepted");
            return Ok(false);
        }

        ex.response.set_status(101);
        ex.response
            .headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        if let Ok(value) = HeaderValue::from_str(&requested) {
            ex.response.headers_mut().insert(UPGRADE, value);
        }
        ex.finish_response();
        ex.log_access();

        let handler =
            protocol.internal_upgrade_handler(socket, &ex.ctx.adapter, Some(&ex.request))?;
        ex.request
            .action(Action::Upgrade(UpgradeToken::internal(requested.clone(), handler)))?;
        debug!(protocol = %requested, "switching protocols");
        Ok(true)
    }

    fn update_keep_alive(&mut self, socket: &Arc<dyn SocketWrapper>) {
        match self.exchange.ctx.config.max_keep_alive_requests {
            Some(1) => self.keep_alive = false,
            Some(max) if max > 0 => {
                if socket.count_request() >= max {
                    self.keep_alive = false;
                }
            }
            _ => {}
        }
        if !self.exchange.core.with_codec(|codec| codec.keep_alive()) {
            self.keep_alive = false;
        }
    }

    /// A failed `Expect: 100-continue` exchange leaves the body unread.
    fn check_expectation_and_status(&mut self) {
        let status = self.exchange.response.status();
        if self.exchange.request.expects_continue()
            && !(200..=299).contains(&status)
            && !self
                .exchange
                .core
                .with_codec(|codec| codec.is_request_body_fully_read())
        {
            self.exchange
                .core
                .with_codec(|codec| codec.set_swallow_input(false));
            self.keep_alive = false;
        }
    }

    fn end_request(&mut self) {
        if self.exchange.error_state().is_error() {
            self.exchange
                .core
                .with_codec(|codec| codec.set_swallow_input(false));
        } else {
            self.check_expectation_and_status();
        }

        if self.exchange.error_state().is_io_allowed() {
            if let Err(e) = self.exchange.core.with_codec(|codec| codec.end_request()) {
                if e.is_io() {
                    self.exchange
                        .set_error_state(ErrorState::CloseConnectionNow, Some(&e));
                } else {
                    self.exchange.response.set_status(500);
                    self.exchange.set_error_state(ErrorState::CloseNow, Some(&e));
                }
            }
        }

        if self.exchange.error_state().is_io_allowed() {
            self.exchange.finish_response();
        }
    }

    fn dispatch_end_request(&mut self) -> SocketState {
        if !self.keep_alive || self.is_paused() {
            return SocketState::Closed;
        }
        self.end_request();
        self.exchange.next_request();
        match self.exchange.socket() {
            Ok(socket) if socket.is_read_pending() => SocketState::Long,
            _ => SocketState::Open,
        }
    }
}

impl LightProcessor for Http11Processor {
    fn dispatch_queue(&self) -> &DispatchQueue {
        self.exchange.core.dispatches()
    }

    fn service(&mut self) -> Result<SocketState> {
        let socket = self.exchange.socket()?;

        self.keep_alive = true;
        self.open_socket = false;
        self.read_complete = true;
        let mut kept_alive = false;

        while !self.exchange.error_state().is_error()
            && self.keep_alive
            && !self.exchange.is_async()
            && !self.exchange.core.has_upgrade_token()
            && !self.is_paused()
        {
            self.exchange.set_stage(RequestStage::Parse);
            let ex = &mut self.exchange;
            let parsed = ex.core.with_codec(|codec| {
                codec.parse_request_head(socket.as_ref(), &mut ex.request, kept_alive)
            });

            match parsed {
                Ok(ParseStatus::Complete) => {
                    kept_alive = true;
                    ex.request.mark_start();
                    if self.is_paused() {
                        // Stopping: refuse rather than start new work
                        self.exchange.response.set_status(503);
                        self.exchange.set_error_state(ErrorState::CloseClean, None);
                    }
                }
                Ok(ParseStatus::Http2Preface) => {
                    debug!(socket = %socket.id(), "h2c preface received");
                    return Ok(SocketState::Upgrading);
                }
                Ok(ParseStatus::NeedMoreData) | Ok(ParseStatus::Ping) => {
                    self.open_socket = true;
                    break;
                }
                Ok(ParseStatus::Incomplete) => {
                    self.open_socket = true;
                    if self.is_paused() {
                        self.exchange.response.set_status(503);
                        self.exchange.set_error_state(ErrorState::CloseClean, None);
                    } else {
                        self.read_complete = false;
                        break;
                    }
                }
                Ok(ParseStatus::EndOfStream) => {
                    trace!(socket = %socket.id(), "client closed between requests");
                    self.exchange.set_error_state(ErrorState::CloseConnectionNow, None);
                    break;
                }
                Err(e) if e.is_io() => {
                    debug!(error = %e, "error reading request head");
                    self.exchange
                        .set_error_state(ErrorState::CloseConnectionNow, Some(&e));
                    break;
                }
                Err(e) => {
                    debug!(error = %e, "error parsing request head");
                    self.exchange.response.set_status(400);
                    self.exchange.set_error_state(ErrorState::CloseClean, Some(&e));
                }
            }

            if !self.exchange.error_state().is_error() && self.try_header_upgrade(&socket)? {
                return Ok(SocketState::Upgrading);
            }

            self.exchange.set_stage(RequestStage::Prepare);
            self.update_keep_alive(&socket);

            if !self.exchange.error_state().is_error() {
                self.exchange.service_request();
                let status = self.exchange.response.status();
                if self.keep_alive
                    && !self.exchange.error_state().is_error()
                    && !self.exchange.is_async()
                    && status_drops_connection(status)
                {
                    self.exchange.set_error_state(ErrorState::CloseClean, None);
                }
            }

            self.exchange.set_stage(RequestStage::EndInput);
            if !self.exchange.is_async() {
                self.end_request();
            }
            self.exchange.set_stage(RequestStage::EndOutput);

            if self.exchange.error_state().is_error() {
                self.exchange.response.set_status(500);
            }

            if !self.exchange.is_async() || self.exchange.error_state().is_error() {
                self.exchange.update_counters();
                if self.exchange.error_state().is_io_allowed() {
                    self.exchange.next_request();
                }
            }

            self.exchange.set_stage(RequestStage::KeepAlive);
        }

        self.exchange.set_stage(RequestStage::Ended);

        let state = if self.exchange.error_state().is_error()
            || (self.is_paused() && !self.exchange.is_async())
        {
            SocketState::Closed
        } else if self.exchange.is_async() {
            SocketState::Long
        } else if self.exchange.core.has_upgrade_token() {
            SocketState::Upgrading
        } else if self.open_socket {
            if self.read_complete {
                SocketState::Open
            } else {
                SocketState::Long
            }
        } else {
            SocketState::Closed
        };
        Ok(state)
    }

    fn dispatch(&mut self, event: SocketEvent) -> Result<SocketState> {
        Ok(match self.exchange.dispatch(event)? {
            DispatchOutcome::Done(state) => state,
            DispatchOutcome::EndRequest => self.dispatch_end_request(),
        })
    }

    fn async_post_process(&mut self) -> Result<SocketState> {
        self.exchange.core.machine().post_process()
    }

    fn is_async(&self) -> bool {
        self.exchange.is_async()
    }

    fn is_upgrade(&self) -> bool {
        false
    }

    fn log_access(&mut self) {
        self.exchange.log_access();
    }

    fn has_pipelined_data(&self) -> bool {
        self.exchange
            .core
            .with_codec(|codec| codec.has_pipelined_data())
    }
}

impl Processor for Http11Processor {
    fn id(&self) -> ProcessorId {
        self.exchange.core.id()
    }

    fn process(
        &mut self,
        socket: &Arc<dyn SocketWrapper>,
        event: SocketEvent,
    ) -> Result<SocketState> {
        self.exchange.bind(socket);
        self.drive(event)
    }

    fn take_upgrade_token(&mut self) -> Option<UpgradeToken> {
        self.exchange.core.take_upgrade_token()
    }

    fn take_leftover_input(&mut self) -> Bytes {
        self.exchange.core.with_codec(|codec| codec.take_leftover())
    }

    fn is_async(&self) -> bool {
        self.exchange.is_async()
    }

    fn is_upgrade(&self) -> bool {
        false
    }

    fn timeout_handle(&self) -> Option<Arc<dyn AsyncTimeoutHandle>> {
        Some(self.exchange.core.clone())
    }

    fn check_async_timeout_generation(&self) -> bool {
        self.exchange.core.check_async_timeout_generation()
    }

    fn pause(&self) {}

    fn request_info(&self) -> Option<Arc<RequestInfo>> {
        Some(self.exchange.core.request_info().clone())
    }

    fn recycle(&mut self) {
        self.exchange.recycle();
        self.keep_alive = true;
        self.open_socket = false;
        self.read_complete = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_drops_connection() {
        for status in [400, 408, 411, 413, 414, 500, 501, 503] {
            assert!(status_drops_connection(status), "{status}");
        }
        for status in [200, 204, 301, 404, 502] {
            assert!(!status_drops_connection(status), "{status}");
        }
    }

    #[test]
    fn test_connection_token_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        assert!(has_connection_token(&headers, "upgrade"));
        assert!(has_connection_token(&headers, "keep-alive"));
        assert!(!has_connection_token(&headers, "close"));

        headers.clear();
        headers.insert(CONNECTION, HeaderValue::from_static("upgraded"));
        assert!(!has_connection_token(&headers, "upgrade"));
    }
}
