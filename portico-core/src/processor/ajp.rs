//! AJP/1.3 processor
//!
//! AJP connections come from a front-end proxy and are always persistent.
//! CPING probes are answered by the codec and reported as
//! [`ParseStatus::Ping`]. There is no upgrade and no push.

use super::exchange::{DispatchOutcome, Exchange};
use super::{
    AsyncTimeoutHandle, DispatchQueue, LightProcessor, Processor, ProcessorContext, ProcessorId,
};
use crate::codec::{ExchangeCodec, ParseStatus};
use crate::error::Result;
use crate::error_state::ErrorState;
use crate::socket::{SocketEvent, SocketState, SocketWrapper};
use crate::stats::{RequestInfo, RequestStage};
use crate::upgrade::UpgradeToken;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, trace};

pub struct AjpProcessor {
    exchange: Exchange,
    read_complete: bool,
}

impl AjpProcessor {
    pub fn new(ctx: ProcessorContext, codec: Box<dyn ExchangeCodec>) -> Self {
        Self {
            exchange: Exchange::new(ctx, codec),
            read_complete: true,
        }
    }

    fn is_paused(&self) -> bool {
        self.exchange.ctx.is_paused()
    }
}

impl LightProcessor for AjpProcessor {
    fn dispatch_queue(&self) -> &DispatchQueue {
        self.exchange.core.dispatches()
    }

    fn service(&mut self) -> Result<SocketState> {
        let socket = self.exchange.socket()?;
        let mut kept_alive = false;
        self.read_complete = true;

        while !self.exchange.error_state().is_error() && !self.is_paused() {
            self.exchange.set_stage(RequestStage::Parse);
            let ex = &mut self.exchange;
            let parsed = ex.core.with_codec(|codec| {
                codec.parse_request_head(socket.as_ref(), &mut ex.request, kept_alive)
            });

            match parsed {
                Ok(ParseStatus::Complete) => {
                    kept_alive = true;
                    ex.request.mark_start();
                }
                Ok(ParseStatus::Ping) => {
                    trace!(socket = %socket.id(), "cping answered");
                    self.exchange.next_request();
                    continue;
                }
                Ok(ParseStatus::NeedMoreData) => break,
                Ok(ParseStatus::Incomplete) => {
                    self.read_complete = false;
                    break;
                }
                Ok(status @ (ParseStatus::EndOfStream | ParseStatus::Http2Preface)) => {
                    debug!(socket = %socket.id(), ?status, "unexpected AJP packet");
                    self.exchange.set_error_state(ErrorState::CloseConnectionNow, None);
                    break;
                }
                Err(e) if e.is_io() => {
                    debug!(error = %e, "error reading AJP packet");
                    self.exchange
                        .set_error_state(ErrorState::CloseConnectionNow, Some(&e));
                    break;
                }
                Err(e) => {
                    debug!(error = %e, "error parsing AJP forward request");
                    self.exchange.response.set_status(400);
                    self.exchange.set_error_state(ErrorState::CloseClean, Some(&e));
                }
            }

            if self.exchange.error_state().is_io_allowed() && self.is_paused() {
                self.exchange.response.set_status(503);
                self.exchange.set_error_state(ErrorState::CloseClean, None);
            }

            if !self.exchange.error_state().is_error() {
                self.exchange.service_request();
            }

            if self.exchange.is_async() && !self.exchange.error_state().is_error() {
                break;
            }

            if self.exchange.error_state().is_io_allowed() {
                self.exchange.finish_response();
            }

            if self.exchange.error_state().is_error() {
                self.exchange.response.set_status(500);
            }
            self.exchange.update_counters();
            self.exchange.set_stage(RequestStage::KeepAlive);
            self.exchange.next_request();
        }

        self.exchange.set_stage(RequestStage::Ended);

        Ok(
            if self.exchange.error_state().is_error()
                || (self.is_paused() && !self.exchange.is_async())
            {
                SocketState::Closed
            } else if self.exchange.is_async() || !self.read_complete {
                SocketState::Long
            } else {
                SocketState::Open
            },
        )
    }

    fn dispatch(&mut self, event: SocketEvent) -> Result<SocketState> {
        Ok(match self.exchange.dispatch(event)? {
            DispatchOutcome::Done(state) => state,
            DispatchOutcome::EndRequest => {
                self.exchange.next_request();
                if self.is_paused() {
                    SocketState::Closed
                } else {
                    SocketState::Open
                }
            }
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

impl Processor for AjpProcessor {
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
        None
    }

    fn take_leftover_input(&mut self) -> Bytes {
        Bytes::new()
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
        self.read_complete = true;
    }
}
