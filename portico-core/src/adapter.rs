// Seam into the hosted-application layer

use crate::error::Result;
use crate::request::Request;
use crate::response::Response;
use crate::socket::SocketEvent;
use std::time::Duration;

/// Entry points the core calls into the hosted application.
///
/// Both calls run on a container worker with exclusive access to the
/// exchange's carriers.
pub trait Adapter: Send + Sync {
    /// Process a freshly parsed request.
    fn service(&self, request: &mut Request, response: &mut Response) -> Result<()>;

    /// Continue a suspended request after `event`.
    ///
    /// Returns `false` when the exchange could not be continued and the
    /// connection must close.
    fn async_dispatch(
        &self,
        request: &mut Request,
        response: &mut Response,
        event: SocketEvent,
    ) -> Result<bool>;

    /// Record a request that never reached the application.
    fn log_access(&self, _request: &Request, _response: &Response, _elapsed: Duration) {}

    /// Verify that no application state leaked past recycling.
    fn check_recycled(&self, _request: &Request, _response: &Response) {}

    /// Name reported in diagnostics.
    fn domain(&self) -> Option<&str> {
        None
    }
}
