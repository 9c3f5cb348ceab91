//! Wire codec seam
//!
//! Byte-level parsing and serialisation of HTTP/1.1 and AJP messages live
//! outside the core. A processor drives an [`ExchangeCodec`] to read the
//! next request head into the [`Request`] carrier and to emit the response;
//! everything else (keep-alive, async, upgrade, error severity) is decided
//! by the processor.

use crate::error::Result;
use crate::request::Request;
use crate::socket::SocketWrapper;
use bytes::Bytes;
use http::HeaderMap;

/// Outcome of trying to read a request head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// A complete head was parsed into the request
    Complete,
    /// Nothing of the next request has arrived yet
    NeedMoreData,
    /// Part of a request head arrived; the rest is still in flight
    Incomplete,
    /// The peer closed the connection between requests
    EndOfStream,
    /// A protocol-level keep-alive probe was answered (AJP CPING)
    Ping,
    /// The client opened with the HTTP/2 connection preface
    Http2Preface,
}

/// Protocol wire codec driven by a processor.
pub trait ExchangeCodec: Send {
    /// Attach to the socket of a new connection.
    fn bind(&mut self, socket: &dyn SocketWrapper);

    /// Read the next request head into `request`.
    ///
    /// `keep_alive` is true when waiting for a follow-up request on a
    /// persistent connection.
    fn parse_request_head(
        &mut self,
        socket: &dyn SocketWrapper,
        request: &mut Request,
        keep_alive: bool,
    ) -> Result<ParseStatus>;

    /// Write the response head.
    fn write_response_head(&mut self, status: u16, headers: &HeaderMap) -> Result<()>;

    /// Send an interim `100 Continue`.
    fn ack(&mut self) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    /// Complete the response body (final chunk, end-of-message packet).
    fn finish_response(&mut self) -> Result<()>;

    /// Consume whatever the application left unread of the request body.
    fn end_request(&mut self) -> Result<()>;

    /// Bytes readable without blocking. With `do_read` the codec may attempt
    /// a non-blocking read first.
    fn available(&mut self, do_read: bool) -> usize;

    fn is_request_body_fully_read(&self) -> bool;

    fn is_ready_for_read(&mut self) -> bool {
        self.available(true) > 0
    }

    fn is_ready_for_write(&self) -> bool {
        !self.has_buffered_write()
    }

    fn set_body_replay(&mut self, body: Bytes);

    /// Whether unread request input is discarded at the end of the request.
    fn set_swallow_input(&mut self, swallow: bool);

    /// Stop emitting response bytes.
    fn set_swallow_response(&mut self);

    fn has_buffered_write(&self) -> bool {
        false
    }

    /// Try to write buffered response bytes. Returns `true` when data remains.
    fn flush_buffered_write(&mut self) -> Result<bool> {
        Ok(false)
    }

    /// Whether the peer asked to keep the connection open after this exchange.
    fn keep_alive(&self) -> bool {
        true
    }

    /// Whether a follow-up request is already buffered.
    fn has_pipelined_data(&self) -> bool {
        false
    }

    /// Bytes read past the end of the current protocol message.
    fn take_leftover(&mut self) -> Bytes {
        Bytes::new()
    }

    fn is_trailer_fields_ready(&self) -> bool {
        false
    }

    fn is_trailer_fields_supported(&self) -> bool {
        false
    }

    /// Prepare for the next request on the same connection.
    fn next_request(&mut self);

    /// Reset for reuse on another connection.
    fn recycle(&mut self);
}

/// Creates one codec per processor.
pub trait CodecFactory: Send + Sync {
    fn create(&self) -> Box<dyn ExchangeCodec>;
}

impl<F> CodecFactory for F
where
    F: Fn() -> Box<dyn ExchangeCodec> + Send + Sync,
{
    fn create(&self) -> Box<dyn ExchangeCodec> {
        self()
    }
}
