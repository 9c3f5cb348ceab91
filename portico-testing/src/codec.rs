// Scripted wire codec

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use parking_lot::Mutex;
use portico_core::{
    CodecFactory, Error, ExchangeCodec, ParseStatus, Request, Result, SocketWrapper,
};
use std::collections::VecDeque;
use std::sync::Arc;

/// Head of a request the codec hands to the processor.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: String,
    pub headers: HeaderMap,
    pub expect_continue: bool,
}

impl RequestHead {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: HeaderMap::new(),
            expect_continue: false,
        }
    }

    pub fn get(uri: impl Into<String>) -> Self {
        Self::new(Method::GET, uri)
    }

    pub fn post(uri: impl Into<String>) -> Self {
        Self::new(Method::POST, uri)
    }

    /// Add a header. Invalid names or values are ignored.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    pub fn expect_continue(mut self) -> Self {
        self.expect_continue = true;
        self
    }
}

/// One answer to `parse_request_head`.
#[derive(Debug, Clone)]
pub enum Parse {
    Head(RequestHead),
    Status(ParseStatus),
    /// The head was malformed
    Malformed(String),
    /// The transport failed while reading
    ConnectionReset,
}

/// What the processor asked the codec to do, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecCall {
    Bind,
    ResponseHead(u16),
    Ack,
    Flush,
    FinishResponse,
    EndRequest,
    SwallowInput(bool),
    SwallowResponse,
    NextRequest,
    Recycle,
}

/// Shared script for every codec a factory creates.
///
/// Once the queued answers run out, `parse_request_head` reports
/// [`ParseStatus::NeedMoreData`].
#[derive(Default)]
pub struct CodecScript {
    parses: Mutex<VecDeque<Parse>>,
    calls: Mutex<Vec<CodecCall>>,
    leftover: Mutex<Bytes>,
    keep_alive: Mutex<bool>,
    pipelined: Mutex<bool>,
}

impl CodecScript {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            keep_alive: Mutex::new(true),
            ..Default::default()
        })
    }

    pub fn push(&self, parse: Parse) -> &Self {
        self.parses.lock().push_back(parse);
        self
    }

    pub fn push_request(&self, head: RequestHead) -> &Self {
        self.push(Parse::Head(head))
    }

    pub fn push_status(&self, status: ParseStatus) -> &Self {
        self.push(Parse::Status(status))
    }

    /// Bytes the codec read past the end of the current message.
    pub fn set_leftover(&self, leftover: impl Into<Bytes>) {
        *self.leftover.lock() = leftover.into();
    }

    /// Whether the peer asked for a persistent connection.
    pub fn set_keep_alive(&self, keep_alive: bool) {
        *self.keep_alive.lock() = keep_alive;
    }

    pub fn set_pipelined(&self, pipelined: bool) {
        *self.pipelined.lock() = pipelined;
    }

    pub fn remaining(&self) -> usize {
        self.parses.lock().len()
    }

    pub fn calls(&self) -> Vec<CodecCall> {
        self.calls.lock().clone()
    }

    /// Status codes of every response head written.
    pub fn statuses(&self) -> Vec<u16> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                CodecCall::ResponseHead(status) => Some(*status),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, call: &CodecCall) -> usize {
        self.calls.lock().iter().filter(|c| *c == call).count()
    }

    fn record(&self, call: CodecCall) {
        self.calls.lock().push(call);
    }

    /// Factory handing out codecs that follow this script.
    pub fn factory(self: &Arc<Self>) -> impl CodecFactory + 'static {
        let script = self.clone();
        move || Box::new(ScriptedCodec::new(script.clone())) as Box<dyn ExchangeCodec>
    }
}

impl std::fmt::Debug for CodecScript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecScript")
            .field("remaining", &self.remaining())
            .field("calls", &self.calls.lock().len())
            .finish()
    }
}

/// Codec that answers from a [`CodecScript`] and records what it is asked.
pub struct ScriptedCodec {
    script: Arc<CodecScript>,
    body_replay: Option<Bytes>,
    swallow_response: bool,
}

impl ScriptedCodec {
    pub fn new(script: Arc<CodecScript>) -> Self {
        Self {
            script,
            body_replay: None,
            swallow_response: false,
        }
    }
}

impl ExchangeCodec for ScriptedCodec {
    fn bind(&mut self, _socket: &dyn SocketWrapper) {
        self.script.record(CodecCall::Bind);
    }

    fn parse_request_head(
        &mut self,
        _socket: &dyn SocketWrapper,
        request: &mut Request,
        _keep_alive: bool,
    ) -> Result<ParseStatus> {
        let next = self.script.parses.lock().pop_front();
        match next {
            Some(Parse::Head(head)) => {
                request.set_method(head.method);
                request.set_uri(head.uri);
                *request.headers_mut() = head.headers;
                request.set_expect_continue(head.expect_continue);
                Ok(ParseStatus::Complete)
            }
            Some(Parse::Status(status)) => Ok(status),
            Some(Parse::Malformed(reason)) => Err(Error::Protocol(reason)),
            Some(Parse::ConnectionReset) => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            ))),
            None => Ok(ParseStatus::NeedMoreData),
        }
    }

    fn write_response_head(&mut self, status: u16, _headers: &HeaderMap) -> Result<()> {
        if !self.swallow_response {
            self.script.record(CodecCall::ResponseHead(status));
        }
        Ok(())
    }

    fn ack(&mut self) -> Result<()> {
        self.script.record(CodecCall::Ack);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.script.record(CodecCall::Flush);
        Ok(())
    }

    fn finish_response(&mut self) -> Result<()> {
        self.script.record(CodecCall::FinishResponse);
        Ok(())
    }

    fn end_request(&mut self) -> Result<()> {
        self.script.record(CodecCall::EndRequest);
        Ok(())
    }

    fn available(&mut self, _do_read: bool) -> usize {
        self.body_replay.as_ref().map_or(0, Bytes::len)
    }

    fn is_request_body_fully_read(&self) -> bool {
        true
    }

    fn set_body_replay(&mut self, body: Bytes) {
        self.body_replay = Some(body);
    }

    fn set_swallow_input(&mut self, swallow: bool) {
        self.script.record(CodecCall::SwallowInput(swallow));
    }

    fn set_swallow_response(&mut self) {
        self.swallow_response = true;
        self.script.record(CodecCall::SwallowResponse);
    }

    fn keep_alive(&self) -> bool {
        *self.script.keep_alive.lock()
    }

    fn has_pipelined_data(&self) -> bool {
        *self.script.pipelined.lock()
    }

    fn take_leftover(&mut self) -> Bytes {
        std::mem::take(&mut *self.script.leftover.lock())
    }

    fn next_request(&mut self) {
        self.body_replay = None;
        self.script.record(CodecCall::NextRequest);
    }

    fn recycle(&mut self) {
        self.body_replay = None;
        self.swallow_response = false;
        self.script.record(CodecCall::Recycle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockSocket;

    #[test]
    fn test_script_answers_in_order() {
        let script = CodecScript::new();
        script
            .push_request(RequestHead::get("/a").header("connection", "upgrade"))
            .push_status(ParseStatus::Ping)
            .push(Parse::Malformed("bad request line".to_string()));

        let factory = script.factory();
        let mut codec = factory.create();
        let socket = MockSocket::new();
        let mut request = Request::new();

        assert_eq!(
            codec.parse_request_head(&socket, &mut request, false).unwrap(),
            ParseStatus::Complete
        );
        assert_eq!(request.uri(), "/a");
        assert_eq!(request.header("connection"), Some("upgrade"));

        assert_eq!(
            codec.parse_request_head(&socket, &mut request, true).unwrap(),
            ParseStatus::Ping
        );
        assert!(matches!(
            codec.parse_request_head(&socket, &mut request, true),
            Err(Error::Protocol(_))
        ));
        assert_eq!(
            codec.parse_request_head(&socket, &mut request, true).unwrap(),
            ParseStatus::NeedMoreData
        );
    }

    #[test]
    fn test_swallowed_response_is_not_written() {
        let script = CodecScript::new();
        let mut codec = ScriptedCodec::new(script.clone());
        codec.write_response_head(200, &HeaderMap::new()).unwrap();
        codec.set_swallow_response();
        codec.write_response_head(500, &HeaderMap::new()).unwrap();
        assert_eq!(script.statuses(), vec![200]);
    }

    #[test]
    fn test_leftover_is_taken_once() {
        let script = CodecScript::new();
        script.set_leftover(Bytes::from_static(b"abc"));
        let mut codec = ScriptedCodec::new(script);
        assert_eq!(codec.take_leftover(), Bytes::from_static(b"abc"));
        assert!(codec.take_leftover().is_empty());
    }
}
