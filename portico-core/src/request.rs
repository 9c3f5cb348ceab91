// Request carrier

use crate::action::{Action, ActionHook, ActionReply, AsyncHandle, ThreadOrigin};
use crate::async_state::AsyncCallback;
use crate::error::{Error, Result};
use bytes::Bytes;
use http::{HeaderMap, Method, Version};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

/// Application callbacks for non-blocking reads.
pub trait ReadListener: Send + Sync {
    fn on_data_available(&self) -> Result<()>;
    fn on_all_data_read(&self) -> Result<()>;
    fn on_error(&self, error: &Error);
}

/// Reusable holder for the metadata of one request.
///
/// Owned by a single processor; every field is reset by [`Request::recycle`].
pub struct Request {
    method: Method,
    uri: String,
    query: Option<String>,
    version: Version,
    headers: HeaderMap,
    content_length: Option<u64>,
    remote_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    attributes: HashMap<String, String>,
    bytes_read: u64,
    start_time: Option<Instant>,
    expect_continue: bool,
    read_listener: Option<Arc<dyn ReadListener>>,
    hook: Option<Arc<dyn ActionHook>>,
}

impl Request {
    pub fn new() -> Self {
        Self {
            method: Method::GET,
            uri: String::new(),
            query: None,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            content_length: None,
            remote_addr: None,
            local_addr: None,
            attributes: HashMap::new(),
            bytes_read: 0,
            start_time: None,
            expect_continue: false,
            read_listener: None,
            hook: None,
        }
    }

    /// Bind the processor that receives this request's actions.
    pub fn set_hook(&mut self, hook: Arc<dyn ActionHook>) {
        self.hook = Some(hook);
    }

    /// Send an action from the container thread.
    pub fn action(&self, action: Action<'_>) -> Result<ActionReply> {
        self.action_from(action, ThreadOrigin::Container)
    }

    pub fn action_from(&self, action: Action<'_>, origin: ThreadOrigin) -> Result<ActionReply> {
        match &self.hook {
            Some(hook) => hook.action(action, origin),
            None => Err(Error::ProcessorClosed),
        }
    }

    /// Handle that other threads use to complete or dispatch this request.
    pub fn async_handle(&self) -> Result<AsyncHandle> {
        self.hook
            .clone()
            .map(AsyncHandle::new)
            .ok_or(Error::ProcessorClosed)
    }

    /// Suspend the request.
    pub fn start_async(&self, callback: Arc<dyn AsyncCallback>) -> Result<AsyncHandle> {
        self.action(Action::AsyncStart(callback))?;
        self.async_handle()
    }

    pub fn is_async(&self) -> bool {
        self.action(Action::AsyncIsAsync)
            .map(|r| r.flag())
            .unwrap_or(false)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn set_uri(&mut self, uri: impl Into<String>) {
        self.uri = uri.into();
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn set_query(&mut self, query: Option<String>) {
        self.query = query;
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn set_content_length(&mut self, len: Option<u64>) {
        self.content_length = len;
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr.or_else(|| {
            self.action(Action::ReqRemoteAddr)
                .ok()
                .and_then(|r| r.addr())
        })
    }

    pub fn set_remote_addr(&mut self, addr: Option<SocketAddr>) {
        self.remote_addr = addr;
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.or_else(|| {
            self.action(Action::ReqLocalAddr)
                .ok()
                .and_then(|r| r.addr())
        })
    }

    pub fn set_local_addr(&mut self, addr: Option<SocketAddr>) {
        self.local_addr = addr;
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(name.into(), value.into());
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn add_bytes_read(&mut self, n: u64) {
        self.bytes_read += n;
    }

    pub fn start_time(&self) -> Option<Instant> {
        self.start_time
    }

    /// Mark the start of processing.
    pub fn mark_start(&mut self) {
        self.start_time = Some(Instant::now());
    }

    pub fn expects_continue(&self) -> bool {
        self.expect_continue
    }

    pub fn set_expect_continue(&mut self, expect: bool) {
        self.expect_continue = expect;
    }

    /// Replace the body the application will read.
    pub fn set_body_replay(&self, body: Bytes) -> Result<()> {
        self.action(Action::ReqSetBodyReplay(body)).map(|_| ())
    }

    pub fn read_listener(&self) -> Option<&Arc<dyn ReadListener>> {
        self.read_listener.as_ref()
    }

    /// Switch the request body to non-blocking reads.
    pub fn set_read_listener(&mut self, listener: Arc<dyn ReadListener>) -> Result<()> {
        if !self.action(Action::AsyncIsAsync)?.flag() {
            return Err(Error::Adapter(
                "read listener requires an async request".to_string(),
            ));
        }
        self.read_listener = Some(listener);
        // Ready now? Then let the container call on_data_available.
        if self.action(Action::NbReadInterest)?.flag() {
            self.action(Action::DispatchRead)?;
        }
        Ok(())
    }

    pub fn clear_read_listener(&mut self) {
        self.read_listener = None;
    }

    /// Reset for reuse. The hook stays bound.
    pub fn recycle(&mut self) {
        self.method = Method::GET;
        self.uri.clear();
        self.query = None;
        self.version = Version::HTTP_11;
        self.headers.clear();
        self.content_length = None;
        self.remote_addr = None;
        self.local_addr = None;
        self.attributes.clear();
        self.bytes_read = 0;
        self.start_time = None;
        self.expect_continue = false;
        self.read_listener = None;
    }
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("version", &self.version)
            .field("bytes_read", &self.bytes_read)
            .finish()
    }
}
