// Response carrier

use crate::action::{Action, ActionHook, ActionReply};
use crate::error::{Error, Result};
use http::HeaderMap;
use std::sync::Arc;

/// Application callbacks for non-blocking writes.
pub trait WriteListener: Send + Sync {
    fn on_write_possible(&self) -> Result<()>;
    fn on_error(&self, error: &Error);
}

/// Reusable holder for the metadata of one response.
pub struct Response {
    status: u16,
    message: Option<String>,
    headers: HeaderMap,
    content_type: Option<String>,
    content_length: Option<u64>,
    committed: bool,
    bytes_written: u64,
    error_reported: bool,
    write_listener: Option<Arc<dyn WriteListener>>,
    hook: Option<Arc<dyn ActionHook>>,
}

impl Response {
    pub fn new() -> Self {
        Self {
            status: 200,
            message: None,
            headers: HeaderMap::new(),
            content_type: None,
            content_length: None,
            committed: false,
            bytes_written: 0,
            error_reported: false,
            write_listener: None,
            hook: None,
        }
    }

    pub fn set_hook(&mut self, hook: Arc<dyn ActionHook>) {
        self.hook = Some(hook);
    }

    pub fn action(&self, action: Action<'_>) -> Result<ActionReply> {
        match &self.hook {
            Some(hook) => hook.action(action, crate::action::ThreadOrigin::Container),
            None => Err(Error::ProcessorClosed),
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// Set the status code. Ignored once the head has been written.
    pub fn set_status(&mut self, status: u16) {
        if !self.committed {
            self.status = status;
        }
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn set_message(&mut self, message: impl Into<String>) {
        self.message = Some(message.into());
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.content_type = Some(content_type.into());
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn set_content_length(&mut self, len: Option<u64>) {
        self.content_length = len;
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn add_bytes_written(&mut self, n: u64) {
        self.bytes_written += n;
    }

    /// Whether an error was reported against this response.
    pub fn is_error_reported(&self) -> bool {
        self.error_reported
    }

    pub fn set_error_reported(&mut self) {
        self.error_reported = true;
    }

    /// Write the response head if it has not been written yet.
    pub fn commit(&mut self) -> Result<()> {
        if self.committed {
            return Ok(());
        }
        self.action(Action::Commit {
            status: self.status,
            headers: &self.headers,
        })?;
        self.committed = true;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.commit()?;
        self.action(Action::ClientFlush).map(|_| ())
    }

    /// Commit and finish the response.
    pub fn finish(&mut self) -> Result<()> {
        self.commit()?;
        self.action(Action::Close).map(|_| ())
    }

    /// Send an interim `100 Continue`.
    pub fn acknowledge(&self) -> Result<()> {
        self.action(Action::Ack).map(|_| ())
    }

    pub fn write_listener(&self) -> Option<&Arc<dyn WriteListener>> {
        self.write_listener.as_ref()
    }

    /// Switch the response body to non-blocking writes.
    pub fn set_write_listener(&mut self, listener: Arc<dyn WriteListener>) -> Result<()> {
        if !self.action(Action::AsyncIsAsync)?.flag() {
            return Err(Error::Adapter(
                "write listener requires an async request".to_string(),
            ));
        }
        self.write_listener = Some(listener);
        if self.action(Action::NbWriteInterest)?.flag() {
            self.action(Action::DispatchWrite)?;
        }
        Ok(())
    }

    pub fn clear_write_listener(&mut self) {
        self.write_listener = None;
    }

    /// Reset for reuse. The hook stays bound.
    pub fn recycle(&mut self) {
        self.status = 200;
        self.message = None;
        self.headers.clear();
        self.content_type = None;
        self.content_length = None;
        self.committed = false;
        self.bytes_written = 0;
        self.error_reported = false;
        self.write_listener = None;
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("committed", &self.committed)
            .field("bytes_written", &self.bytes_written)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_defaults() {
        let response = Response::new();
        assert_eq!(response.status(), 200);
        assert!(!response.is_committed());
        assert!(!response.is_error_reported());
    }

    #[test]
    fn test_response_recycle() {
        let mut response = Response::new();
        response.set_status(404);
        response.set_message("Not Found");
        response.set_content_type("text/plain");
        response.add_bytes_written(128);
        response.set_error_reported();

        response.recycle();

        assert_eq!(response.status(), 200);
        assert!(response.message().is_none());
        assert!(response.content_type().is_none());
        assert_eq!(response.bytes_written(), 0);
        assert!(!response.is_error_reported());
    }

    #[test]
    fn test_commit_requires_hook() {
        let mut response = Response::new();
        assert!(matches!(response.commit(), Err(Error::ProcessorClosed)));
        assert!(!response.is_committed());
    }
}
