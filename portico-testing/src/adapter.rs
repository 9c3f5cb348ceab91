// Scripted adapter and async callback

use parking_lot::Mutex;
use portico_core::{Adapter, AsyncCallback, Request, Response, Result, SocketEvent};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

type ServiceFn = dyn Fn(&mut Request, &mut Response) -> Result<()> + Send + Sync;
type DispatchFn = dyn Fn(&mut Request, &mut Response, SocketEvent) -> Result<bool> + Send + Sync;

/// A call the core made into the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterCall {
    Service { uri: String },
    AsyncDispatch { event: SocketEvent, was_async: bool },
    LogAccess { status: u16 },
    CheckRecycled,
}

/// Adapter whose behaviour is supplied as closures.
///
/// Without closures, `service` answers 200 and `async_dispatch` lets the
/// exchange finish.
pub struct ScriptedAdapter {
    service: Box<ServiceFn>,
    dispatch: Box<DispatchFn>,
    calls: Mutex<Vec<AdapterCall>>,
}

impl ScriptedAdapter {
    pub fn new() -> Self {
        Self {
            service: Box::new(|_, response| {
                response.set_status(200);
                Ok(())
            }),
            dispatch: Box::new(|_, _, _| Ok(true)),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn on_service<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Request, &mut Response) -> Result<()> + Send + Sync + 'static,
    {
        self.service = Box::new(f);
        self
    }

    pub fn on_async_dispatch<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Request, &mut Response, SocketEvent) -> Result<bool> + Send + Sync + 'static,
    {
        self.dispatch = Box::new(f);
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn calls(&self) -> Vec<AdapterCall> {
        self.calls.lock().clone()
    }

    pub fn service_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, AdapterCall::Service { .. }))
            .count()
    }

    /// Events passed to `async_dispatch`, oldest first.
    pub fn dispatched_events(&self) -> Vec<SocketEvent> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                AdapterCall::AsyncDispatch { event, .. } => Some(*event),
                _ => None,
            })
            .collect()
    }
}

impl Default for ScriptedAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl Adapter for ScriptedAdapter {
    fn service(&self, request: &mut Request, response: &mut Response) -> Result<()> {
        self.calls.lock().push(AdapterCall::Service {
            uri: request.uri().to_string(),
        });
        (self.service)(request, response)
    }

    fn async_dispatch(
        &self,
        request: &mut Request,
        response: &mut Response,
        event: SocketEvent,
    ) -> Result<bool> {
        self.calls.lock().push(AdapterCall::AsyncDispatch {
            event,
            was_async: request.is_async(),
        });
        (self.dispatch)(request, response, event)
    }

    fn log_access(&self, _request: &Request, response: &Response, _elapsed: Duration) {
        self.calls.lock().push(AdapterCall::LogAccess {
            status: response.status(),
        });
    }

    fn check_recycled(&self, _request: &Request, _response: &Response) {
        self.calls.lock().push(AdapterCall::CheckRecycled);
    }

    fn domain(&self) -> Option<&str> {
        Some("test")
    }
}

/// Async callback that counts completion notifications.
#[derive(Debug)]
pub struct RecordingCallback {
    completions: AtomicUsize,
    available: AtomicBool,
}

impl RecordingCallback {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            completions: AtomicUsize::new(0),
            available: AtomicBool::new(true),
        })
    }

    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::Acquire)
    }

    /// Mark the application's async context as unusable.
    pub fn invalidate(&self) {
        self.available.store(false, Ordering::Release);
    }
}

impl AsyncCallback for RecordingCallback {
    fn fire_on_complete(&self) {
        self.completions.fetch_add(1, Ordering::AcqRel);
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }
}
