//! Async timeout sweep
//!
//! Processors whose request is suspended are tracked in [`WaitingProcessors`].
//! A background thread wakes every `timeout_sweep_interval` and asks each of
//! them whether its suspension has expired.

use crate::async_state::now_millis;
use crate::processor::{AsyncTimeoutHandle, ProcessorId};
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Processors with a suspended request or an upgraded connection.
#[derive(Default)]
pub struct WaitingProcessors {
    entries: DashMap<ProcessorId, Arc<dyn AsyncTimeoutHandle>>,
}

impl WaitingProcessors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, id: ProcessorId, handle: Arc<dyn AsyncTimeoutHandle>) {
        self.entries.insert(id, handle);
    }

    pub fn remove(&self, id: &ProcessorId) -> bool {
        self.entries.remove(id).is_some()
    }

    pub fn contains(&self, id: &ProcessorId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check every waiting processor against `now` (negative expires all).
    pub fn timeout_all(&self, now: i64) {
        // Handles may schedule socket events; never call them under a shard lock
        let handles: Vec<Arc<dyn AsyncTimeoutHandle>> =
            self.entries.iter().map(|e| e.value().clone()).collect();
        for handle in handles {
            handle.timeout_async(now);
        }
    }
}

impl std::fmt::Debug for WaitingProcessors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitingProcessors")
            .field("len", &self.len())
            .finish()
    }
}

/// Background thread running [`WaitingProcessors::timeout_all`].
pub struct AsyncTimeoutSweeper {
    stop: Arc<AtomicBool>,
    waiting: Arc<WaitingProcessors>,
    handle: Option<JoinHandle<()>>,
}

impl AsyncTimeoutSweeper {
    /// Spawn the sweep thread.
    pub fn spawn(
        waiting: Arc<WaitingProcessors>,
        paused: Arc<AtomicBool>,
        interval: Duration,
    ) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = stop.clone();
            let waiting = waiting.clone();
            thread::Builder::new()
                .name("portico-async-timeout".to_string())
                .spawn(move || {
                    debug!(?interval, "async timeout sweep started");
                    while !stop.load(Ordering::Acquire) {
                        thread::park_timeout(interval);
                        if stop.load(Ordering::Acquire) {
                            break;
                        }
                        if paused.load(Ordering::Acquire) {
                            continue;
                        }
                        waiting.timeout_all(now_millis());
                    }
                    debug!("async timeout sweep stopped");
                })?
        };
        info!(?interval, "async timeout sweep running");
        Ok(Self {
            stop,
            waiting,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the thread, then expire every suspension still waiting.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.stop.store(true, Ordering::Release);
        handle.thread().unpark();
        if handle.join().is_err() {
            warn!("async timeout sweep thread panicked");
        }
        self.waiting.timeout_all(-1);
    }
}

impl Drop for AsyncTimeoutSweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for AsyncTimeoutSweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncTimeoutSweeper")
            .field("running", &self.is_running())
            .finish()
    }
}
