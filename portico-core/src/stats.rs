//! Request statistics
//!
//! Each processor owns a [`RequestInfo`] that it updates at the end of every
//! request. The protocol handler owns a [`RequestGroupInfo`] that sums the
//! live processors plus everything rolled up from processors that have been
//! discarded.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

/// Where a processor currently is in the request lifecycle.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
pub enum RequestStage {
    #[default]
    New = 0,
    Parse = 1,
    Prepare = 2,
    Service = 3,
    EndInput = 4,
    EndOutput = 5,
    KeepAlive = 6,
    Ended = 7,
}

impl RequestStage {
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Parse,
            2 => Self::Prepare,
            3 => Self::Service,
            4 => Self::EndInput,
            5 => Self::EndOutput,
            6 => Self::KeepAlive,
            7 => Self::Ended,
            _ => Self::New,
        }
    }
}

// ============================================================================
// Per-processor counters
// ============================================================================

/// Counters for one processor.
#[derive(Debug, Default)]
pub struct RequestInfo {
    stage: AtomicU8,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    processing_time_ms: AtomicU64,
    max_time_ms: AtomicU64,
    request_count: AtomicU64,
    error_count: AtomicU64,
}

impl RequestInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&self) -> RequestStage {
        RequestStage::from_u8(self.stage.load(Ordering::Relaxed))
    }

    pub fn set_stage(&self, stage: RequestStage) {
        self.stage.store(stage as u8, Ordering::Relaxed);
    }

    /// Fold one finished request into the counters.
    pub fn record_request(&self, bytes_received: u64, bytes_sent: u64, elapsed: Duration, error: bool) {
        let ms = elapsed.as_millis() as u64;
        self.bytes_received.fetch_add(bytes_received, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes_sent, Ordering::Relaxed);
        self.processing_time_ms.fetch_add(ms, Ordering::Relaxed);
        self.max_time_ms.fetch_max(ms, Ordering::Relaxed);
        self.request_count.fetch_add(1, Ordering::Relaxed);
        if error {
            self.error_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn processing_time_ms(&self) -> u64 {
        self.processing_time_ms.load(Ordering::Relaxed)
    }

    pub fn max_time_ms(&self) -> u64 {
        self.max_time_ms.load(Ordering::Relaxed)
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> RequestStats {
        RequestStats {
            bytes_sent: self.bytes_sent(),
            bytes_received: self.bytes_received(),
            processing_time_ms: self.processing_time_ms(),
            max_time_ms: self.max_time_ms(),
            request_count: self.request_count(),
            error_count: self.error_count(),
        }
    }
}

/// Point-in-time copy of request counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RequestStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub processing_time_ms: u64,
    pub max_time_ms: u64,
    pub request_count: u64,
    pub error_count: u64,
}

impl RequestStats {
    fn merge(mut self, other: RequestStats) -> Self {
        self.bytes_sent += other.bytes_sent;
        self.bytes_received += other.bytes_received;
        self.processing_time_ms += other.processing_time_ms;
        self.max_time_ms = self.max_time_ms.max(other.max_time_ms);
        self.request_count += other.request_count;
        self.error_count += other.error_count;
        self
    }
}

// ============================================================================
// Connector-wide totals
// ============================================================================

/// Totals across every processor of one protocol handler.
#[derive(Debug, Default)]
pub struct RequestGroupInfo {
    live: Mutex<Vec<Arc<RequestInfo>>>,
    retired: Mutex<RequestStats>,
}

impl RequestGroupInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, info: Arc<RequestInfo>) {
        self.live.lock().push(info);
    }

    /// Drop a processor's counters from the live set, keeping its totals.
    pub fn unregister(&self, info: &Arc<RequestInfo>) {
        let mut live = self.live.lock();
        if let Some(pos) = live.iter().position(|i| Arc::ptr_eq(i, info)) {
            live.swap_remove(pos);
            let mut retired = self.retired.lock();
            *retired = retired.merge(info.snapshot());
        }
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    pub fn totals(&self) -> RequestStats {
        let base = *self.retired.lock();
        self.live
            .lock()
            .iter()
            .fold(base, |acc, info| acc.merge(info.snapshot()))
    }

    /// Clear retired totals and the counters of every live processor.
    pub fn reset(&self) {
        *self.retired.lock() = RequestStats::default();
        for info in self.live.lock().iter() {
            info.bytes_sent.store(0, Ordering::Relaxed);
            info.bytes_received.store(0, Ordering::Relaxed);
            info.processing_time_ms.store(0, Ordering::Relaxed);
            info.max_time_ms.store(0, Ordering::Relaxed);
            info.request_count.store(0, Ordering::Relaxed);
            info.error_count.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_request() {
        let info = RequestInfo::new();
        info.record_request(100, 2048, Duration::from_millis(15), false);
        info.record_request(50, 10, Duration::from_millis(40), true);

        assert_eq!(info.bytes_received(), 150);
        assert_eq!(info.bytes_sent(), 2058);
        assert_eq!(info.processing_time_ms(), 55);
        assert_eq!(info.max_time_ms(), 40);
        assert_eq!(info.request_count(), 2);
        assert_eq!(info.error_count(), 1);
    }

    #[test]
    fn test_stage_round_trip() {
        let info = RequestInfo::new();
        assert_eq!(info.stage(), RequestStage::New);
        info.set_stage(RequestStage::Service);
        assert_eq!(info.stage(), RequestStage::Service);
    }

    #[test]
    fn test_group_rolls_up_on_unregister() {
        let group = RequestGroupInfo::new();
        let a = Arc::new(RequestInfo::new());
        let b = Arc::new(RequestInfo::new());
        group.register(a.clone());
        group.register(b.clone());

        a.record_request(10, 20, Duration::from_millis(5), false);
        b.record_request(1, 2, Duration::from_millis(9), true);
        assert_eq!(group.totals().request_count, 2);

        // Unregister keeps the totals
        group.unregister(&a);
        assert_eq!(group.live_count(), 1);
        let totals = group.totals();
        assert_eq!(totals.request_count, 2);
        assert_eq!(totals.bytes_sent, 22);
        assert_eq!(totals.max_time_ms, 9);
        assert_eq!(totals.error_count, 1);

        // Second unregister is a no-op
        group.unregister(&a);
        assert_eq!(group.totals().request_count, 2);
    }

    #[test]
    fn test_group_reset() {
        let group = RequestGroupInfo::new();
        let a = Arc::new(RequestInfo::new());
        group.register(a.clone());
        a.record_request(10, 20, Duration::from_millis(5), false);
        group.reset();
        assert_eq!(group.totals(), RequestStats::default());
    }

    #[test]
    fn test_stats_serialize() {
        let stats = RequestStats {
            request_count: 3,
            ..Default::default()
        };
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"request_count\":3"));
    }
}
