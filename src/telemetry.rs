use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

/// Process counters for the dispatch pipeline.
#[derive(Default)]
pub struct HubStats {
    proxied: AtomicU64,
    fallbacks: AtomicU64,
    transforms: AtomicU64,
    transform_failures: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_recv: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl HubStats {
    pub fn on_proxied(&self, sent: usize, recv: usize) {
        self.proxied.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
        self.bytes_recv.fetch_add(recv as u64, Ordering::Relaxed);
    }

    pub fn on_fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_transform(&self, ok: bool) {
        if ok {
            self.transforms.fetch_add(1, Ordering::Relaxed);
        } else {
            self.transform_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn set_last_error(&self, err: impl ToString) {
        if let Ok(mut g) = self.last_error.lock() {
            *g = Some(err.to_string());
        }
    }

    pub fn snapshot(&self) -> HubStatsSnapshot {
        let last_error = self
            .last_error
            .lock()
            .ok()
            .and_then(|g| g.clone())
            .unwrap_or_default();
        HubStatsSnapshot {
            proxied_total: self.proxied.load(Ordering::Relaxed),
            fallback_total: self.fallbacks.load(Ordering::Relaxed),
            transform_total: self.transforms.load(Ordering::Relaxed),
            transform_failures: self.transform_failures.load(Ordering::Relaxed),
            bytes_sent_total: self.bytes_sent.load(Ordering::Relaxed),
            bytes_recv_total: self.bytes_recv.load(Ordering::Relaxed),
            last_error,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct HubStatsSnapshot {
    pub proxied_total: u64,
    pub fallback_total: u64,
    pub transform_total: u64,
    pub transform_failures: u64,
    pub bytes_sent_total: u64,
    pub bytes_recv_total: u64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_error: String,
}
