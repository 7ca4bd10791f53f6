#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::FetchError;

/// Process-lifetime counters behind `/api/stats`.
#[derive(Debug)]
pub struct GatewayStats {
    started_at: DateTime<Utc>,
    requests: AtomicU64,
    rate_limited: AtomicU64,
    overloaded: AtomicU64,
    queue_full: AtomicU64,
    metadata_lookups: AtomicU64,
    metadata_failures: AtomicU64,
    downloads_completed: AtomicU64,
    downloads_failed: AtomicU64,
    downloads_cancelled: AtomicU64,
    bytes_streamed: AtomicU64,
    retries: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub requests: u64,
    pub rate_limited: u64,
    pub overloaded: u64,
    pub queue_full: u64,
    pub metadata_lookups: u64,
    pub metadata_failures: u64,
    pub downloads_completed: u64,
    pub downloads_failed: u64,
    pub downloads_cancelled: u64,
    pub bytes_streamed: u64,
    pub retries: u64,
}

impl Default for GatewayStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            requests: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            overloaded: AtomicU64::new(0),
            queue_full: AtomicU64::new(0),
            metadata_lookups: AtomicU64::new(0),
            metadata_failures: AtomicU64::new(0),
            downloads_completed: AtomicU64::new(0),
            downloads_failed: AtomicU64::new(0),
            downloads_cancelled: AtomicU64::new(0),
            bytes_streamed: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl GatewayStats {
    pub fn record_request(&self) {
        bump(&self.requests);
    }

    /// Counts a request turned away before it reached a queue.
    pub fn record_rejection(&self, error: &FetchError) {
        match error {
            FetchError::RateLimited { .. } => bump(&self.rate_limited),
            FetchError::Overloaded(_) => bump(&self.overloaded),
            FetchError::QueueFull { .. } => bump(&self.queue_full),
            _ => {}
        }
    }

    pub fn record_metadata(&self, ok: bool) {
        bump(&self.metadata_lookups);
        if !ok {
            bump(&self.metadata_failures);
        }
    }

    pub fn record_download(&self, outcome: &Result<u64, FetchError>) {
        match outcome {
            Ok(bytes) => {
                bump(&self.downloads_completed);
                self.bytes_streamed.fetch_add(*bytes, Ordering::Relaxed);
            }
            Err(FetchError::ClientDisconnected) => bump(&self.downloads_cancelled),
            Err(_) => bump(&self.downloads_failed),
        }
    }

    pub fn record_partial_bytes(&self, bytes: u64) {
        self.bytes_streamed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        bump(&self.retries);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            requests: load(&self.requests),
            rate_limited: load(&self.rate_limited),
            overloaded: load(&self.overloaded),
            queue_full: load(&self.queue_full),
            metadata_lookups: load(&self.metadata_lookups),
            metadata_failures: load(&self.metadata_failures),
            downloads_completed: load(&self.downloads_completed),
            downloads_failed: load(&self.downloads_failed),
            downloads_cancelled: load(&self.downloads_cancelled),
            bytes_streamed: load(&self.bytes_streamed),
            retries: load(&self.retries),
        }
    }
}
