//! Service metrics: counters, latency reservoirs and the single snapshot
//! surfaced over RPC and in diagnostics bundles.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use aim_core::error::{ErrorCategory, UnavailableReason};
use serde::{Deserialize, Serialize};

const LATENCY_RESERVOIR: usize = 256;

#[derive(Default)]
pub struct Metrics {
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub receipts_emitted: AtomicU64,
    pub retry_attempts_total: AtomicU64,
    pub hard_cap_hits: AtomicU64,
    pub blob_fetches_served: AtomicU64,
    pub blob_fetches_ok: AtomicU64,
    pub notification_backlog: AtomicU64,
    errors: Mutex<HashMap<String, u64>>,
    fetch_unavailable: Mutex<HashMap<String, u64>>,
    latencies: Mutex<HashMap<String, Vec<u64>>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count_error(&self, category: ErrorCategory) {
        *self.errors.lock().unwrap().entry(category.to_string()).or_insert(0) += 1;
    }

    pub fn count_unavailable(&self, reason: UnavailableReason) {
        *self
            .fetch_unavailable
            .lock()
            .unwrap()
            .entry(reason.as_str().to_string())
            .or_insert(0) += 1;
    }

    pub fn record_latency_ms(&self, op: &str, ms: u64) {
        let mut latencies = self.latencies.lock().unwrap();
        let reservoir = latencies.entry(op.to_string()).or_default();
        if reservoir.len() >= LATENCY_RESERVOIR {
            reservoir.remove(0);
        }
        reservoir.push(ms);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let latencies = self.latencies.lock().unwrap();
        let mut ops = HashMap::new();
        for (op, samples) in latencies.iter() {
            if samples.is_empty() {
                continue;
            }
            let mut sorted = samples.clone();
            sorted.sort_unstable();
            ops.insert(
                op.clone(),
                LatencySummary {
                    samples: sorted.len(),
                    p50_ms: percentile(&sorted, 50),
                    p95_ms: percentile(&sorted, 95),
                    p99_ms: percentile(&sorted, 99),
                },
            );
        }

        MetricsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            receipts_emitted: self.receipts_emitted.load(Ordering::Relaxed),
            retry_attempts_total: self.retry_attempts_total.load(Ordering::Relaxed),
            hard_cap_hits: self.hard_cap_hits.load(Ordering::Relaxed),
            blob_fetches_served: self.blob_fetches_served.load(Ordering::Relaxed),
            blob_fetches_ok: self.blob_fetches_ok.load(Ordering::Relaxed),
            notification_backlog: self.notification_backlog.load(Ordering::Relaxed),
            errors: self.errors.lock().unwrap().clone(),
            blob_fetch_unavailable: self.fetch_unavailable.lock().unwrap().clone(),
            op_latency: ops,
            peer_count: 0,
            pending_queue: 0,
            attachment_image_bytes: 0,
            attachment_file_bytes: 0,
        }
    }
}

fn percentile(sorted: &[u64], pct: usize) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (sorted.len() * pct).div_ceil(100);
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencySummary {
    pub samples: usize,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

/// One self-contained view of daemon health. Fields the metrics registry
/// cannot know (peer count, queue depth, disk usage) are filled in by the
/// service before the snapshot leaves the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub peer_count: usize,
    pub pending_queue: usize,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub receipts_emitted: u64,
    pub retry_attempts_total: u64,
    pub hard_cap_hits: u64,
    pub blob_fetches_served: u64,
    pub blob_fetches_ok: u64,
    pub notification_backlog: u64,
    pub attachment_image_bytes: u64,
    pub attachment_file_bytes: u64,
    pub errors: HashMap<String, u64>,
    pub blob_fetch_unavailable: HashMap<String, u64>,
    pub op_latency: HashMap<String, LatencySummary>,
}
