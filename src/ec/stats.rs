//! Restore engine statistics
//!
//! Monotone atomic counters updated by workers and the dispatch path; the
//! stats ticker and snapshots read them without blocking producers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Counters of one engine
#[derive(Debug, Default)]
pub struct RestoreStats {
    /// Objects reconstructed and persisted
    decoded: AtomicU64,
    decode_ns: AtomicU64,
    /// Requests resolved, successful or not
    objects: AtomicU64,
    object_ns: AtomicU64,
    errors: AtomicU64,
    bytes: AtomicU64,
    queue_len_sum: AtomicU64,
    queue_samples: AtomicU64,
}

impl RestoreStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fetch resolved and the object was persisted
    pub fn record_decode(&self, elapsed: Duration, bytes: u64) {
        self.decoded.fetch_add(1, Ordering::Relaxed);
        self.decode_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// A request reached its terminal outcome; `elapsed` counts from enqueue
    pub fn record_object(&self, elapsed: Duration, ok: bool) {
        self.objects.fetch_add(1, Ordering::Relaxed);
        self.object_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        if !ok {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Queue length seen by the dispatch path before enqueueing
    pub fn sample_queue_len(&self, len: usize) {
        self.queue_len_sum.fetch_add(len as u64, Ordering::Relaxed);
        self.queue_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RestoreStatsSnapshot {
        let decoded = self.decoded.load(Ordering::Relaxed);
        let objects = self.objects.load(Ordering::Relaxed);
        let samples = self.queue_samples.load(Ordering::Relaxed);
        RestoreStatsSnapshot {
            decoded,
            objects,
            errors: self.errors.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            avg_decode: average(self.decode_ns.load(Ordering::Relaxed), decoded),
            avg_object: average(self.object_ns.load(Ordering::Relaxed), objects),
            avg_queue_len: if samples == 0 {
                0.0
            } else {
                self.queue_len_sum.load(Ordering::Relaxed) as f64 / samples as f64
            },
        }
    }
}

fn average(total_ns: u64, count: u64) -> Duration {
    if count == 0 {
        Duration::ZERO
    } else {
        Duration::from_nanos(total_ns / count)
    }
}

/// Point-in-time view of [`RestoreStats`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RestoreStatsSnapshot {
    pub decoded: u64,
    pub objects: u64,
    pub errors: u64,
    pub bytes: u64,
    pub avg_decode: Duration,
    pub avg_object: Duration,
    pub avg_queue_len: f64,
}

impl std::fmt::Display for RestoreStatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "decoded={} objects={} errors={} bytes={} avg_decode={:?} avg_object={:?} avg_queue={:.2}",
            self.decoded,
            self.objects,
            self.errors,
            self.bytes,
            self.avg_decode,
            self.avg_object,
            self.avg_queue_len
        )
    }
}
