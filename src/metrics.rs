//! Prometheus Metrics
//!
//! Metric families for task lifecycles and object restores, registered in the
//! process-default Prometheus registry and served by the binary on
//! `/metrics`.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};

use crate::error::{Error, Result};
use crate::xact::TaskKind;

static TASKS_STARTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ecrestore_tasks_started_total",
        "Extended actions started",
        &["kind"]
    )
    .expect("static metric definition")
});

static TASKS_FINISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ecrestore_tasks_finished_total",
        "Extended actions finished",
        &["kind", "outcome"]
    )
    .expect("static metric definition")
});

static RESTORES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ecrestore_restores_total",
        "Object restore requests resolved",
        &["outcome"]
    )
    .expect("static metric definition")
});

static RESTORED_BYTES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "ecrestore_restored_bytes_total",
        "Bytes of reconstructed object data received from peers"
    )
    .expect("static metric definition")
});

static REQUESTS_IN_FLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "ecrestore_requests_in_flight",
        "Restore requests accepted and not yet resolved"
    )
    .expect("static metric definition")
});

pub fn task_started(kind: TaskKind) {
    TASKS_STARTED.with_label_values(&[kind.as_str()]).inc();
}

pub fn task_finished(kind: TaskKind, aborted: bool) {
    let outcome = if aborted { "aborted" } else { "ok" };
    TASKS_FINISHED
        .with_label_values(&[kind.as_str(), outcome])
        .inc();
}

pub fn restore_resolved(ok: bool, bytes: u64) {
    let outcome = if ok { "ok" } else { "error" };
    RESTORES.with_label_values(&[outcome]).inc();
    RESTORED_BYTES.inc_by(bytes);
}

pub fn request_accepted() {
    REQUESTS_IN_FLIGHT.inc();
}

pub fn request_resolved() {
    REQUESTS_IN_FLIGHT.dec();
}

/// Render all registered metrics in the text exposition format
pub fn gather_text() -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| Error::Internal(format!("Failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer).map_err(|e| Error::Internal(format!("Metrics not UTF-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_includes_task_metrics() {
        task_started(TaskKind::new("metrics-test"));
        task_finished(TaskKind::new("metrics-test"), true);

        let text = gather_text().unwrap();
        assert!(text.contains("ecrestore_tasks_started_total"));
        assert!(text.contains("kind=\"metrics-test\""));
        assert!(text.contains("outcome=\"aborted\""));
    }
}
