//! Prometheus metrics for the upload engine.
//!
//! Counters carry no per-upload labels; file keys, owners and categories are
//! never exported.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all engine metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Upload lifecycle
pub static UPLOADS_INITIALIZED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "parcel_uploads_initialized_total",
        "Total number of uploads initialized",
    )
    .expect("metric creation failed")
});

pub static UPLOADS_DEDUPLICATED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "parcel_uploads_deduplicated_total",
        "Total number of initializations answered by an existing completed upload",
    )
    .expect("metric creation failed")
});

pub static UPLOADS_MERGED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "parcel_uploads_merged_total",
        "Total number of uploads merged into a final artifact",
    )
    .expect("metric creation failed")
});

pub static UPLOADS_DELETED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "parcel_uploads_deleted_total",
        "Total number of uploads deleted by their owner",
    )
    .expect("metric creation failed")
});

pub static MERGE_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "parcel_merge_failures_total",
        "Total number of merges that failed and left the upload in progress",
    )
    .expect("metric creation failed")
});

// Chunks
pub static CHUNKS_ACCEPTED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "parcel_chunks_accepted_total",
        "Total number of chunk payloads written",
    )
    .expect("metric creation failed")
});

pub static CHUNK_BYTES_ACCEPTED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "parcel_chunk_bytes_accepted_total",
        "Total chunk payload bytes written",
    )
    .expect("metric creation failed")
});

pub static CHUNKS_REJECTED_BY_GATE: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "parcel_chunks_rejected_by_gate_total",
        "Total number of chunk writes rejected because the concurrency limit was reached",
    )
    .expect("metric creation failed")
});

// Timing
pub static MERGE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "parcel_merge_duration_seconds",
            "Time taken to assemble and finalize an upload",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
    )
    .expect("metric creation failed")
});

// Sweeper
pub static SWEEP_ITEMS_DELETED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "parcel_sweep_items_deleted_total",
            "Total items removed by the expiry sweeper, by kind",
        ),
        &["kind"],
    )
    .expect("metric creation failed")
});

pub static UPLOAD_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "parcel_upload_errors_total",
            "Total engine errors by error code",
        ),
        &["code"],
    )
    .expect("metric creation failed")
});

/// Guard to ensure metrics are only registered once.
static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Idempotent; later calls are no-ops.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(UPLOADS_INITIALIZED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPLOADS_DEDUPLICATED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPLOADS_MERGED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPLOADS_DELETED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(MERGE_FAILURES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CHUNKS_ACCEPTED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CHUNK_BYTES_ACCEPTED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CHUNKS_REJECTED_BY_GATE.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(MERGE_DURATION.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(SWEEP_ITEMS_DELETED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPLOAD_ERRORS.clone()))
            .expect("metric registration failed");
    });
}

/// Render all registered metrics in the Prometheus text exposition format.
pub fn gather_text() -> Result<String, prometheus::Error> {
    register_metrics();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

/// Helper to record engine errors by code.
pub fn record_upload_error(code: &str) {
    UPLOAD_ERRORS.with_label_values(&[code]).inc();
}
