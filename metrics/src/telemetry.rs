//! Prometheus counters for the metrics engine

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, Counter, CounterVec, Encoder, Gauge,
    TextEncoder,
};

// ── Counter library ──────────────────────────────────────────────────────────

pub static LIBRARY_CONTEXTS_CREATED: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "lzmetrics_library_contexts_created_total",
        "Counter-library contexts created"
    )
    .unwrap()
});

pub static LIBRARY_CONTEXTS_RELEASED: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "lzmetrics_library_contexts_released_total",
        "Counter-library contexts released"
    )
    .unwrap()
});

// ── Activation ───────────────────────────────────────────────────────────────

pub static ACTIVATION_COMMITS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "lzmetrics_activation_commits_total",
        "Metric group activations pushed to hardware",
        &["mode"]
    )
    .unwrap()
});

// ── Queries and streamers ────────────────────────────────────────────────────

pub static QUERY_POOLS_CREATED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "lzmetrics_query_pools_created_total",
        "Metric query pools created",
        &["type"]
    )
    .unwrap()
});

pub static OPEN_STREAMERS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("lzmetrics_open_streamers", "Currently open metric streamers").unwrap()
});

pub static REPORTS_READ: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "lzmetrics_streamer_reports_read_total",
        "Raw reports read from streamers"
    )
    .unwrap()
});

pub static DROPPED_DATA: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "lzmetrics_streamer_dropped_data_total",
        "Streamer reads that reported lost reports"
    )
    .unwrap()
});

/// Encode all registered metrics in the Prometheus text format
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap_or_default();
    String::from_utf8(buffer).unwrap_or_default()
}
