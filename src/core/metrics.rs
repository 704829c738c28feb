// src/core/metrics.rs

//! Defines and registers Prometheus metrics for runtime monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire process lifecycle, no matter how many sessions or
//! servers are created.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, Histogram, TextEncoder, register_counter, register_counter_vec,
    register_gauge, register_histogram,
};

lazy_static! {
    // --- Gauges ---
    /// The number of sessions that are currently ACTIVE.
    pub static ref ACTIVE_SESSIONS: Gauge =
        register_gauge!("tether_active_sessions", "Number of sessions currently in the ACTIVE state.").unwrap();
    /// The number of connections currently held in session pools.
    pub static ref POOLED_CONNECTIONS: Gauge =
        register_gauge!("tether_pooled_connections", "Number of connections currently held in session pools.").unwrap();


    // --- Counters ---
    /// Inbound requests and one-way messages, labeled by how the pipeline disposed of them.
    pub static ref REQUESTS_PROCESSED_TOTAL: CounterVec =
        register_counter_vec!("tether_requests_processed_total", "Total inbound messages processed, labeled by outcome.", &["outcome"]).unwrap();
    /// The total number of rebuild attempts started by client sessions.
    pub static ref SESSION_REBUILDS_TOTAL: Counter =
        register_counter!("tether_session_rebuilds_total", "Total number of session rebuild attempts.").unwrap();
    /// The total number of times a session entered the SLEEP backoff state.
    pub static ref SESSION_SLEEPS_TOTAL: Counter =
        register_counter!("tether_session_sleeps_total", "Total number of rebuild backoff sleeps.").unwrap();
    /// The total number of idle-connection acquisitions that exhausted their retry budget.
    pub static ref ACQUIRE_TIMEOUTS_TOTAL: Counter =
        register_counter!("tether_acquire_timeouts_total", "Total number of connection acquisitions that timed out.").unwrap();


    // --- Histograms ---
    /// Round-trip latency of client calls, from send to matching response.
    pub static ref CALL_LATENCY_SECONDS: Histogram =
        register_histogram!("tether_call_latency_seconds", "Round-trip latency of client calls in seconds.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_else(|e| format!("# failed to encode metrics: {e}"))
}
