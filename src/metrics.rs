//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Dispatch metrics
    pub static ref ACTIVITIES_DISPATCHED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("lagoon_activities_dispatched_total", "Total number of dispatched activities"),
        &["activity_type", "outcome"]
    ).expect("metric can be created");
    pub static ref HOOK_FAILURES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("lagoon_hook_failures_total", "Total number of swallowed hook failures"),
        &["activity_type", "phase"]
    ).expect("metric can be created");

    // Fan-out metrics
    pub static ref TIMELINE_ENTRIES_UPSERTED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("lagoon_timeline_entries_upserted_total", "Total number of timeline entry upserts"),
        &["reason"]
    ).expect("metric can be created");

    // Federation metrics
    pub static ref DELIVERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("lagoon_deliveries_total", "Total number of per-domain delivery attempts"),
        &["status"]
    ).expect("metric can be created");
    pub static ref DELIVERY_RETRIES_TOTAL: IntCounter = IntCounter::new(
        "lagoon_delivery_retries_total",
        "Total number of delivery job reschedules"
    ).expect("metric can be created");
    pub static ref DELIVERY_JOBS_PENDING: IntGauge = IntGauge::new(
        "lagoon_delivery_jobs_pending",
        "Current number of pending delivery jobs"
    ).expect("metric can be created");
    pub static ref PULL_TOKENS_VERIFIED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("lagoon_pull_tokens_verified_total", "Total number of pull token verifications"),
        &["result"]
    ).expect("metric can be created");
    pub static ref REPLAYS_REJECTED_TOTAL: IntCounter = IntCounter::new(
        "lagoon_replays_rejected_total",
        "Total number of rejected replayed signatures"
    ).expect("metric can be created");

    // Error metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("lagoon_errors_total", "Total number of errors"),
        &["error_type"]
    ).expect("metric can be created");
}

/// Register all metrics with the global registry.
///
/// Call once at startup; duplicate registration is ignored so tests
/// can initialize repeatedly.
pub fn init_metrics() {
    let _ = REGISTRY.register(Box::new(ACTIVITIES_DISPATCHED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(HOOK_FAILURES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(TIMELINE_ENTRIES_UPSERTED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(DELIVERIES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(DELIVERY_RETRIES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(DELIVERY_JOBS_PENDING.clone()));
    let _ = REGISTRY.register(Box::new(PULL_TOKENS_VERIFIED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(REPLAYS_REJECTED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(ERRORS_TOTAL.clone()));
}

/// Render the registry in Prometheus text exposition format.
pub fn render() -> String {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(error) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::error!(%error, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
