//! Prometheus metrics for the relay client.
//!
//! All metrics follow the naming convention: `relay_client_<area>_<metric>_<unit>`
//!
//! ## Metric Types
//!
//! - **Counter**: Monotonically increasing value (e.g., requests_sent_total)
//! - **Gauge**: Value that can go up or down (e.g., pending_calls)
//! - **Histogram**: Distribution of values (e.g., request_duration_seconds)

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, Opts,
    Registry, TextEncoder,
};
use std::sync::{Arc, OnceLock};

use crate::TelemetryError;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // OUTBOUND REQUESTS
    // =========================================================================

    /// Total requests handed to the transport
    pub static ref REQUESTS_SENT: Counter = Counter::new(
        "relay_client_requests_sent_total",
        "Total number of requests handed to the relay transport"
    ).expect("metric creation failed");

    /// Request outcomes by kind
    pub static ref REQUEST_OUTCOMES: CounterVec = CounterVec::new(
        Opts::new("relay_client_request_outcomes_total", "Resolved requests by outcome"),
        &["outcome"]  // reply, remote_failure, timeout, closed, transport
    ).expect("metric creation failed");

    /// Request round-trip duration
    pub static ref REQUEST_DURATION: Histogram = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "relay_client_request_duration_seconds",
            "Time from send to resolution of a request"
        ).buckets(exponential_buckets(0.0001, 2.0, 16).unwrap_or_default())
    ).expect("metric creation failed");

    /// Calls currently waiting for a reply
    pub static ref PENDING_CALLS: Gauge = Gauge::new(
        "relay_client_pending_calls",
        "Outbound calls currently waiting for resolution"
    ).expect("metric creation failed");

    // =========================================================================
    // INBOUND ADMISSION
    // =========================================================================

    /// Inbound units by traffic class and admission disposition
    pub static ref INBOUND_UNITS: CounterVec = CounterVec::new(
        Opts::new("relay_client_inbound_units_total", "Inbound units by class and disposition"),
        &["class", "disposition"]  // class: broadcast/request, disposition: admitted/queued/rejected
    ).expect("metric creation failed");

    /// Handler bodies currently executing
    pub static ref ACTIVE_HANDLERS: GaugeVec = GaugeVec::new(
        Opts::new("relay_client_active_handlers", "Handler bodies currently executing"),
        &["class"]
    ).expect("metric creation failed");

    /// Handler failures (errors and panics)
    pub static ref HANDLER_FAILURES: CounterVec = CounterVec::new(
        Opts::new("relay_client_handler_failures_total", "Handler invocations that failed"),
        &["class", "kind"]  // kind: error/panic
    ).expect("metric creation failed");

    // =========================================================================
    // SESSIONS
    // =========================================================================

    /// Session lifecycle events
    pub static ref SESSION_EVENTS: CounterVec = CounterVec::new(
        Opts::new("relay_client_session_events_total", "Session lifecycle events"),
        &["event"]  // connected, closed, dropped
    ).expect("metric creation failed");
}

/// Handle to the metrics registry.
pub struct MetricsHandle {
    _registry: Arc<Registry>,
}

static REGISTERED: OnceLock<Result<(), String>> = OnceLock::new();

/// Register all metrics with the global registry.
///
/// Safe to call more than once; registration happens on the first call.
pub fn register_metrics() -> Result<MetricsHandle, TelemetryError> {
    REGISTERED
        .get_or_init(register_all)
        .clone()
        .map_err(TelemetryError::MetricsInit)?;

    Ok(MetricsHandle {
        _registry: Arc::new(REGISTRY.clone()),
    })
}

fn register_all() -> Result<(), String> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(REQUESTS_SENT.clone()),
        Box::new(REQUEST_OUTCOMES.clone()),
        Box::new(REQUEST_DURATION.clone()),
        Box::new(PENDING_CALLS.clone()),
        Box::new(INBOUND_UNITS.clone()),
        Box::new(ACTIVE_HANDLERS.clone()),
        Box::new(HANDLER_FAILURES.clone()),
        Box::new(SESSION_EVENTS.clone()),
    ];

    for metric in metrics {
        REGISTRY.register(metric).map_err(|e| e.to_string())?;
    }
    Ok(())
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}
