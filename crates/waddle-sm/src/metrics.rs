//! Session manager metrics for observability.
//!
//! Uses the global OpenTelemetry meter provider, which must be initialized
//! by the host application. Without one, recording is a no-op.

use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

static METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    METER.get_or_init(|| opentelemetry::global::meter("waddle-sm"))
}

// ============================================================================
// Counters (Cumulative)
// ============================================================================

/// Counter for stanzas dispatched through the pipeline.
pub fn stanzas_processed() -> Counter<u64> {
    meter()
        .u64_counter("sm.stanzas.processed")
        .with_description("Total stanzas dispatched through the session manager")
        .with_unit("stanza")
        .build()
}

/// Counter for stanzas stopped by a preprocessor.
pub fn preprocess_blocked() -> Counter<u64> {
    meter()
        .u64_counter("sm.preprocess.blocked")
        .with_description("Stanzas fully handled or rejected during preprocessing")
        .with_unit("stanza")
        .build()
}

/// Counter for stanzas no processor claimed.
pub fn stanzas_unhandled() -> Counter<u64> {
    meter()
        .u64_counter("sm.stanzas.unhandled")
        .with_description("Stanzas dropped because no processor matched")
        .with_unit("stanza")
        .build()
}

/// Counter for error stanzas produced.
pub fn error_stanzas() -> Counter<u64> {
    meter()
        .u64_counter("sm.errors.sent")
        .with_description("Error stanzas produced by the pipeline")
        .with_unit("stanza")
        .build()
}

/// Counter for requests rejected by a rate limiter.
pub fn rate_limited() -> Counter<u64> {
    meter()
        .u64_counter("sm.rate_limited")
        .with_description("Requests rejected by a token bucket")
        .with_unit("request")
        .build()
}

/// Counter for authentication attempts.
pub fn auth_attempts() -> Counter<u64> {
    meter()
        .u64_counter("sm.auth.attempts")
        .with_description("Total authentication attempts")
        .with_unit("attempt")
        .build()
}

// ============================================================================
// Gauges (Current State)
// ============================================================================

/// Gauge for open client connections.
pub fn sessions_active() -> Gauge<i64> {
    meter()
        .i64_gauge("sm.sessions.active")
        .with_description("Current number of open client connections")
        .with_unit("session")
        .build()
}

// ============================================================================
// Histograms (Latency)
// ============================================================================

/// Histogram for dispatch latency.
pub fn dispatch_latency() -> Histogram<f64> {
    meter()
        .f64_histogram("sm.dispatch.latency")
        .with_description("Time spent dispatching one stanza through all phases")
        .with_unit("ms")
        .build()
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Record a dispatched stanza and how the pipeline ended for it.
pub fn record_stanza(element: &str, outcome: &str) {
    stanzas_processed().add(
        1,
        &[
            KeyValue::new("element", element.to_string()),
            KeyValue::new("outcome", outcome.to_string()),
        ],
    );
}

/// Record a stanza stopped by a preprocessor.
pub fn record_preprocess_block(processor: &str) {
    preprocess_blocked().add(1, &[KeyValue::new("processor", processor.to_string())]);
}

/// Record a stanza no processor claimed.
pub fn record_unhandled(element: &str) {
    stanzas_unhandled().add(1, &[KeyValue::new("element", element.to_string())]);
}

/// Record an error stanza by condition.
pub fn record_error_stanza(condition: &str) {
    error_stanzas().add(1, &[KeyValue::new("condition", condition.to_string())]);
}

/// Record a rate-limited request.
pub fn record_rate_limited(limiter: &str) {
    rate_limited().add(1, &[KeyValue::new("limiter", limiter.to_string())]);
}

/// Record an authentication attempt.
pub fn record_auth_attempt(mechanism: &str, success: bool) {
    auth_attempts().add(
        1,
        &[
            KeyValue::new("mechanism", mechanism.to_string()),
            KeyValue::new("result", if success { "success" } else { "failure" }),
        ],
    );
}

/// Record the number of open connections.
pub fn record_session_count(count: i64) {
    sessions_active().record(count, &[]);
}

/// Record dispatch latency in milliseconds.
pub fn record_dispatch_latency(latency_ms: f64, element: &str) {
    dispatch_latency().record(latency_ms, &[KeyValue::new("element", element.to_string())]);
}
