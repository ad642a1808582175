/// Metrics and telemetry for Aurora ID
///
/// Provides Prometheus-compatible metrics for monitoring:
/// - HTTP request counts and latencies
/// - Scheduled event deliveries
/// - Session lifecycle and login outcomes
/// - Issued OAuth tokens

use crate::error::{IdpError, IdpResult};
use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec, IntCounterVec,
    TextEncoder,
};

lazy_static! {
    // ========== HTTP Metrics ==========

    /// Total HTTP requests by method, path, and status
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .unwrap();

    /// HTTP request duration in seconds
    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "http_request_duration_seconds",
        "HTTP request latencies in seconds",
        &["method", "path"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap();

    // ========== Scheduler Metrics ==========

    /// Scheduled events by kind and delivery outcome
    pub static ref SCHEDULED_EVENTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "scheduled_events_total",
        "Total number of scheduled event deliveries",
        &["kind", "outcome"]
    )
    .unwrap();

    // ========== Identity Metrics ==========

    /// Session lifecycle transitions
    pub static ref SESSIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "sessions_total",
        "Session lifecycle events",
        &["event"]
    )
    .unwrap();

    /// Login attempts by outcome
    pub static ref LOGINS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "logins_total",
        "Login attempts by outcome",
        &["outcome"]
    )
    .unwrap();

    // ========== OAuth Metrics ==========

    /// Tokens issued by type
    pub static ref TOKENS_ISSUED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "oauth_tokens_issued_total",
        "OAuth credentials issued",
        &["token_type"]
    )
    .unwrap();
}

/// Render all metrics in Prometheus text format
pub fn render_metrics() -> IdpResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| IdpError::Internal(format!("Failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer).map_err(|e| IdpError::Internal(e.to_string()))
}

/// Record an HTTP request
pub fn record_http_request(method: &str, path: &str, status: u16, duration: f64) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status.to_string()])
        .inc();
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, path])
        .observe(duration);
}

/// Record a scheduled event delivery
pub fn record_scheduled_event(kind: &str, outcome: &str) {
    SCHEDULED_EVENTS_TOTAL
        .with_label_values(&[kind, outcome])
        .inc();
}

/// Record a session lifecycle event (created, renewed, deleted)
pub fn record_session(event: &str) {
    SESSIONS_TOTAL.with_label_values(&[event]).inc();
}

/// Record a login outcome
pub fn record_login(outcome: &str) {
    LOGINS_TOTAL.with_label_values(&[outcome]).inc();
}

/// Record an issued token (authorization_code, access_token, refresh_token)
pub fn record_token_issued(token_type: &str) {
    TOKENS_ISSUED_TOTAL.with_label_values(&[token_type]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_render() {
        record_scheduled_event("delete_session", "delivered");
        record_login("success");
        record_token_issued("access_token");

        let text = render_metrics().unwrap();
        assert!(text.contains("scheduled_events_total"));
        assert!(text.contains("logins_total"));
        assert!(text.contains("oauth_tokens_issued_total"));
    }
}
