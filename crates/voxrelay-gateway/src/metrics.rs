//! Prometheus metrics recording and endpoint.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus metrics recorder and return the handle for rendering.
pub fn install_prometheus_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(handle)
}

/// Record a new WebSocket connection.
pub fn record_ws_connect() {
    metrics::gauge!("ws_connections_active").increment(1.0);
}

/// Record a WebSocket disconnection.
pub fn record_ws_disconnect() {
    metrics::gauge!("ws_connections_active").decrement(1.0);
}

pub fn record_session_open() {
    metrics::gauge!("sessions_active").increment(1.0);
}

pub fn record_session_close() {
    metrics::gauge!("sessions_active").decrement(1.0);
}

/// Record a finished pipeline run with its outcome and duration.
pub fn record_run(outcome: &str, duration_secs: f64) {
    let labels = [("outcome", outcome.to_string())];
    metrics::counter!("pipeline_runs_total", &labels).increment(1);
    metrics::histogram!("pipeline_run_duration_seconds", &labels).record(duration_secs);
}

/// Record a pending request replaced by a newer one.
pub fn record_superseded() {
    metrics::counter!("pending_superseded_total").increment(1);
}

/// Record an inbound frame rejected by the transport channel.
pub fn record_rejected_frame(kind: &str) {
    let labels = [("kind", kind.to_string())];
    metrics::counter!("frames_rejected_total", &labels).increment(1);
}

/// Record an error of a given kind.
pub fn record_error(kind: &str) {
    let labels = [("kind", kind.to_string())];
    metrics::counter!("errors_total", &labels).increment(1);
}
