//! Prometheus metrics recorder and metric names.

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Call once at startup, before any metric is recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_metrics();
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

fn describe_metrics() {
    describe_counter!(WS_CONNECTIONS_TOTAL, "WebSocket connections accepted");
    describe_gauge!(WS_CONNECTIONS_ACTIVE, "WebSocket connections currently open");
    describe_counter!(RELAY_JOINS_TOTAL, "Successful room joins");
    describe_counter!(RELAY_JOIN_REJECTIONS_TOTAL, "Rejected joins, by reason");
    describe_counter!(RELAY_FRAMES_RELAYED_TOTAL, "Relay frames queued to recipients");
    describe_counter!(RELAY_DELIVERY_FAILURES_TOTAL, "Recipients evicted after a failed enqueue");
    describe_counter!(RELAY_HEARTBEAT_TIMEOUTS_TOTAL, "Sessions dropped for inactivity");
    describe_histogram!(WS_CONNECTION_DURATION_SECONDS, "Lifetime of a WebSocket connection");
}

// Metric name constants to avoid typos across modules.

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Successful joins (counter).
pub const RELAY_JOINS_TOTAL: &str = "relay_joins_total";
/// Rejected joins (counter, labels: reason).
pub const RELAY_JOIN_REJECTIONS_TOTAL: &str = "relay_join_rejections_total";
/// Relay frames queued, counted per recipient (counter).
pub const RELAY_FRAMES_RELAYED_TOTAL: &str = "relay_frames_relayed_total";
/// Failed enqueues (counter).
pub const RELAY_DELIVERY_FAILURES_TOTAL: &str = "relay_delivery_failures_total";
/// Liveness timeouts (counter).
pub const RELAY_HEARTBEAT_TIMEOUTS_TOTAL: &str = "relay_heartbeat_timeouts_total";
/// Connection lifetime in seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
