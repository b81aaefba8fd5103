//! Metrics collection and export for Huddle.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use huddle_core::SystemStats;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "huddle_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "huddle_connections_active";
    pub const CONNECTIONS_REJECTED: &str = "huddle_connections_rejected_total";
    pub const FRAMES_TOTAL: &str = "huddle_frames_total";
    pub const FRAMES_BYTES: &str = "huddle_frames_bytes";
    pub const ENGINE_ERRORS_TOTAL: &str = "huddle_engine_errors_total";
    pub const ERRORS_TOTAL: &str = "huddle_errors_total";
    pub const ROOMS_ACTIVE: &str = "huddle_rooms_active";
    pub const SESSIONS_ACTIVE: &str = "huddle_sessions_active";
    pub const SESSIONS_PRUNED: &str = "huddle_sessions_pruned_total";
    pub const LATENCY_SECONDS: &str = "huddle_frame_latency_seconds";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(
        names::CONNECTIONS_REJECTED,
        "Upgrades refused because the connection limit was reached"
    );
    metrics::describe_counter!(names::FRAMES_TOTAL, "Total number of frames by type and direction");
    metrics::describe_counter!(names::FRAMES_BYTES, "Total bytes of frames by direction");
    metrics::describe_counter!(
        names::ENGINE_ERRORS_TOTAL,
        "Engine operations rejected, by error kind"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of transport errors");
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Current number of rooms");
    metrics::describe_gauge!(names::SESSIONS_ACTIVE, "Current number of engine sessions");
    metrics::describe_counter!(
        names::SESSIONS_PRUNED,
        "Sessions disconnected by the heartbeat sweeper"
    );
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound frame handling latency in seconds"
    );

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record an upgrade refused at the connection limit.
pub fn record_rejected_connection() {
    counter!(names::CONNECTIONS_REJECTED).increment(1);
}

/// Record a frame.
pub fn record_frame(frame: &'static str, bytes: usize, direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "frame" => frame, "direction" => direction).increment(1);
    counter!(names::FRAMES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record frame handling latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Record an engine operation that returned an error.
pub fn record_engine_error(kind: &'static str) {
    counter!(names::ENGINE_ERRORS_TOTAL, "kind" => kind).increment(1);
}

/// Record a transport error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Record sessions removed by the heartbeat sweeper.
pub fn record_pruned(count: usize) {
    counter!(names::SESSIONS_PRUNED).increment(count as u64);
}

/// Update engine gauges.
pub fn set_engine_gauges(stats: &SystemStats) {
    gauge!(names::ROOMS_ACTIVE).set(stats.active_rooms as f64);
    gauge!(names::SESSIONS_ACTIVE).set(stats.active_sessions as f64);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
