//! Metrics collection and export for Chorus.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use chorus_core::TransportStats;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "chorus_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "chorus_connections_active";
    pub const ONLINE_USERS: &str = "chorus_online_users";
    pub const ROOMS_ACTIVE: &str = "chorus_rooms_active";
    pub const FRAMES_TOTAL: &str = "chorus_frames_total";
    pub const FRAME_BYTES: &str = "chorus_frame_bytes";
    pub const EVENTS_PUSHED: &str = "chorus_events_pushed_total";
    pub const REQUEST_SECONDS: &str = "chorus_request_seconds";
    pub const STALE_PRUNED: &str = "chorus_stale_connections_pruned_total";
    pub const ERRORS_TOTAL: &str = "chorus_errors_total";
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
    metrics::describe_gauge!(names::ONLINE_USERS, "Users with at least one live connection");
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Conversation rooms with members");
    metrics::describe_counter!(names::FRAMES_TOTAL, "Protocol frames by direction");
    metrics::describe_counter!(names::FRAME_BYTES, "Protocol frame bytes by direction");
    metrics::describe_counter!(names::EVENTS_PUSHED, "Server events written to clients");
    metrics::describe_histogram!(
        names::REQUEST_SECONDS,
        "Time to handle one client request in seconds"
    );
    metrics::describe_counter!(
        names::STALE_PRUNED,
        "Connections dropped for missing heartbeats"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Errors by kind");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;

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

/// Record a frame crossing the socket.
pub fn record_frame(bytes: usize, direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction).increment(1);
    counter!(names::FRAME_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record a server event written to a client.
pub fn record_event(event: &'static str) {
    counter!(names::EVENTS_PUSHED, "event" => event).increment(1);
}

pub fn record_request(seconds: f64) {
    histogram!(names::REQUEST_SECONDS).record(seconds);
}

pub fn record_pruned(count: usize) {
    counter!(names::STALE_PRUNED).increment(count as u64);
}

/// Publish transport gauges.
pub fn record_transport(stats: &TransportStats) {
    gauge!(names::ONLINE_USERS).set(stats.online_users as f64);
    gauge!(names::ROOMS_ACTIVE).set(stats.room_count as f64);
}

/// Record an error.
pub fn record_error(kind: &'static str) {
    counter!(names::ERRORS_TOTAL, "kind" => kind).increment(1);
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

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
