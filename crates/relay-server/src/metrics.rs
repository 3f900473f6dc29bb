//! Metrics collection and export for Relay.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use relay_core::{BrokerMessage, DispatchError, DispatchReport};
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "relay_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "relay_connections_active";
    pub const EVENTS_TOTAL: &str = "relay_events_total";
    pub const DELIVERIES_TOTAL: &str = "relay_deliveries_total";
    pub const PUBLISH_FAILURES_TOTAL: &str = "relay_publish_failures_total";
    pub const MALFORMED_TOTAL: &str = "relay_malformed_total";
    pub const CHATS_ACTIVE: &str = "relay_chats_active";
    pub const LATENCY_SECONDS: &str = "relay_latency_seconds";
    pub const DISPATCH_LATENCY_SECONDS: &str = "relay_dispatch_latency_seconds";
    pub const ERRORS_TOTAL: &str = "relay_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(names::CONNECTIONS_ACTIVE, "Current number of active connections");
    metrics::describe_counter!(names::EVENTS_TOTAL, "Inbound client events by name");
    metrics::describe_counter!(
        names::DELIVERIES_TOTAL,
        "Events emitted to local connections by kind"
    );
    metrics::describe_counter!(
        names::PUBLISH_FAILURES_TOTAL,
        "Broker publishes that failed or timed out"
    );
    metrics::describe_counter!(
        names::MALFORMED_TOTAL,
        "Malformed client frames and broker payloads"
    );
    metrics::describe_gauge!(names::CHATS_ACTIVE, "Chats with at least one local member");
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound event handling latency in seconds"
    );
    metrics::describe_histogram!(
        names::DISPATCH_LATENCY_SECONDS,
        "Time from broker receipt to the last local emit in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

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

/// Record an inbound client event.
pub fn record_event(event: &'static str) {
    counter!(names::EVENTS_TOTAL, "event" => event).increment(1);
}

/// Record the outcome of dispatching one broker message.
pub fn record_dispatch(message: &BrokerMessage, outcome: &Result<DispatchReport, DispatchError>) {
    match outcome {
        Ok(report) => {
            histogram!(names::DISPATCH_LATENCY_SECONDS)
                .record(message.received_at.elapsed().as_secs_f64());
            record_deliveries("message", report.messages);
            record_deliveries("notification", report.notifications);
            record_deliveries("typing", report.typing);
            record_deliveries("skipped", report.skipped);
        }
        Err(DispatchError::Malformed { .. }) => {
            counter!(names::MALFORMED_TOTAL, "source" => "broker").increment(1);
        }
        Err(_) => record_error("dispatch"),
    }
}

fn record_deliveries(kind: &'static str, count: usize) {
    counter!(names::DELIVERIES_TOTAL, "kind" => kind).increment(count as u64);
}

/// Record a malformed client frame.
pub fn record_malformed() {
    counter!(names::MALFORMED_TOTAL, "source" => "client").increment(1);
}

/// Record a failed broker publish.
pub fn record_publish_failure() {
    counter!(names::PUBLISH_FAILURES_TOTAL).increment(1);
}

/// Record event handling latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Update the active chat count.
pub fn set_active_chats(count: usize) {
    gauge!(names::CHATS_ACTIVE).set(count as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
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
