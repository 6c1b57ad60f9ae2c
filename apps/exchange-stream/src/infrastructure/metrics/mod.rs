//! Prometheus Metrics Module
//!
//! Instruments the streaming engine through the `metrics` facade. Without an
//! installed recorder every call is a no-op, so library users only pay for
//! metrics when the binary installs the Prometheus exporter.
//!
//! # Metrics Categories
//!
//! - **Frames**: Inbound frames received, malformed frames dropped
//! - **Delivery**: Items published to and dropped by output queues
//! - **Connections**: Open connections, reconnect attempts, logins
//! - **Subscriptions**: Active upstream subscriptions, resubscribes

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::domain::streaming::StreamKind;

static INSTALLED: OnceLock<SocketAddr> = OnceLock::new();

/// Errors installing the exporter.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// The exporter could not be built or bound.
    #[error("failed to install Prometheus exporter: {0}")]
    Build(#[from] BuildError),

    /// An exporter is already installed on another address.
    #[error("Prometheus exporter already installed on {0}")]
    AlreadyInstalled(SocketAddr),
}

// =============================================================================
// Exporter
// =============================================================================

/// Install the Prometheus exporter with an HTTP listener on `port`.
///
/// Must be called from within a Tokio runtime. Calling it again with the
/// same port is a no-op.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound or a different exporter
/// is already installed.
pub fn install_exporter(port: u16) -> Result<(), MetricsError> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    if let Some(existing) = INSTALLED.get() {
        if *existing == addr {
            return Ok(());
        }
        return Err(MetricsError::AlreadyInstalled(*existing));
    }

    PrometheusBuilder::new().with_http_listener(addr).install()?;
    let _ = INSTALLED.set(addr);
    register_metrics();
    tracing::info!(%addr, "Prometheus exporter listening");
    Ok(())
}

fn register_metrics() {
    describe_counter!(
        "exchange_stream_frames_received_total",
        "Total inbound frames received from exchange connections"
    );
    describe_counter!(
        "exchange_stream_frames_malformed_total",
        "Total inbound frames dropped because they could not be decoded"
    );
    describe_counter!(
        "exchange_stream_items_published_total",
        "Total items pushed onto output queues"
    );
    describe_counter!(
        "exchange_stream_items_dropped_total",
        "Total items dropped by an output queue's overflow policy"
    );
    describe_gauge!(
        "exchange_stream_connections",
        "Number of open exchange connections"
    );
    describe_gauge!(
        "exchange_stream_subscriptions",
        "Number of active upstream subscriptions"
    );
    describe_counter!(
        "exchange_stream_reconnects_total",
        "Total reconnection attempts"
    );
    describe_counter!(
        "exchange_stream_logins_total",
        "Total private-channel logins by outcome"
    );
    describe_counter!(
        "exchange_stream_resubscribes_total",
        "Total resubscribed keys by reason"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record an inbound frame.
pub fn record_frame_received(exchange: &'static str) {
    counter!("exchange_stream_frames_received_total", "exchange" => exchange).increment(1);
}

/// Record a frame dropped as malformed.
pub fn record_frame_malformed(exchange: &'static str) {
    counter!("exchange_stream_frames_malformed_total", "exchange" => exchange).increment(1);
}

/// Record items pushed to an output queue.
pub fn record_published(kind: StreamKind, count: u64) {
    counter!("exchange_stream_items_published_total", "stream" => kind.as_str()).increment(count);
}

/// Record items dropped by an output queue.
pub fn record_dropped(kind: StreamKind, count: u64) {
    counter!("exchange_stream_items_dropped_total", "stream" => kind.as_str()).increment(count);
}

/// Update the open connection count.
#[allow(clippy::cast_precision_loss)]
pub fn set_connections(exchange: &'static str, count: usize) {
    gauge!("exchange_stream_connections", "exchange" => exchange).set(count as f64);
}

/// Update the active subscription count.
#[allow(clippy::cast_precision_loss)]
pub fn set_subscriptions(exchange: &'static str, count: usize) {
    gauge!("exchange_stream_subscriptions", "exchange" => exchange).set(count as f64);
}

/// Record a reconnection attempt.
pub fn record_reconnect(exchange: &'static str) {
    counter!("exchange_stream_reconnects_total", "exchange" => exchange).increment(1);
}

/// Record a login outcome (`ok`, `rejected`, `timeout`, ...).
pub fn record_login(exchange: &'static str, outcome: &'static str) {
    counter!(
        "exchange_stream_logins_total",
        "exchange" => exchange,
        "outcome" => outcome
    )
    .increment(1);
}

/// Record resubscribed keys (`reconnect` or `stale`).
pub fn record_resubscribe(exchange: &'static str, reason: &'static str, count: u64) {
    counter!(
        "exchange_stream_resubscribes_total",
        "exchange" => exchange,
        "reason" => reason
    )
    .increment(count);
}

// =============================================================================
// Tests
// =============================================================================
