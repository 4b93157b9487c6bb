//! Prometheus metrics for pools and listeners
//!
//! Recording goes through the `metrics` facade, so without an installed
//! recorder every call is a no-op.

use crate::error::{JmsError, Result};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize Prometheus metrics
///
/// Call this once at startup. Subsequent calls are no-ops.
pub fn init_metrics() -> Result<()> {
    PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| JmsError::Config(format!("failed to install Prometheus recorder: {}", e)))?;
        info!("Prometheus metrics initialized");
        Ok::<_, JmsError>(handle)
    })?;
    Ok(())
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    prometheus_handle().map(|h| h.render()).unwrap_or_default()
}

/// Outcome label of a pool request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Reused,
    Created,
    Exhausted,
    Failed,
}

impl RequestOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            RequestOutcome::Reused => "reused",
            RequestOutcome::Created => "created",
            RequestOutcome::Exhausted => "exhausted",
            RequestOutcome::Failed => "failed",
        }
    }
}

/// Pool metrics helper
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    pool: String,
}

impl PoolMetrics {
    pub fn new(pool: impl Into<String>) -> Self {
        Self { pool: pool.into() }
    }

    /// Record the outcome of a `request()`
    pub fn request(&self, outcome: RequestOutcome) {
        counter!(
            "jms_pool_requests_total",
            "pool" => self.pool.clone(),
            "outcome" => outcome.as_str()
        )
        .increment(1);

        if outcome == RequestOutcome::Exhausted {
            counter!("jms_pool_exhausted_total", "pool" => self.pool.clone()).increment(1);
        }
    }

    /// Update the idle/active gauges
    pub fn occupancy(&self, idle: usize, active: usize) {
        gauge!("jms_pool_idle", "pool" => self.pool.clone()).set(idle as f64);
        gauge!("jms_pool_active", "pool" => self.pool.clone()).set(active as f64);
    }
}

/// Listener metrics helper
#[derive(Debug, Clone)]
pub struct ListenerMetrics {
    listener: String,
    destination: String,
}

impl ListenerMetrics {
    pub fn new(listener: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            listener: listener.into(),
            destination: destination.into(),
        }
    }

    /// Record a callback that completed and whose success handlers ran
    pub fn message_succeeded(&self, duration: Duration) {
        self.message("success");
        histogram!(
            "jms_listener_callback_duration_seconds",
            "listener" => self.listener.clone(),
            "destination" => self.destination.clone()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a message routed to the error chain
    pub fn message_failed(&self, kind: &'static str) {
        self.message("failed");
        counter!(
            "jms_listener_errors_total",
            "listener" => self.listener.clone(),
            "destination" => self.destination.clone(),
            "kind" => kind
        )
        .increment(1);
    }

    /// Record a delivery the dispatch executor refused
    pub fn dispatch_rejected(&self) {
        self.message("rejected");
        counter!(
            "jms_dispatch_rejected_total",
            "listener" => self.listener.clone(),
            "destination" => self.destination.clone()
        )
        .increment(1);
    }

    fn message(&self, status: &'static str) {
        counter!(
            "jms_listener_messages_total",
            "listener" => self.listener.clone(),
            "destination" => self.destination.clone(),
            "status" => status
        )
        .increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = ListenerMetrics::new("orders-listener", "queue://orders");
        assert_eq!(metrics.listener, "orders-listener");
        assert_eq!(metrics.destination, "queue://orders");
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        let metrics = PoolMetrics::new("connections");
        metrics.request(RequestOutcome::Exhausted);
        metrics.occupancy(1, 2);
        assert_eq!(RequestOutcome::Reused.as_str(), "reused");
    }
}
