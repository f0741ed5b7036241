//! Prometheus metrics for CoilPulse
//!
//! Exposes metrics at /metrics endpoint in Prometheus format:
//! - Coil write counts
//! - Pulse outcomes and hold durations
//! - Faults (coils left energized)
//! - Sequence state and step counts
//! - Link and WebSocket status

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::time::Instant;
use tracing::{info, warn};

/// Initialize Prometheus metrics exporter
///
/// Returns `None` if a recorder is already installed for this process.
pub fn init_metrics() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            info!("Prometheus metrics initialized");
            Some(handle)
        }
        Err(e) => {
            warn!("Failed to install Prometheus recorder: {}", e);
            None
        }
    }
}

/// Timing for one pulse, from request to revert
pub struct PulseMetrics {
    start: Instant,
    coil: String,
}

impl PulseMetrics {
    pub fn start(coil: usize) -> Self {
        Self {
            start: Instant::now(),
            coil: coil.to_string(),
        }
    }

    /// Record how the pulse ended ("completed", "cancelled", "aborted", "failed")
    pub fn finish(self, outcome: &'static str) {
        let duration = self.start.elapsed().as_secs_f64();

        counter!(
            "coilpulse_pulses_total",
            "coil" => self.coil.clone(),
            "outcome" => outcome
        )
        .increment(1);

        histogram!(
            "coilpulse_pulse_duration_seconds",
            "coil" => self.coil
        )
        .record(duration);
    }
}

/// Record a single coil write
pub fn record_coil_write(coil: usize, success: bool) {
    counter!(
        "coilpulse_coil_writes_total",
        "coil" => coil.to_string(),
        "status" => if success { "success" } else { "error" }
    )
    .increment(1);
}

/// Record a pulse request refused because the coil was busy
pub fn record_busy_rejection(coil: usize) {
    counter!(
        "coilpulse_busy_rejections_total",
        "coil" => coil.to_string()
    )
    .increment(1);
}

/// Record a coil left energized after a failed revert
pub fn record_fault(coil: usize) {
    counter!(
        "coilpulse_faults_total",
        "coil" => coil.to_string()
    )
    .increment(1);
}

pub fn record_sequence_running(running: bool) {
    gauge!("coilpulse_sequence_running").set(if running { 1.0 } else { 0.0 });
}

pub fn record_sequence_step(coil: usize) {
    counter!(
        "coilpulse_sequence_steps_total",
        "coil" => coil.to_string()
    )
    .increment(1);
}

pub fn record_link_status(connected: bool) {
    gauge!("coilpulse_link_connected").set(if connected { 1.0 } else { 0.0 });
}

/// Record MQTT publish event
pub fn record_mqtt_publish(topic_kind: &'static str, success: bool) {
    counter!(
        "coilpulse_mqtt_publishes_total",
        "kind" => topic_kind,
        "status" => if success { "success" } else { "error" }
    )
    .increment(1);
}

/// Record WebSocket connections
pub fn record_websocket_connections(count: usize) {
    gauge!("coilpulse_websocket_connections").set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pulse_metrics() {
        let _ = PrometheusBuilder::new().install_recorder();

        PulseMetrics::start(1).finish("completed");
        PulseMetrics::start(2).finish("cancelled");
        // No panic = success
    }

    #[test]
    fn test_write_and_fault_counters() {
        let _ = PrometheusBuilder::new().install_recorder();

        record_coil_write(1, true);
        record_coil_write(1, false);
        record_busy_rejection(2);
        record_fault(3);
        // No panic = success
    }

    #[test]
    fn test_gauges() {
        let _ = PrometheusBuilder::new().install_recorder();

        record_sequence_running(true);
        record_sequence_step(4);
        record_sequence_running(false);
        record_link_status(true);
        record_mqtt_publish("state", true);
        record_websocket_connections(3);
        // No panic = success
    }
}
