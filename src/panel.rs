//! Main panel orchestration

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::api::{self, ApiState, ControlDefaults};
use crate::config::Config;
use crate::controller::{ControllerEvent, PulseController};
use crate::link;
use crate::metrics;
use crate::mqtt::MqttPublisher;

/// Wires the coil link, controller, HTTP surface and MQTT mirror together
pub struct Panel {
    config: Config,
    controller: PulseController,
}

impl Panel {
    /// Validate the configuration, connect to the device and build the controller
    pub async fn new(config: Config) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let link = link::connect(&config.device)
            .await
            .context("Failed to connect to Modbus device")?;
        metrics::record_link_status(true);
        info!("Connected to {}", link.target());

        let controller = PulseController::new(link, &config.device.coils)?;

        Ok(Self { config, controller })
    }

    pub fn controller(&self) -> &PulseController {
        &self.controller
    }

    /// Run the panel until Ctrl+C, then revert all coils and close the link
    pub async fn run(self) -> Result<()> {
        // Initialize Prometheus metrics if enabled
        let defaults = ControlDefaults {
            pulse_duration_secs: self.config.panel.pulse_duration_secs,
            sequence: self.config.sequence.clone(),
        };
        let metrics_handle = if self.config.server.metrics_enabled {
            metrics::init_metrics()
        } else {
            None
        };
        let api_state = match metrics_handle {
            Some(handle) => {
                info!("Prometheus metrics enabled at /metrics");
                ApiState::with_metrics(self.controller.clone(), defaults, handle)
            }
            None => ApiState::new(self.controller.clone(), defaults),
        };

        // Spawn the event log before the first refresh so its events are seen
        tokio::spawn(log_events(self.controller.subscribe()));

        let report = self.controller.refresh_all().await;
        if report.is_ok() {
            info!("Initial state read for {} coils", report.states.len());
        } else {
            warn!(
                "Initial refresh failed for {} of {} coils",
                report.errors.len(),
                self.controller.coils().len()
            );
        }

        // Start MQTT publisher if enabled
        if self.config.mqtt.enabled {
            let mqtt_publisher = Arc::new(MqttPublisher::new(&self.config.mqtt).await?);
            let mqtt_rx = self.controller.subscribe();

            tokio::spawn(async move {
                mqtt_publisher.start_publishing(mqtt_rx).await;
            });

            info!(
                "MQTT publishing enabled: {}:{}/{}",
                self.config.mqtt.host, self.config.mqtt.port, self.config.mqtt.topic_prefix
            );
        } else {
            info!("MQTT publishing disabled");
        }

        // Start API server
        let app = api::create_router(api_state);

        let addr: SocketAddr = format!("{}:{}", self.config.server.host, self.config.server.port)
            .parse()
            .with_context(|| "Invalid server address")?;

        info!("Starting API server on http://{}", addr);
        info!("  - Health check: http://{}/health", addr);
        info!("  - Coils:        http://{}/api/coils", addr);
        info!("  - Sequence:     http://{}/api/sequence", addr);
        info!("  - WebSocket:    ws://{}/ws", addr);
        if self.config.server.metrics_enabled {
            info!("  - Metrics:      http://{}/metrics", addr);
        }

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await;

        // Coils must not stay energized after the panel goes away
        self.controller.shutdown().await;
        info!("Panel stopped");

        served.context("API server failed")
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

/// Log every controller event; faults stand out at error level
async fn log_events(mut rx: broadcast::Receiver<ControllerEvent>) {
    loop {
        match rx.recv().await {
            Ok(ControllerEvent::CoilStateChanged { coil, state }) => {
                info!("Coil {} is now {}", coil, if state { "ON" } else { "OFF" });
            }
            Ok(ControllerEvent::SequenceStateChanged { running }) => {
                info!(
                    "Sequence {}",
                    if running { "running" } else { "stopped" }
                );
            }
            Ok(ControllerEvent::Error {
                coil,
                kind,
                message,
            }) => {
                error!(
                    "Error [{}] on coil {:?}: {}",
                    kind.as_str(),
                    coil,
                    message
                );
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Event log lagged, {} events dropped", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
