//! MQTT publisher module
//!
//! Mirrors controller events onto the broker so remote dashboards see the
//! same coil and sequence state as the local panel.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;
use crate::controller::ControllerEvent;
use crate::metrics;

/// Where an event goes and whether the broker keeps it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub topic: String,
    pub retain: bool,
    pub kind: &'static str,
}

/// Map an event to its topic under `prefix`
pub fn route(prefix: &str, event: &ControllerEvent) -> Route {
    match event {
        ControllerEvent::CoilStateChanged { coil, .. } => Route {
            topic: format!("{}/coils/{}/state", prefix, coil),
            retain: true,
            kind: "state",
        },
        ControllerEvent::SequenceStateChanged { .. } => Route {
            topic: format!("{}/sequence", prefix),
            retain: true,
            kind: "sequence",
        },
        ControllerEvent::Error { .. } => Route {
            topic: format!("{}/errors", prefix),
            retain: false,
            kind: "error",
        },
    }
}

/// Event as published: the event fields plus the time it was mirrored
#[derive(Debug, Serialize)]
pub struct Envelope<'a> {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: &'a ControllerEvent,
}

/// JSON payload for `event`, stamped now
pub fn payload(event: &ControllerEvent) -> Result<String> {
    let envelope = Envelope {
        timestamp: Utc::now(),
        event,
    };
    serde_json::to_string(&envelope).with_context(|| "Failed to serialize payload")
}

/// MQTT Publisher for controller events
pub struct MqttPublisher {
    client: AsyncClient,
    topic_prefix: String,
    qos: QoS,
}

impl MqttPublisher {
    /// Create a new MQTT publisher
    pub async fn new(config: &MqttConfig) -> Result<Self> {
        let mut mqttoptions = MqttOptions::new(&config.client_id, &config.host, config.port);

        mqttoptions.set_keep_alive(Duration::from_secs(30));

        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            mqttoptions.set_credentials(user, pass);
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);

        // Spawn event loop handler
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected to MQTT broker");
                    }
                    Ok(Event::Incoming(Packet::PingResp)) => {
                        debug!("MQTT ping response");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT error: {:?}", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });

        Ok(Self {
            client,
            topic_prefix: config.topic_prefix.clone(),
            qos: qos_level(config.qos),
        })
    }

    /// Publish a single controller event
    pub async fn publish(&self, event: &ControllerEvent) -> Result<()> {
        let route = route(&self.topic_prefix, event);

        let payload = payload(event)?;

        let result = self
            .client
            .publish(&route.topic, self.qos, route.retain, payload.as_bytes())
            .await
            .with_context(|| format!("Failed to publish to {}", route.topic));

        metrics::record_mqtt_publish(route.kind, result.is_ok());
        result?;

        debug!("Published to {}: {}", route.topic, payload);
        Ok(())
    }

    /// Forward events until the controller's channel closes
    pub async fn start_publishing(&self, mut rx: broadcast::Receiver<ControllerEvent>) {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Err(e) = self.publish(&event).await {
                        warn!("{:#}", e);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("MQTT publisher lagged, {} events dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

fn qos_level(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => {
            warn!("Invalid QoS level {}, using 1", qos);
            QoS::AtLeastOnce
        }
    }
}
