//! Pump Monitor Handle - unified API over the connection worker
//!
//! The externally observable object: spawns the MQTT worker and the
//! telemetry aggregator, and exposes connect/disconnect/publish plus the
//! read-only snapshot stream. The aggregator task is the single writer of
//! the telemetry state; the presentation layer only ever holds a watch
//! receiver and can never mutate anything.

use std::sync::Arc;

use color_eyre::eyre::{eyre, Result};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::mqtt::mqtt_handler::CONFIG_TOPIC;
use crate::mqtt::{MqttError, MqttEvent, MqttHandle};
use crate::persistence::{ConfigPortal, ConnectionSettings};
use crate::telemetry::{MessageManager, TelemetrySnapshot};

/// Handle to a running pump monitor engine.
pub struct PumpMonitorHandle {
    mqtt: MqttHandle,
    portal: Arc<ConfigPortal>,
    snapshot_rx: watch::Receiver<TelemetrySnapshot>,
}

impl PumpMonitorHandle {
    /// Spawns the connection worker and the telemetry aggregator using the
    /// settings currently held by the portal.
    pub async fn spawn(portal: Arc<ConfigPortal>) -> Self {
        let settings = portal.connection_settings().await;
        info!(
            "starting pump monitor for {}:{} as {}",
            settings.host,
            settings.port,
            settings.client_id()
        );

        let (event_tx, event_rx) = mpsc::channel(100);
        let (snapshot_tx, snapshot_rx) = watch::channel(TelemetrySnapshot::default());
        let mqtt = MqttHandle::spawn(settings, event_tx);
        tokio::spawn(run_aggregator(event_rx, snapshot_tx));

        Self {
            mqtt,
            portal,
            snapshot_rx,
        }
    }

    pub async fn connect(&self) -> Result<(), MqttError> {
        self.mqtt.connect().await
    }

    /// Safe from any state; cancels a pending reconnect and tears the
    /// transport down.
    pub async fn disconnect(&self) -> Result<(), MqttError> {
        self.mqtt.disconnect().await
    }

    /// Publishes an application message. Only valid while connected; in
    /// any other state this is a no-op reported as
    /// [`MqttError::NotConnected`].
    pub async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) -> Result<(), MqttError> {
        self.mqtt.publish(topic, payload, retain).await
    }

    /// Pushes a new PWM pulse length to the device configuration topic as
    /// a retained message, so the device picks it up even after a reboot.
    pub async fn publish_pwm_length(&self, length_us: u32) -> Result<(), MqttError> {
        let payload = serde_json::json!({ "PWM_length": length_us }).to_string();
        self.mqtt
            .publish(CONFIG_TOPIC, payload.as_bytes(), true)
            .await
    }

    /// Persists new connection settings and hands them to the worker.
    /// They take effect on the next `connect()`.
    pub async fn update_settings(&self, settings: ConnectionSettings) -> Result<()> {
        self.portal
            .update_connection_settings(settings.clone())
            .await?;
        self.mqtt
            .update_settings(settings)
            .await
            .map_err(|e| eyre!("Failed to hand settings to the worker: {}", e))
    }

    /// Read-only stream of telemetry snapshots for the presentation layer.
    pub fn subscribe(&self) -> watch::Receiver<TelemetrySnapshot> {
        self.snapshot_rx.clone()
    }

    /// Current snapshot, cloned out of the watch channel.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.snapshot_rx.borrow().clone()
    }
}

/// Folds worker events into the telemetry state in arrival order and
/// publishes a fresh snapshot after every event.
async fn run_aggregator(
    mut event_rx: mpsc::Receiver<MqttEvent>,
    snapshot_tx: watch::Sender<TelemetrySnapshot>,
) {
    let mut manager = MessageManager::new();
    while let Some(event) = event_rx.recv().await {
        manager.apply(event);
        if snapshot_tx.send(manager.snapshot()).is_err() {
            break;
        }
    }
    debug!("telemetry aggregator stopped");
}
