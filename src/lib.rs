//! pumpwatch - headless monitor engine for an MQTT-connected water pump
//! and grow-light installation.
//!
//! The engine keeps a persistent session to the device's broker with a
//! hand-rolled MQTT 3.1.1 subset, classifies the incoming telemetry into
//! pump activity logs and brightness readings with running statistics,
//! and can push retained configuration values back to the device. A
//! separate HTTP client queries the historical brightness store.
//!
//! The presentation layer is not part of this crate: it consumes the
//! read-only [`telemetry::TelemetrySnapshot`] stream exposed by
//! [`monitor::PumpMonitorHandle`].

pub mod history;
pub mod monitor;
pub mod mqtt;
pub mod persistence;
pub mod telemetry;
