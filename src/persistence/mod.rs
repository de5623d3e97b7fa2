//! # Persistence Module
//!
//! ## Why This Module Exists
//! The connection settings (broker address, credentials, client identity)
//! outlive any single run: they are edited rarely, read on every startup,
//! and must survive restarts so the monitor reconnects to the same broker
//! with the same stable client id. This module owns that configuration:
//! the strongly-typed settings struct, its TOML file on disk, and the
//! thread-safe portal the rest of the application reads through.
//!
//! ## Error Handling Strategy
//! Uses `color_eyre` for rich error context in file operations. A missing
//! or corrupt configuration file degrades to defaults (with a warning)
//! rather than preventing startup; the defaults are written back so the
//! generated device id stays stable from then on.

pub mod config_portal;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use config_portal::ConfigPortal;

/// Validation failures for operator-supplied settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("broker host must not be empty")]
    EmptyHost,

    #[error("broker port must be between 1 and 65535")]
    InvalidPort,
}

/// Broker connection settings, immutable per connection attempt.
///
/// Mutated only through an explicit settings update, which is persisted
/// immediately and takes effect on the next `connect()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Broker hostname or IP address
    pub host: String,
    /// Broker TCP port (plain MQTT, usually 1883)
    pub port: u16,
    /// Prefix for the MQTT client identifier
    pub client_id_prefix: String,
    /// Broker username; empty disables the username flag entirely
    pub username: String,
    /// Broker password; may be empty
    pub password: String,
    /// Stable identifier generated on first run; its leading hex chars
    /// make the client id unique per installation
    pub device_id: String,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            host: "192.168.1.34".to_string(),
            port: 1883,
            client_id_prefix: "WaterPump-".to_string(),
            username: "etokoji".to_string(),
            password: String::new(),
            device_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl ConnectionSettings {
    /// Client identifier sent in CONNECT: the prefix plus the first 8 hex
    /// characters of the device id.
    pub fn client_id(&self) -> String {
        let short_id: String = self.device_id.chars().take(8).collect();
        format!("{}{}", self.client_id_prefix, short_id)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.host.trim().is_empty() {
            return Err(SettingsError::EmptyHost);
        }
        if self.port == 0 {
            return Err(SettingsError::InvalidPort);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_combines_prefix_and_short_device_id() {
        let settings = ConnectionSettings {
            device_id: "1a2b3c4d-9999-0000-1111-222222222222".to_string(),
            ..ConnectionSettings::default()
        };
        assert_eq!(settings.client_id(), "WaterPump-1a2b3c4d");
    }

    #[test]
    fn validation_rejects_bad_endpoints() {
        let mut settings = ConnectionSettings::default();
        assert!(settings.validate().is_ok());

        settings.host = "  ".to_string();
        assert!(matches!(settings.validate(), Err(SettingsError::EmptyHost)));

        settings.host = "broker.local".to_string();
        settings.port = 0;
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::InvalidPort)
        ));
    }

    #[test]
    fn defaults_generate_a_device_id() {
        let a = ConnectionSettings::default();
        let b = ConnectionSettings::default();
        assert!(!a.device_id.is_empty());
        assert_ne!(a.device_id, b.device_id, "fresh id per generation");
    }
}
