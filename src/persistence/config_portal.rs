//! Thread-safe access to the persisted connection settings.
//!
//! The portal wraps the settings in `Arc<RwLock<..>>` so the UI-facing
//! side can read concurrently while updates stay atomic, and it owns the
//! TOML file the settings live in. Updates are validated, applied in
//! memory and written back in one operation.

use std::path::PathBuf;
use std::sync::Arc;

use color_eyre::eyre::{eyre, Result};
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::ConnectionSettings;

const CONFIG_DIR: &str = ".config/pumpwatch";
const CONNECTION_CONFIG_FILE: &str = "connection_config.toml";

pub struct ConfigPortal {
    settings: Arc<RwLock<ConnectionSettings>>,
    config_path: PathBuf,
}

impl ConfigPortal {
    /// Loads the settings from the default location under the home
    /// directory, creating the file with defaults on first run.
    pub async fn load() -> Result<Self> {
        Self::load_from(default_config_path()).await
    }

    /// Loads from an explicit path. A missing file is populated with
    /// defaults (keeping the freshly generated device id stable from then
    /// on); a corrupt file degrades to defaults with a warning instead of
    /// failing startup.
    pub async fn load_from(config_path: PathBuf) -> Result<Self> {
        let exists = tokio::fs::try_exists(&config_path)
            .await
            .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?;

        let settings = if exists {
            let content = tokio::fs::read_to_string(&config_path)
                .await
                .map_err(|e| eyre!("Failed to read config file: {}", e))?;
            match toml::from_str(&content) {
                Ok(settings) => settings,
                Err(e) => {
                    warn!("Corrupt connection config, falling back to defaults: {}", e);
                    ConnectionSettings::default()
                }
            }
        } else {
            info!("No connection config found, creating defaults");
            ConnectionSettings::default()
        };

        let portal = Self {
            settings: Arc::new(RwLock::new(settings.clone())),
            config_path,
        };
        if !exists {
            portal.save(&settings).await?;
        }
        Ok(portal)
    }

    pub async fn connection_settings(&self) -> ConnectionSettings {
        self.settings.read().await.clone()
    }

    /// Validates, applies and persists new settings. The running
    /// connection is not touched; the new values take effect on the next
    /// `connect()`.
    pub async fn update_connection_settings(&self, new: ConnectionSettings) -> Result<()> {
        new.validate()
            .map_err(|e| eyre!("Invalid connection settings: {}", e))?;

        {
            let mut guard = self.settings.write().await;
            *guard = new.clone();
        }
        self.save(&new).await?;
        info!(
            "Connection settings updated and saved: {}:{}",
            new.host, new.port
        );
        Ok(())
    }

    async fn save(&self, settings: &ConnectionSettings) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }

        let content = toml::to_string_pretty(settings)
            .map_err(|e| eyre!("Failed to serialize connection settings: {}", e))?;
        tokio::fs::write(&self.config_path, content)
            .await
            .map_err(|e| eyre!("Failed to write config file: {}", e))?;
        Ok(())
    }
}

fn default_config_path() -> PathBuf {
    let mut path = dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    });
    path.push(CONFIG_DIR);
    path.push(CONNECTION_CONFIG_FILE);
    path
}
