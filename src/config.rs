// Gateway configuration
// Loaded from a JSON file on the removable volume; every field falls back to its default

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use log::info;
use serde::{Deserialize, Serialize};

/// Where the removable FAT volume is mounted at boot
pub const SD_MOUNT_POINT: &str = "/sdcard";

/// Runtime configuration of the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub log_dir: String,               // Relay log directory, on the removable volume
    pub relay_file: String,            // Durable relay log file name
    pub topic_prefix: String,          // Telemetry topics are "<prefix>/<addr:04x>"
    pub device_name: String,           // Mesh device name
    pub mqtt_client_id: Option<String>, // Broker client id, driver default when unset
    pub mqtt_keep_alive_secs: u64,     // MQTT keep-alive interval
    pub status_interval_secs: u64,     // Period of the health/status log line
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            log_dir: SD_MOUNT_POINT.to_string(),
            relay_file: "mqttfile.txt".to_string(),
            topic_prefix: "mesh".to_string(),
            device_name: "ESP-NODE-GATEWAY".to_string(),
            mqtt_client_id: None,
            mqtt_keep_alive_secs: 60,
            status_interval_secs: 60,
        }
    }
}

impl GatewayConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).context("Failed to parse gateway configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Missing file yields defaults; an unreadable or malformed file is an error
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("📋 No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config = Self::from_json(&json)?;
        info!("📋 Loaded gateway config from {}", path.display());
        Ok(config)
    }

    /// Check values are usable before anything is started
    pub fn validate(&self) -> Result<()> {
        if !Path::new(&self.log_dir).starts_with(SD_MOUNT_POINT) {
            return Err(anyhow!("log_dir must be on the volume mounted at {}", SD_MOUNT_POINT));
        }

        if self.relay_file.is_empty() || self.relay_file.contains('/') {
            return Err(anyhow!("relay_file must be a plain file name"));
        }

        if self.topic_prefix.is_empty() || self.topic_prefix.contains('|') {
            return Err(anyhow!("topic_prefix must be non-empty and must not contain '|'"));
        }

        if self.device_name.is_empty() {
            return Err(anyhow!("device_name must not be empty"));
        }

        if self.mqtt_keep_alive_secs == 0 {
            return Err(anyhow!("mqtt_keep_alive_secs must be greater than zero"));
        }

        if self.status_interval_secs == 0 {
            return Err(anyhow!("status_interval_secs must be greater than zero"));
        }

        Ok(())
    }

    pub fn relay_log_path(&self) -> PathBuf {
        Path::new(&self.log_dir).join(&self.relay_file)
    }
}
