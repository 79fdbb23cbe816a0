//! Persistent gateway configuration.
//!
//! Reads and writes a plain JSON file so the daemon remembers its serial
//! port, polling setup and preferred heart rate monitor between restarts.

use log::{info, warn};
use serde::{Deserialize, Serialize};

/// Gateway settings. Every field has a default so a partial (or absent)
/// file still yields a working configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Serial port path. `None` means autodetect by USB descriptor.
    #[serde(default)]
    pub serial_port: Option<String>,
    /// Register polling interval in milliseconds; 0 disables polling.
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
    /// Registers requested on every polling tick.
    #[serde(default = "default_poll_registers")]
    pub poll_registers: Vec<String>,
    /// Directory for recordings and exported activity files.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Saved heart rate monitor address to reconnect to on startup.
    #[serde(default)]
    pub hrm_address: Option<String>,
    /// BLE advertising name of the FTMS peripheral.
    #[serde(default = "default_ble_name")]
    pub ble_name: String,
}

fn default_refresh_interval_ms() -> u64 {
    1000
}

fn default_poll_registers() -> Vec<String> {
    [
        "stroke_rate",
        "kcal_watts",
        "strokes_cnt",
        "m_s_total",
        "total_kcal",
        "m_s_average",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_ble_name() -> String {
    "WaterRower".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            serial_port: None,
            refresh_interval_ms: default_refresh_interval_ms(),
            poll_registers: default_poll_registers(),
            data_dir: default_data_dir(),
            hrm_address: None,
            ble_name: default_ble_name(),
        }
    }
}

/// Load config from disk. Returns None if file missing or invalid.
pub fn load(path: &str) -> Option<GatewayConfig> {
    let data = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str::<GatewayConfig>(&data) {
        Ok(cfg) => {
            info!("Loaded config from {}", path);
            Some(cfg)
        }
        Err(e) => {
            warn!("Failed to parse config {}: {}", path, e);
            None
        }
    }
}

/// Save config to disk. Logs on failure but does not return error.
pub fn save(path: &str, config: &GatewayConfig) {
    match serde_json::to_string_pretty(config) {
        Ok(json) => {
            if let Err(e) = std::fs::write(path, json) {
                warn!("Failed to write config {}: {}", path, e);
            } else {
                info!("Saved config to {}", path);
            }
        }
        Err(e) => {
            warn!("Failed to serialize config: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.serial_port, None);
        assert_eq!(cfg.refresh_interval_ms, 1000);
        assert_eq!(cfg.ble_name, "WaterRower");
        assert_eq!(cfg.poll_registers.len(), 6);
        assert!(cfg.poll_registers.contains(&"stroke_rate".to_string()));
    }

    #[test]
    fn roundtrip() {
        let dir = std::env::temp_dir().join("waterrower_config_test");
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join("config.json");
        let path_str = path.to_str().unwrap();

        let mut cfg = GatewayConfig::default();
        cfg.serial_port = Some("/dev/ttyACM0".to_string());
        cfg.hrm_address = Some("AA:BB:CC:DD:EE:FF".to_string());
        save(path_str, &cfg);

        let loaded = load(path_str).expect("should load saved config");
        assert_eq!(loaded.serial_port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(loaded.hrm_address.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
        assert_eq!(loaded.refresh_interval_ms, 1000);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let path = std::env::temp_dir().join("waterrower_partial_config.json");
        std::fs::write(&path, r#"{"refresh_interval_ms": 200}"#).unwrap();
        let cfg = load(path.to_str().unwrap()).expect("partial config should load");
        assert_eq!(cfg.refresh_interval_ms, 200);
        assert_eq!(cfg.ble_name, "WaterRower");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn load_missing() {
        assert!(load("/tmp/waterrower_nonexistent_config.json").is_none());
    }

    #[test]
    fn load_invalid() {
        let path = std::env::temp_dir().join("waterrower_invalid_config.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(load(path.to_str().unwrap()).is_none());
        let _ = std::fs::remove_file(&path);
    }
}
