//! Persistent bridge identity.
//!
//! Reads and writes `kickr_bridge.json` so the device name, serial number,
//! and MAC survive restarts: Zwift pairs against the mDNS instance name, so
//! it has to stay stable.

use log::{info, warn};
use serde::{Deserialize, Serialize};

/// Saved device identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// BLE advertisement name.
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// Serial used in the mDNS instance name and TXT record.
    pub serial_number: String,
    /// Dash-separated MAC for the mDNS TXT record.
    pub mac_address: String,
}

fn default_device_name() -> String {
    "KICKR BIKE PRO".to_string()
}

impl BridgeConfig {
    /// mDNS service instance name.
    pub fn instance_name(&self) -> String {
        format!("{} {}", self.device_name, self.serial_number)
    }
}

/// Build an identity from a colon-separated adapter MAC.
pub fn derive(mac: &str) -> BridgeConfig {
    let dashed = mac.replace(':', "-").to_uppercase();
    let serial: String = dashed.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    BridgeConfig {
        device_name: default_device_name(),
        serial_number: serial,
        mac_address: dashed,
    }
}

/// Load config from disk. Returns None if file missing or invalid.
pub fn load(path: &str) -> Option<BridgeConfig> {
    let data = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str::<BridgeConfig>(&data) {
        Ok(cfg) => {
            info!(
                "Loaded config: name={}, serial={}",
                cfg.device_name, cfg.serial_number
            );
            Some(cfg)
        }
        Err(e) => {
            warn!("Failed to parse config {}: {}", path, e);
            None
        }
    }
}

/// Save config to disk. Logs on failure but does not return error.
pub fn save(path: &str, config: &BridgeConfig) {
    match serde_json::to_string_pretty(config) {
        Ok(json) => {
            if let Err(e) = std::fs::write(path, json) {
                warn!("Failed to write config {}: {}", path, e);
            } else {
                info!(
                    "Saved config: name={}, serial={}",
                    config.device_name, config.serial_number
                );
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
    fn test_derive_from_mac() {
        let cfg = derive("aa:bb:cc:11:22:33");
        assert_eq!(cfg.mac_address, "AA-BB-CC-11-22-33");
        assert_eq!(cfg.serial_number, "AABBCC112233");
        assert_eq!(cfg.instance_name(), "KICKR BIKE PRO AABBCC112233");
    }

    #[test]
    fn test_roundtrip() {
        let dir = std::env::temp_dir().join("kickr_bridge_config_test");
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join("test_config.json");
        let path_str = path.to_str().unwrap();

        let cfg = derive("00:11:22:33:44:55");
        save(path_str, &cfg);

        let loaded = load(path_str).expect("should load saved config");
        assert_eq!(loaded.serial_number, "001122334455");
        assert_eq!(loaded.mac_address, "00-11-22-33-44-55");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_load_missing() {
        assert!(load("/tmp/kickr_bridge_nonexistent.json").is_none());
    }

    #[test]
    fn test_load_invalid() {
        let path = "/tmp/kickr_bridge_invalid.json";
        std::fs::write(path, "not json").unwrap();
        assert!(load(path).is_none());
        let _ = std::fs::remove_file(path);
    }
}
