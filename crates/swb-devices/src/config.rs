//! Device configuration

use serde::{Deserialize, Serialize};

/// Configuration for every control domain
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub rf: RfConfig,
    pub zigbee: ZigbeeConfig,
}

/// RF switch domain
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RfConfig {
    pub enabled: bool,
    /// Switch table every new RfSwitch protocol instance starts with
    pub switches: Vec<SwitchConfig>,
}

impl Default for RfConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            switches: Vec::new(),
        }
    }
}

/// One on/off switch and its radio codes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchConfig {
    pub name: String,
    pub on_code: u32,
    pub off_code: u32,
}

impl SwitchConfig {
    pub fn new(name: impl Into<String>, on_code: u32, off_code: u32) -> Self {
        Self {
            name: name.into(),
            on_code,
            off_code,
        }
    }
}

/// ZigBee domain
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ZigbeeConfig {
    pub enabled: bool,
    /// IEEE 802.15.4 channel, 11-26
    pub channel: u8,
    /// Devices already joined to the simulated network
    pub devices: Vec<ZigbeeDeviceConfig>,
}

impl Default for ZigbeeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            channel: 15,
            devices: Vec::new(),
        }
    }
}

impl ZigbeeConfig {
    pub fn channel_is_valid(&self) -> bool {
        (11..=26).contains(&self.channel)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZigbeeDeviceConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub dimmable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_enable_everything() {
        let config = DeviceConfig::default();
        assert!(config.rf.enabled);
        assert!(config.zigbee.enabled);
        assert!(config.zigbee.channel_is_valid());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: DeviceConfig =
            serde_json::from_str(r#"{"rf": {"switches": [{"name": "lamp", "on_code": 1, "off_code": 2}]}}"#)
                .unwrap();
        assert!(config.rf.enabled);
        assert_eq!(config.rf.switches, vec![SwitchConfig::new("lamp", 1, 2)]);
        assert_eq!(config.zigbee.channel, 15);
    }
}
