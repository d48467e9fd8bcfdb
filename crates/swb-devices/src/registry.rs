//! The selector registry served to every connection

use swb_core::{Error, ProtocolRegistry};
use tracing::info;

use crate::config::DeviceConfig;
use crate::hardware::Hardware;
use crate::knock_knock::KnockKnockProtocol;
use crate::rf_switch::RfSwitchProtocol;
use crate::zigbee::ZigBeeProtocol;

pub const KNOCK_KNOCK: &str = "KnockKnock";
pub const RF_SWITCH: &str = "RfSwitch";
pub const ZIGBEE: &str = "ZigBee";

/// Build the registry in menu order: KnockKnock, RfSwitch, ZigBee.
/// Disabled domains are left out of the menu entirely.
pub fn default_registry(config: &DeviceConfig, hardware: &Hardware) -> ProtocolRegistry {
    let mut registry = ProtocolRegistry::new();

    registry.register(KNOCK_KNOCK, |_| Ok(Box::new(KnockKnockProtocol::new())));

    if config.rf.enabled {
        let switches = config.rf.switches.clone();
        let radio = hardware.radio.clone();
        registry.register(RF_SWITCH, move |context| {
            Ok(Box::new(RfSwitchProtocol::new(
                switches.clone(),
                &radio,
                context.outbox(),
            )))
        });
    }

    if config.zigbee.enabled {
        let zigbee = config.zigbee.clone();
        let dongle = hardware.dongle.clone();
        registry.register(ZIGBEE, move |context| {
            if !zigbee.channel_is_valid() {
                return Err(Error::ProtocolUnavailable(format!(
                    "ZigBee channel {} is outside 11-26",
                    zigbee.channel
                )));
            }
            Ok(Box::new(ZigBeeProtocol::new(
                zigbee.channel,
                &zigbee.devices,
                &dongle,
                context.outbox(),
            )))
        });
    }

    info!(protocols = ?registry, "Protocol registry ready");
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SwitchConfig;
    use swb_core::{Payload, Protocol, ProtocolContext, Router};
    use std::sync::Arc;

    #[test]
    fn test_menu_order() {
        let registry = default_registry(&DeviceConfig::default(), &Hardware::unavailable());
        assert_eq!(registry.menu(), ["KnockKnock", "RfSwitch", "ZigBee", "Reset"]);
    }

    #[test]
    fn test_disabled_domains_are_hidden() {
        let mut config = DeviceConfig::default();
        config.rf.enabled = false;
        config.zigbee.enabled = false;
        let registry = default_registry(&config, &Hardware::unavailable());
        assert_eq!(registry.menu(), ["KnockKnock", "Reset"]);
    }

    #[test]
    fn test_bad_channel_fails_construction() {
        let mut config = DeviceConfig::default();
        config.zigbee.channel = 4;
        let registry = Arc::new(default_registry(&config, &Hardware::unavailable()));
        let (context, _rx) = ProtocolContext::channel("test");
        let mut router = Router::new(registry, context);

        let response = router.process(Payload::request(ZIGBEE));
        assert!(response.response().unwrap().contains("outside 11-26"));
        assert!(router.is_choosing());
    }

    #[test]
    fn test_rf_switch_seeded_from_config() {
        let mut config = DeviceConfig::default();
        config.rf.switches = vec![SwitchConfig::new("lamp", 1, 2)];
        let registry = Arc::new(default_registry(&config, &Hardware::unavailable()));
        let (context, _rx) = ProtocolContext::channel("test");
        let mut router = Router::new(registry, context);

        router.process(Payload::request(RF_SWITCH));
        let listed = router.process(Payload::request("ListSwitches"));
        assert_eq!(listed.response(), Some("lamp: unknown"));
        assert_eq!(listed.commands().last().map(String::as_str), Some("Reset"));
    }
}
