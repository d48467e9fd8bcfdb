//! Switchboard Devices - the control domains served over a connection
//!
//! Each domain is a [`swb_core::Protocol`]. Domains that drive hardware share
//! one [`swb_core::Transport`] per device across every connection.

pub mod config;
pub mod hardware;
pub mod knock_knock;
pub mod registry;
pub mod rf_switch;
pub mod sim;
pub mod zigbee;

pub use config::{DeviceConfig, RfConfig, SwitchConfig, ZigbeeConfig, ZigbeeDeviceConfig};
pub use hardware::{DongleTransport, Hardware, RadioTransport, RfRadio, ZigbeeDevice, ZigbeeDongle, ZigbeeEvent};
pub use knock_knock::{KnockKnockProtocol, KNOCK_KNOCK_KEY};
pub use registry::{default_registry, KNOCK_KNOCK, RF_SWITCH, ZIGBEE};
pub use rf_switch::{AddSwitchArgs, RfSwitchProtocol, SwitchArgs, RF_SWITCH_KEY};
pub use sim::{SimulatedDongle, SimulatedRadio};
pub use zigbee::{DeviceArgs, JoinArgs, LevelArgs, ZigBeeProtocol, EVENT, ZIGBEE_KEY};
