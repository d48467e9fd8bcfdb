//! Hardware driver interfaces
//!
//! Drivers are only ever called from their transport's worker thread.

use serde::{Deserialize, Serialize};
use swb_core::{Result, Transport};

use crate::config::DeviceConfig;
use crate::sim::{SimulatedDongle, SimulatedRadio};

/// A 433MHz-style transmitter for fixed-code switches
pub trait RfRadio: Send + 'static {
    /// Transmit one code
    fn transmit(&mut self, code: u32) -> Result<()>;
}

/// A ZigBee coordinator dongle
pub trait ZigbeeDongle: Send + 'static {
    /// Devices currently joined to the network
    fn devices(&mut self) -> Result<Vec<ZigbeeDevice>>;

    /// Open the network for new devices
    fn permit_join(&mut self, seconds: u16) -> Result<()>;

    fn set_on_off(&mut self, device: &str, on: bool) -> Result<()>;

    fn set_level(&mut self, device: &str, level: u8) -> Result<()>;

    /// Make the device blink or beep
    fn identify(&mut self, device: &str) -> Result<()>;

    /// Events raised since the last call
    fn poll_events(&mut self) -> Vec<ZigbeeEvent>;
}

impl<R: RfRadio + ?Sized> RfRadio for Box<R> {
    fn transmit(&mut self, code: u32) -> Result<()> {
        (**self).transmit(code)
    }
}

impl<Z: ZigbeeDongle + ?Sized> ZigbeeDongle for Box<Z> {
    fn devices(&mut self) -> Result<Vec<ZigbeeDevice>> {
        (**self).devices()
    }

    fn permit_join(&mut self, seconds: u16) -> Result<()> {
        (**self).permit_join(seconds)
    }

    fn set_on_off(&mut self, device: &str, on: bool) -> Result<()> {
        (**self).set_on_off(device, on)
    }

    fn set_level(&mut self, device: &str, level: u8) -> Result<()> {
        (**self).set_level(device, level)
    }

    fn identify(&mut self, device: &str) -> Result<()> {
        (**self).identify(device)
    }

    fn poll_events(&mut self) -> Vec<ZigbeeEvent> {
        (**self).poll_events()
    }
}

/// A device on the ZigBee network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZigbeeDevice {
    pub id: String,
    pub name: String,
    pub dimmable: bool,
    pub on: bool,
    pub level: u8,
}

/// Unsolicited dongle notifications
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ZigbeeEvent {
    Joined { device: String },
    Left { device: String },
    Attribute { device: String, name: String, value: String },
}

impl ZigbeeEvent {
    pub fn describe(&self) -> String {
        match self {
            ZigbeeEvent::Joined { device } => format!("{} joined the network", device),
            ZigbeeEvent::Left { device } => format!("{} left the network", device),
            ZigbeeEvent::Attribute { device, name, value } => {
                format!("{} reported {} = {}", device, name, value)
            }
        }
    }
}

pub type RadioTransport = Transport<Box<dyn RfRadio>>;
pub type DongleTransport = Transport<Box<dyn ZigbeeDongle>>;

/// The process-wide hardware shared by every connection
#[derive(Debug, Clone)]
pub struct Hardware {
    pub radio: RadioTransport,
    pub dongle: DongleTransport,
}

impl Hardware {
    pub fn new(radio: RadioTransport, dongle: DongleTransport) -> Self {
        Self { radio, dongle }
    }

    /// Simulated drivers for every enabled domain; disabled ones are absent
    pub fn simulated(config: &DeviceConfig) -> Self {
        let radio = if config.rf.enabled {
            Transport::spawn("rf", Box::new(SimulatedRadio::new()) as Box<dyn RfRadio>)
        } else {
            Transport::unavailable("rf")
        };
        let dongle = if config.zigbee.enabled {
            Transport::spawn(
                "zigbee",
                Box::new(SimulatedDongle::from_config(&config.zigbee)) as Box<dyn ZigbeeDongle>,
            )
        } else {
            Transport::unavailable("zigbee")
        };
        Self { radio, dongle }
    }

    /// No hardware attached
    pub fn unavailable() -> Self {
        Self {
            radio: Transport::unavailable("rf"),
            dongle: Transport::unavailable("zigbee"),
        }
    }
}
