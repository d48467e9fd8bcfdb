//! Simulated hardware for development and tests

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use swb_core::{Error, Result};
use tracing::trace;

use crate::config::ZigbeeConfig;
use crate::hardware::{RfRadio, ZigbeeDevice, ZigbeeDongle, ZigbeeEvent};

/// Records every transmitted code
#[derive(Debug, Clone, Default)]
pub struct SimulatedRadio {
    sent: Arc<Mutex<Vec<u32>>>,
    latency: Duration,
}

impl SimulatedRadio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time each transmission takes
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Shared view of the transmitted codes
    pub fn sent(&self) -> Arc<Mutex<Vec<u32>>> {
        self.sent.clone()
    }
}

impl RfRadio for SimulatedRadio {
    fn transmit(&mut self, code: u32) -> Result<()> {
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        trace!(code, "Simulated RF transmit");
        self.sent.lock().push(code);
        Ok(())
    }
}

/// An in-memory ZigBee network
#[derive(Debug, Clone, Default)]
pub struct SimulatedDongle {
    devices: Arc<Mutex<Vec<ZigbeeDevice>>>,
    events: Vec<ZigbeeEvent>,
    joins: u32,
}

impl SimulatedDongle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &ZigbeeConfig) -> Self {
        let devices = config
            .devices
            .iter()
            .map(|d| ZigbeeDevice {
                id: d.id.clone(),
                name: d.name.clone(),
                dimmable: d.dimmable,
                on: false,
                level: 0,
            })
            .collect();
        Self {
            devices: Arc::new(Mutex::new(devices)),
            ..Self::default()
        }
    }

    /// Shared view of the network's devices
    pub fn network(&self) -> Arc<Mutex<Vec<ZigbeeDevice>>> {
        self.devices.clone()
    }

    fn with_device<T>(&mut self, id: &str, f: impl FnOnce(&mut ZigbeeDevice) -> Result<T>) -> Result<T> {
        let mut devices = self.devices.lock();
        let device = devices
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| Error::Hardware(format!("no device {} on the network", id)))?;
        f(device)
    }
}

impl ZigbeeDongle for SimulatedDongle {
    fn devices(&mut self) -> Result<Vec<ZigbeeDevice>> {
        Ok(self.devices.lock().clone())
    }

    fn permit_join(&mut self, seconds: u16) -> Result<()> {
        if seconds == 0 {
            return Ok(());
        }
        // Every join window brings in one new bulb
        self.joins += 1;
        let id = format!("sim-{}", self.joins);
        self.devices.lock().push(ZigbeeDevice {
            id: id.clone(),
            name: format!("Simulated bulb {}", self.joins),
            dimmable: true,
            on: false,
            level: 0,
        });
        self.events.push(ZigbeeEvent::Joined { device: id });
        Ok(())
    }

    fn set_on_off(&mut self, device: &str, on: bool) -> Result<()> {
        let value = self.with_device(device, |d| {
            d.on = on;
            Ok(if on { "on" } else { "off" })
        })?;
        self.events.push(ZigbeeEvent::Attribute {
            device: device.to_string(),
            name: "on_off".into(),
            value: value.into(),
        });
        Ok(())
    }

    fn set_level(&mut self, device: &str, level: u8) -> Result<()> {
        self.with_device(device, |d| {
            if !d.dimmable {
                return Err(Error::Hardware(format!("{} is not dimmable", d.id)));
            }
            d.level = level;
            d.on = level > 0;
            Ok(())
        })?;
        self.events.push(ZigbeeEvent::Attribute {
            device: device.to_string(),
            name: "level".into(),
            value: level.to_string(),
        });
        Ok(())
    }

    fn identify(&mut self, device: &str) -> Result<()> {
        self.with_device(device, |_| Ok(()))
    }

    fn poll_events(&mut self) -> Vec<ZigbeeEvent> {
        std::mem::take(&mut self.events)
    }
}
