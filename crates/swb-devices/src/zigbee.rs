//! ZigBee protocol - mesh devices behind the shared coordinator dongle
//!
//! Every action that touches the network is queued on the dongle transport
//! and acknowledged at once. The result, followed by any events the dongle
//! raised meanwhile, arrives later through the connection's outbox.

use std::sync::Arc;

use parking_lot::Mutex;
use swb_core::{
    menu, ArgSchema, ArgValues, CommandArgs, Negotiation, Negotiator, Outbox, Payload, Protocol,
    TransportLease, PING, RESET,
};
use tracing::{debug, warn};

use crate::config::ZigbeeDeviceConfig;
use crate::hardware::{DongleTransport, ZigbeeDevice, ZigbeeDongle};

pub const ZIGBEE_KEY: &str = "ZigBeeProtocol";

/// Action of payloads carrying unsolicited dongle events
pub const EVENT: &str = "Event";

const LIST: &str = "ListDevices";
const JOIN: &str = "PermitJoin";
const ON: &str = "On";
const OFF: &str = "Off";
const SET_LEVEL: &str = "SetLevel";
const IDENTIFY: &str = "Identify";

/// Arguments naming one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceArgs {
    pub device: String,
}

impl DeviceArgs {
    fn schema_for(command: &str, description: &str, default: &str) -> ArgSchema {
        ArgSchema::new(command, description, format!("{} <device>", command)).entry("device", default)
    }
}

impl CommandArgs for DeviceArgs {
    fn schema() -> ArgSchema {
        Self::schema_for(ON, "Switch a device on", "")
    }

    fn from_values(values: &ArgValues) -> Result<Self, String> {
        Ok(Self {
            device: values.require("device")?.to_string(),
        })
    }
}

/// Arguments of `SetLevel`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelArgs {
    pub device: String,
    pub level: u8,
}

impl LevelArgs {
    fn schema_for(default: &str) -> ArgSchema {
        ArgSchema::new(
            SET_LEVEL,
            "Set the brightness of a dimmable device",
            "SetLevel <device> <0-255>",
        )
        .entry("device", default)
        .entry("level", 128)
    }
}

impl CommandArgs for LevelArgs {
    fn schema() -> ArgSchema {
        Self::schema_for("")
    }

    fn from_values(values: &ArgValues) -> Result<Self, String> {
        Ok(Self {
            device: values.require("device")?.to_string(),
            level: values.parse_as("level")?,
        })
    }
}

/// Arguments of `PermitJoin`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinArgs {
    pub seconds: u16,
}

impl CommandArgs for JoinArgs {
    fn schema() -> ArgSchema {
        ArgSchema::new(JOIN, "Open the network for new devices", "PermitJoin <seconds>")
            .entry("seconds", 60)
    }

    fn from_values(values: &ArgValues) -> Result<Self, String> {
        Ok(Self {
            seconds: values.parse_as("seconds")?,
        })
    }
}

pub struct ZigBeeProtocol {
    channel: u8,
    seed: Vec<ZigbeeDevice>,
    /// Last known network, refreshed after every dongle job
    devices: Arc<Mutex<Vec<ZigbeeDevice>>>,
    dongle: TransportLease<Box<dyn ZigbeeDongle>>,
    outbox: Outbox,
    negotiator: Negotiator,
}

impl ZigBeeProtocol {
    pub fn new(
        channel: u8,
        known: &[ZigbeeDeviceConfig],
        dongle: &DongleTransport,
        outbox: Outbox,
    ) -> Self {
        let seed: Vec<ZigbeeDevice> = known
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
            channel,
            devices: Arc::new(Mutex::new(seed.clone())),
            seed,
            dongle: dongle.lease(),
            outbox,
            negotiator: Negotiator::new(),
        }
    }

    fn dongle_ready(&self) -> bool {
        self.dongle.is_available()
    }

    fn commands(&self) -> Vec<String> {
        if self.dongle_ready() {
            menu([LIST, JOIN, ON, OFF, SET_LEVEL, IDENTIFY])
        } else {
            menu(Vec::<String>::new())
        }
    }

    fn reply(&self, action: &str, response: impl Into<String>) -> Payload {
        Payload::new(ZIGBEE_KEY)
            .with_action(action)
            .with_response(response)
            .with_commands(self.commands())
    }

    fn status(&self) -> String {
        if !self.dongle_ready() {
            return "ZigBee dongle unavailable".to_string();
        }
        let mut status = format!(
            "ZigBee network on channel {}, {} devices",
            self.channel,
            self.devices.lock().len()
        );
        if let Some(command) = self.negotiator.pending() {
            status.push_str(&format!(", waiting for {} arguments", command));
        }
        status
    }

    /// Default device for argument forms: the first one that suits `dimmable_only`
    fn default_device(&self, dimmable_only: bool) -> String {
        self.devices
            .lock()
            .iter()
            .find(|d| !dimmable_only || d.dimmable)
            .map(|d| d.id.clone())
            .unwrap_or_default()
    }

    fn unavailable(&self, action: &str) -> Payload {
        self.reply(action, format!("ZigBee dongle unavailable; {} is disabled", action))
    }

    /// Queue `job` on the dongle. Its payload gets the protocol key, the
    /// action and the menu as of submission.
    fn execute<F>(&self, action: &str, ack: String, job: F) -> Payload
    where
        F: FnOnce(&mut Box<dyn ZigbeeDongle>) -> swb_core::Result<Payload> + Send + 'static,
    {
        let outbox = self.outbox.clone();
        let devices = self.devices.clone();
        let commands = self.commands();
        let job_action = action.to_string();

        let submitted = self.dongle.submit(move |dongle| {
            let result = match job(dongle) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(action = %job_action, error = %e, "ZigBee job failed");
                    Payload::default().with_response(format!("{} failed: {}", job_action, e))
                }
            };
            if let Ok(network) = dongle.devices() {
                *devices.lock() = network;
            }

            let _ = outbox.send(
                result
                    .with_key(ZIGBEE_KEY)
                    .with_action(job_action.as_str())
                    .with_commands(commands.clone()),
            );
            for event in dongle.poll_events() {
                debug!(?event, "ZigBee event");
                let mut payload = Payload::new(ZIGBEE_KEY)
                    .with_action(EVENT)
                    .with_response(event.describe())
                    .with_commands(commands.clone());
                if let Ok(json) = serde_json::to_string(&event) {
                    payload = payload.with_data(json);
                }
                let _ = outbox.send(payload);
            }
        });

        match submitted {
            Ok(()) => self.reply(action, ack),
            Err(e) => self.reply(action, format!("ZigBee dongle unavailable: {}", e)),
        }
    }

    fn list(&self) -> Payload {
        if !self.dongle_ready() {
            return self.unavailable(LIST);
        }
        self.execute(LIST, "Executing ListDevices…".to_string(), |dongle| {
            let devices = dongle.devices()?;
            let lines: Vec<String> = devices
                .iter()
                .map(|d| {
                    let state = if d.on { "on" } else { "off" };
                    if d.dimmable {
                        format!("{} ({}): {} level {}", d.id, d.name, state, d.level)
                    } else {
                        format!("{} ({}): {}", d.id, d.name, state)
                    }
                })
                .collect();
            let response = if lines.is_empty() {
                "No devices on the network".to_string()
            } else {
                lines.join("\n")
            };
            Ok(Payload::default()
                .with_response(response)
                .with_data(serde_json::to_string(&devices)?))
        })
    }

    fn permit_join(&mut self, data: Option<&str>) -> Payload {
        if !self.dongle_ready() {
            return self.unavailable(JOIN);
        }
        let args = match self.negotiator.negotiate::<JoinArgs>(data) {
            Negotiation::Ready(args) => args,
            Negotiation::Challenge(schema) => return schema.challenge(ZIGBEE_KEY, self.commands()),
            Negotiation::Malformed(reason) => return self.reply(JOIN, reason),
        };
        let seconds = args.seconds;
        self.execute(JOIN, format!("Executing PermitJoin for {}s…", seconds), move |dongle| {
            dongle.permit_join(seconds)?;
            Ok(Payload::default().with_response(format!("Network open for {}s", seconds)))
        })
    }

    fn device_action(&mut self, action: &str, data: Option<&str>) -> Payload {
        if !self.dongle_ready() {
            return self.unavailable(action);
        }
        let description = match action {
            ON => "Switch a device on",
            OFF => "Switch a device off",
            _ => "Make a device blink",
        };
        let schema = DeviceArgs::schema_for(action, description, &self.default_device(false));
        let args = match self.negotiator.negotiate_with::<DeviceArgs>(data, schema) {
            Negotiation::Ready(args) => args,
            Negotiation::Challenge(schema) => return schema.challenge(ZIGBEE_KEY, self.commands()),
            Negotiation::Malformed(reason) => return self.reply(action, reason),
        };

        let device = args.device;
        let ack = format!("Executing {} {}…", action, device);
        let verb = action.to_string();
        self.execute(action, ack, move |dongle| {
            let response = match verb.as_str() {
                ON => {
                    dongle.set_on_off(&device, true)?;
                    format!("{} is on", device)
                }
                OFF => {
                    dongle.set_on_off(&device, false)?;
                    format!("{} is off", device)
                }
                _ => {
                    dongle.identify(&device)?;
                    format!("{} identified", device)
                }
            };
            Ok(Payload::default().with_response(response))
        })
    }

    fn set_level(&mut self, data: Option<&str>) -> Payload {
        if !self.dongle_ready() {
            return self.unavailable(SET_LEVEL);
        }
        let schema = LevelArgs::schema_for(&self.default_device(true));
        let args = match self.negotiator.negotiate_with::<LevelArgs>(data, schema) {
            Negotiation::Ready(args) => args,
            Negotiation::Challenge(schema) => return schema.challenge(ZIGBEE_KEY, self.commands()),
            Negotiation::Malformed(reason) => return self.reply(SET_LEVEL, reason),
        };

        let LevelArgs { device, level } = args;
        let ack = format!("Executing SetLevel {} to {}…", device, level);
        self.execute(SET_LEVEL, ack, move |dongle| {
            dongle.set_level(&device, level)?;
            Ok(Payload::default().with_response(format!("{} level is {}", device, level)))
        })
    }
}

impl Protocol for ZigBeeProtocol {
    fn key(&self) -> &str {
        ZIGBEE_KEY
    }

    fn process(&mut self, payload: Payload) -> Payload {
        let data = payload.data();
        match payload.effective_action() {
            PING => self.reply(PING, self.status()),
            RESET => {
                self.negotiator.clear();
                *self.devices.lock() = self.seed.clone();
                self.reply(RESET, self.status())
            }
            LIST => self.list(),
            JOIN => self.permit_join(data),
            ON => self.device_action(ON, data),
            OFF => self.device_action(OFF, data),
            IDENTIFY => self.device_action(IDENTIFY, data),
            SET_LEVEL => self.set_level(data),
            other => self.reply(other, format!("Unknown action: {}", other)),
        }
    }

    fn close(&mut self) {
        self.dongle.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedDongle;
    use crate::config::ZigbeeConfig;
    use std::time::Duration;
    use swb_core::{Transport, COMMAND_INFO};
    use tokio::sync::mpsc;

    fn known() -> Vec<ZigbeeDeviceConfig> {
        vec![
            ZigbeeDeviceConfig {
                id: "plug-1".into(),
                name: "Kettle".into(),
                dimmable: false,
            },
            ZigbeeDeviceConfig {
                id: "bulb-1".into(),
                name: "Hall".into(),
                dimmable: true,
            },
        ]
    }

    fn setup() -> (ZigBeeProtocol, mpsc::UnboundedReceiver<Payload>, DongleTransport) {
        let dongle = SimulatedDongle::from_config(&ZigbeeConfig {
            devices: known(),
            ..ZigbeeConfig::default()
        });
        let transport = Transport::spawn("zigbee", Box::new(dongle) as Box<dyn ZigbeeDongle>);
        let (tx, rx) = mpsc::unbounded_channel();
        (ZigBeeProtocol::new(15, &known(), &transport, tx), rx, transport)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Payload>) -> Payload {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_set_level_negotiation() {
        let (mut protocol, mut rx, _transport) = setup();

        let challenge = protocol.process(Payload::request("SetLevel"));
        assert_eq!(challenge.action(), Some(COMMAND_INFO));
        assert_eq!(challenge.key(), ZIGBEE_KEY);
        assert!(challenge.offers("Reset"));

        // Same question, same schema
        let again = protocol.process(Payload::request("SetLevel"));
        assert_eq!(again.data(), challenge.data());

        let mut schema = ArgSchema::from_json(challenge.data().unwrap()).unwrap();
        assert_eq!(schema.get("device"), Some("bulb-1"));
        assert_eq!(schema.get("level"), Some("128"));
        schema.set("level", "200");

        let ack = protocol.process(Payload::request("SetLevel").with_data(schema.to_json().unwrap()));
        assert_ne!(ack.action(), Some(COMMAND_INFO));
        assert_eq!(ack.action(), Some("SetLevel"));
        assert!(ack.response().unwrap().starts_with("Executing SetLevel"));

        let result = next(&mut rx).await;
        assert_eq!(result.action(), Some("SetLevel"));
        assert_eq!(result.response(), Some("bulb-1 level is 200"));

        let event = next(&mut rx).await;
        assert_eq!(event.action(), Some(EVENT));
        assert_eq!(event.response(), Some("bulb-1 reported level = 200"));
    }

    #[tokio::test]
    async fn test_hardware_failure_reported_async() {
        let (mut protocol, mut rx, _transport) = setup();
        protocol.process(Payload::request("SetLevel").with_data(r#"{"device": "plug-1", "level": 5}"#));
        let result = next(&mut rx).await;
        assert!(result.response().unwrap().contains("not dimmable"));
        assert!(result.offers("Reset"));
    }

    #[tokio::test]
    async fn test_permit_join_refreshes_devices() {
        let (mut protocol, mut rx, _transport) = setup();
        let challenge = protocol.process(Payload::request("PermitJoin"));
        assert!(challenge.is_command_info());

        protocol.process(Payload::request("PermitJoin").with_data(r#"{"seconds": "30"}"#));
        assert_eq!(next(&mut rx).await.response(), Some("Network open for 30s"));
        assert_eq!(next(&mut rx).await.response(), Some("sim-1 joined the network"));

        protocol.process(Payload::request("ListDevices"));
        let listed = next(&mut rx).await;
        let devices: Vec<ZigbeeDevice> = serde_json::from_str(listed.data().unwrap()).unwrap();
        assert_eq!(devices.len(), 3);
        assert!(protocol.process(Payload::ping()).response().unwrap().contains("3 devices"));

        // Reset forgets what was learned since the protocol started
        protocol.process(Payload::request("Reset"));
        assert!(protocol.process(Payload::ping()).response().unwrap().contains("2 devices"));
    }

    #[test]
    fn test_unavailable_dongle_offers_only_reset() {
        let transport: DongleTransport = Transport::unavailable("zigbee");
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut protocol = ZigBeeProtocol::new(15, &known(), &transport, tx);

        let status = protocol.process(Payload::ping());
        assert_eq!(status.response(), Some("ZigBee dongle unavailable"));
        assert_eq!(status.commands(), ["Reset"]);

        let refused = protocol.process(Payload::request("SetLevel"));
        assert!(!refused.is_command_info());
        assert_eq!(refused.commands(), ["Reset"]);
    }
}
