//! RF switch protocol - fixed-code on/off switches behind a shared radio

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use swb_core::{
    menu, ArgSchema, ArgValues, CommandArgs, Negotiation, Negotiator, Outbox, Payload, Protocol,
    TransportLease, PING, RESET,
};
use tracing::{debug, warn};

use crate::config::SwitchConfig;
use crate::hardware::{RadioTransport, RfRadio};

pub const RF_SWITCH_KEY: &str = "RfSwitchProtocol";

const LIST: &str = "ListSwitches";
const ON: &str = "SwitchOn";
const OFF: &str = "SwitchOff";
const ALL_OFF: &str = "AllOff";
const ADD: &str = "AddSwitch";
const REMOVE: &str = "RemoveSwitch";

/// Arguments naming one switch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchArgs {
    pub switch: String,
}

impl SwitchArgs {
    fn schema_for(command: &str, description: &str, default: &str) -> ArgSchema {
        ArgSchema::new(command, description, format!("{} <switch>", command)).entry("switch", default)
    }
}

impl CommandArgs for SwitchArgs {
    fn schema() -> ArgSchema {
        Self::schema_for(ON, "Turn a switch on", "")
    }

    fn from_values(values: &ArgValues) -> Result<Self, String> {
        Ok(Self {
            switch: values.require("switch")?.to_string(),
        })
    }
}

/// Arguments of `AddSwitch`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddSwitchArgs {
    pub name: String,
    pub on_code: u32,
    pub off_code: u32,
}

impl CommandArgs for AddSwitchArgs {
    fn schema() -> ArgSchema {
        ArgSchema::new(
            ADD,
            "Teach a new switch by its on and off codes",
            "AddSwitch <name> <on_code> <off_code>",
        )
        .entry("name", "")
        .entry("on_code", "")
        .entry("off_code", "")
    }

    fn from_values(values: &ArgValues) -> Result<Self, String> {
        Ok(Self {
            name: values.require("name")?.to_string(),
            on_code: values.parse_as("on_code")?,
            off_code: values.parse_as("off_code")?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
struct Switch {
    name: String,
    on_code: u32,
    off_code: u32,
    /// State confirmed by the radio; `None` until a transmission succeeds
    state: Option<bool>,
}

impl From<&SwitchConfig> for Switch {
    fn from(config: &SwitchConfig) -> Self {
        Self {
            name: config.name.clone(),
            on_code: config.on_code,
            off_code: config.off_code,
            state: None,
        }
    }
}

type SwitchTable = Arc<Mutex<Vec<Switch>>>;

fn seeded(seed: &[SwitchConfig]) -> SwitchTable {
    Arc::new(Mutex::new(seed.iter().map(Switch::from).collect()))
}

/// Drives fixed-code switches through the shared radio
pub struct RfSwitchProtocol {
    seed: Vec<SwitchConfig>,
    /// Shared with queued radio jobs, which record the outcome
    switches: SwitchTable,
    radio: TransportLease<Box<dyn RfRadio>>,
    outbox: Outbox,
    negotiator: Negotiator,
}

impl RfSwitchProtocol {
    pub fn new(seed: Vec<SwitchConfig>, radio: &RadioTransport, outbox: Outbox) -> Self {
        Self {
            switches: seeded(&seed),
            seed,
            radio: radio.lease(),
            outbox,
            negotiator: Negotiator::new(),
        }
    }

    fn radio_ready(&self) -> bool {
        self.radio.is_available()
    }

    fn commands(&self) -> Vec<String> {
        let mut actions = vec![LIST];
        let has_switches = !self.switches.lock().is_empty();
        if self.radio_ready() && has_switches {
            actions.extend([ON, OFF, ALL_OFF]);
        }
        actions.push(ADD);
        if has_switches {
            actions.push(REMOVE);
        }
        menu(actions)
    }

    fn status(&self) -> String {
        let radio = if self.radio_ready() {
            "RF radio ready"
        } else {
            "RF radio unavailable"
        };
        let count = self.switches.lock().len();
        match self.negotiator.pending() {
            Some(command) => format!("{}, {} switches, waiting for {} arguments", radio, count, command),
            None => format!("{}, {} switches", radio, count),
        }
    }

    fn reply(&self, action: &str, response: impl Into<String>) -> Payload {
        Payload::new(RF_SWITCH_KEY)
            .with_action(action)
            .with_response(response)
            .with_commands(self.commands())
    }

    fn default_switch(&self) -> String {
        self.switches.lock().first().map(|s| s.name.clone()).unwrap_or_default()
    }

    fn list(&self) -> Payload {
        let switches = self.switches.lock().clone();
        let lines: Vec<String> = switches
            .iter()
            .map(|s| {
                let state = match s.state {
                    Some(true) => "on",
                    Some(false) => "off",
                    None => "unknown",
                };
                format!("{}: {}", s.name, state)
            })
            .collect();
        let response = if lines.is_empty() {
            "No switches configured".to_string()
        } else {
            lines.join("\n")
        };
        let payload = self.reply(LIST, response);
        match serde_json::to_string(&switches) {
            Ok(json) => payload.with_data(json),
            Err(_) => payload,
        }
    }

    fn switch(&mut self, action: &str, on: bool, data: Option<&str>) -> Payload {
        if !self.radio_ready() {
            return self.reply(action, format!("RF radio unavailable; {} is disabled", action));
        }
        let description = if on { "Turn a switch on" } else { "Turn a switch off" };
        let schema = SwitchArgs::schema_for(action, description, &self.default_switch());
        let args = match self.negotiator.negotiate_with::<SwitchArgs>(data, schema) {
            Negotiation::Ready(args) => args,
            Negotiation::Challenge(schema) => return schema.challenge(RF_SWITCH_KEY, self.commands()),
            Negotiation::Malformed(reason) => return self.reply(action, reason),
        };

        let code = self
            .switches
            .lock()
            .iter()
            .find(|s| s.name == args.switch)
            .map(|s| if on { s.on_code } else { s.off_code });
        let Some(code) = code else {
            return self.reply(action, format!("Unknown switch: {}", args.switch));
        };

        match self.transmit(action, args.switch.clone(), code, on) {
            Ok(()) => self.reply(action, format!("Executing {} {}…", action, args.switch)),
            Err(reason) => self.reply(action, reason),
        }
    }

    fn all_off(&mut self) -> Payload {
        if !self.radio_ready() {
            return self.reply(ALL_OFF, "RF radio unavailable; AllOff is disabled");
        }
        let targets: Vec<(String, u32)> = self
            .switches
            .lock()
            .iter()
            .map(|s| (s.name.clone(), s.off_code))
            .collect();
        let count = targets.len();
        for (name, code) in targets {
            if let Err(reason) = self.transmit(ALL_OFF, name, code, false) {
                return self.reply(ALL_OFF, reason);
            }
        }
        self.reply(ALL_OFF, format!("Executing AllOff on {} switches…", count))
    }

    /// Queue one transmission; its outcome arrives through the outbox and,
    /// on success, becomes the switch's recorded state
    fn transmit(&self, action: &str, name: String, code: u32, on: bool) -> Result<(), String> {
        let outbox = self.outbox.clone();
        let switches = self.switches.clone();
        let action = action.to_string();
        let commands = self.commands();
        self.radio
            .submit(move |radio| {
                let response = match radio.transmit(code) {
                    Ok(()) => {
                        if let Some(switch) = switches.lock().iter_mut().find(|s| s.name == name) {
                            switch.state = Some(on);
                        }
                        format!("{} is {}", name, if on { "on" } else { "off" })
                    }
                    Err(e) => {
                        warn!(switch = %name, code, error = %e, "RF transmit failed");
                        format!("{} failed for {}: {}", action, name, e)
                    }
                };
                let _ = outbox.send(
                    Payload::new(RF_SWITCH_KEY)
                        .with_action(action)
                        .with_response(response)
                        .with_commands(commands),
                );
            })
            .map_err(|e| format!("RF radio unavailable: {}", e))
    }

    fn add(&mut self, data: Option<&str>) -> Payload {
        let args = match self.negotiator.negotiate::<AddSwitchArgs>(data) {
            Negotiation::Ready(args) => args,
            Negotiation::Challenge(schema) => return schema.challenge(RF_SWITCH_KEY, self.commands()),
            Negotiation::Malformed(reason) => return self.reply(ADD, reason),
        };
        {
            let mut switches = self.switches.lock();
            if switches.iter().any(|s| s.name == args.name) {
                drop(switches);
                return self.reply(ADD, format!("Switch {} already exists", args.name));
            }
            switches.push(Switch {
                name: args.name.clone(),
                on_code: args.on_code,
                off_code: args.off_code,
                state: None,
            });
        }
        debug!(switch = %args.name, "Switch added");
        self.reply(ADD, format!("Added switch {}", args.name))
    }

    fn remove(&mut self, data: Option<&str>) -> Payload {
        let schema = SwitchArgs::schema_for(REMOVE, "Forget a switch", &self.default_switch());
        let args = match self.negotiator.negotiate_with::<SwitchArgs>(data, schema) {
            Negotiation::Ready(args) => args,
            Negotiation::Challenge(schema) => return schema.challenge(RF_SWITCH_KEY, self.commands()),
            Negotiation::Malformed(reason) => return self.reply(REMOVE, reason),
        };
        let removed = {
            let mut switches = self.switches.lock();
            let before = switches.len();
            switches.retain(|s| s.name != args.switch);
            switches.len() != before
        };
        if !removed {
            return self.reply(REMOVE, format!("Unknown switch: {}", args.switch));
        }
        self.reply(REMOVE, format!("Removed switch {}", args.switch))
    }
}

impl Protocol for RfSwitchProtocol {
    fn key(&self) -> &str {
        RF_SWITCH_KEY
    }

    fn process(&mut self, payload: Payload) -> Payload {
        let data = payload.data();
        match payload.effective_action() {
            PING => self.reply(PING, self.status()),
            RESET => {
                self.negotiator.clear();
                // Jobs still queued keep writing to the old table
                self.switches = seeded(&self.seed);
                self.reply(RESET, self.status())
            }
            LIST => self.list(),
            ON => self.switch(ON, true, data),
            OFF => self.switch(OFF, false, data),
            ALL_OFF => self.all_off(),
            ADD => self.add(data),
            REMOVE => self.remove(data),
            other => self.reply(other, format!("Unknown action: {}", other)),
        }
    }

    fn close(&mut self) {
        self.radio.cancel();
    }
}
