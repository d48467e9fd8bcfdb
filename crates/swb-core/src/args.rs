//! Two-phase argument negotiation
//!
//! A parameterized action sent without usable arguments is answered with a
//! `CommandInfo` challenge carrying an [`ArgSchema`]. The controller fills in
//! the entry values and resends the action with the filled schema as `data`.
//! Only a complete, well-typed argument set is ever executed.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::payload::{Payload, COMMAND_INFO};

/// One named argument and its (default or filled) value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgEntry {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

/// Self-description of a parameterized command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgSchema {
    pub command: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub syntax: String,
    #[serde(default)]
    pub entries: Vec<ArgEntry>,
}

impl ArgSchema {
    pub fn new(
        command: impl Into<String>,
        description: impl Into<String>,
        syntax: impl Into<String>,
    ) -> Self {
        Self {
            command: command.into(),
            description: description.into(),
            syntax: syntax.into(),
            entries: Vec::new(),
        }
    }

    /// Add an entry with its default value
    pub fn entry(mut self, key: impl Into<String>, default: impl ToString) -> Self {
        self.entries.push(ArgEntry {
            key: key.into(),
            value: default.to_string(),
        });
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.value.as_str())
    }

    /// Set the value of an existing entry. Unknown keys are ignored.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.key == key) {
            entry.value = value.into();
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Build the `CommandInfo` challenge payload for this schema
    pub fn challenge(&self, key: &str, commands: Vec<String>) -> Payload {
        let payload = Payload::new(key)
            .with_action(COMMAND_INFO)
            .with_response(format!("{} needs arguments: {}", self.command, self.syntax))
            .with_commands(commands);
        match self.to_json() {
            Ok(json) => payload.with_data(json),
            Err(_) => payload,
        }
    }
}

/// Filled argument values received from a controller
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArgValues {
    entries: Vec<ArgEntry>,
}

impl ArgValues {
    /// Parse filled arguments. Accepts either an echoed [`ArgSchema`] or a
    /// flat JSON object of `key: value` pairs.
    pub fn parse(data: &str) -> Result<Self> {
        let json: serde_json::Value = serde_json::from_str(data)?;
        let object = match json {
            serde_json::Value::Object(object) => object,
            other => {
                return Err(Error::Serialization(format!(
                    "expected a JSON object, got {}",
                    other
                )))
            }
        };

        if object.contains_key("entries") {
            let schema: ArgSchema = serde_json::from_value(serde_json::Value::Object(object))?;
            return Ok(Self {
                entries: schema.entries,
            });
        }

        let entries = object
            .into_iter()
            .map(|(key, value)| {
                let value = match value {
                    serde_json::Value::String(s) => s,
                    serde_json::Value::Null => String::new(),
                    other => other.to_string(),
                };
                ArgEntry { key, value }
            })
            .collect();
        Ok(Self { entries })
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: pairs
                .into_iter()
                .map(|(k, v)| ArgEntry {
                    key: k.into(),
                    value: v.into(),
                })
                .collect(),
        }
    }

    /// Trimmed value for `key`; blank values count as absent
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.value.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn require(&self, key: &str) -> std::result::Result<&str, String> {
        self.get(key).ok_or_else(|| format!("missing {}", key))
    }

    /// Required entry parsed into `T`
    pub fn parse_as<T: FromStr>(&self, key: &str) -> std::result::Result<T, String> {
        let raw = self.require(key)?;
        raw.parse()
            .map_err(|_| format!("{} is not a valid value for {}", raw, key))
    }
}

/// Typed arguments of one parameterized command
pub trait CommandArgs: Sized {
    /// The schema sent in a `CommandInfo` challenge
    fn schema() -> ArgSchema;

    /// Build the arguments, or explain which entry is missing or ill-typed
    fn from_values(values: &ArgValues) -> std::result::Result<Self, String>;
}

/// Outcome of inspecting an action's `data`
#[derive(Debug, Clone, PartialEq)]
pub enum Negotiation<A> {
    /// Complete arguments; execute the command
    Ready(A),
    /// No usable arguments; send this schema back as a challenge
    Challenge(ArgSchema),
    /// `data` could not be read at all
    Malformed(String),
}

/// Inspect `data` for `A`, challenging with `A::schema()`
pub fn negotiate<A: CommandArgs>(data: Option<&str>) -> Negotiation<A> {
    negotiate_with(data, A::schema())
}

/// Inspect `data` for `A`, challenging with a caller-supplied schema
/// (for defaults that depend on protocol state)
pub fn negotiate_with<A: CommandArgs>(data: Option<&str>, schema: ArgSchema) -> Negotiation<A> {
    let data = match data.map(str::trim) {
        None | Some("") => return Negotiation::Challenge(schema),
        Some(data) => data,
    };

    let values = match ArgValues::parse(data) {
        Ok(values) => values,
        Err(e) => {
            return Negotiation::Malformed(format!(
                "Could not read arguments for {}: {}",
                schema.command, e
            ))
        }
    };

    match A::from_values(&values) {
        Ok(args) => Negotiation::Ready(args),
        // Present but invalid arguments never execute
        Err(_) => Negotiation::Challenge(schema),
    }
}

/// Tracks the command currently awaiting arguments
#[derive(Debug, Default, Clone)]
pub struct Negotiator {
    pending: Option<String>,
}

impl Negotiator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn negotiate<A: CommandArgs>(&mut self, data: Option<&str>) -> Negotiation<A> {
        self.negotiate_with(data, A::schema())
    }

    pub fn negotiate_with<A: CommandArgs>(
        &mut self,
        data: Option<&str>,
        schema: ArgSchema,
    ) -> Negotiation<A> {
        let command = schema.command.clone();
        let outcome = negotiate_with(data, schema);
        self.pending = match outcome {
            Negotiation::Challenge(_) => Some(command),
            _ => None,
        };
        outcome
    }

    /// Command whose arguments were last challenged
    pub fn pending(&self) -> Option<&str> {
        self.pending.as_deref()
    }

    pub fn clear(&mut self) {
        self.pending = None;
    }
}
