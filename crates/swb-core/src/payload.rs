//! The wire message exchanged between controllers and the server

use serde::{Deserialize, Serialize};

/// No-op status request. A payload without an action means the same thing.
pub const PING: &str = "Ping";
/// Returns a protocol to its initial state. Always a legal next action.
pub const RESET: &str = "Reset";
/// Router token: re-open the protocol chooser.
pub const CHOOSER: &str = "Chooser";
/// Router token: reset the active protocol, then re-open the chooser.
pub const RESET_CURRENT: &str = "ResetCurrent";
/// Action of an argument challenge; `data` carries the serialized schema.
pub const COMMAND_INFO: &str = "CommandInfo";
/// Response text that asks the server to close the connection.
pub const BYE: &str = "Bye.";

/// A single protocol message.
///
/// Payloads are never edited in place; the `with_*` builders consume the value
/// and hand back a new one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// Key of the protocol that owns this message
    #[serde(default)]
    key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    action: Option<String>,
    /// Opaque, protocol-defined argument or result blob
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    response: Option<String>,
    /// Every action legal to send next, in menu order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    commands: Vec<String>,
}

impl Payload {
    /// Create an empty payload owned by `key`
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }

    /// Client-side request for `action`, not yet addressed to a protocol key
    pub fn request(action: impl Into<String>) -> Self {
        Self {
            action: Some(action.into()),
            ..Self::default()
        }
    }

    /// The status request every protocol must answer without side effects
    pub fn ping() -> Self {
        Self::request(PING)
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.response = Some(response.into());
        self
    }

    pub fn with_commands<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.commands = commands.into_iter().map(Into::into).collect();
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn action(&self) -> Option<&str> {
        self.action.as_deref()
    }

    /// The action with the null-means-ping rule applied
    pub fn effective_action(&self) -> &str {
        match self.action.as_deref() {
            None => PING,
            Some(action) => action,
        }
    }

    pub fn data(&self) -> Option<&str> {
        self.data.as_deref()
    }

    pub fn response(&self) -> Option<&str> {
        self.response.as_deref()
    }

    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    pub fn is_ping(&self) -> bool {
        self.effective_action() == PING
    }

    /// Whether this payload is an argument challenge
    pub fn is_command_info(&self) -> bool {
        self.action.as_deref() == Some(COMMAND_INFO)
    }

    /// Whether the server should close the connection after sending this
    pub fn is_terminal(&self) -> bool {
        self.response.as_deref() == Some(BYE)
    }

    /// Whether `action` is currently offered by this payload's menu
    pub fn offers(&self, action: &str) -> bool {
        self.commands.iter().any(|c| c == action)
    }
}

/// Build a command menu from `actions`, guaranteeing a trailing `Reset`.
pub fn menu<I, S>(actions: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut commands: Vec<String> = actions
        .into_iter()
        .map(Into::into)
        .filter(|c| c != RESET)
        .collect();
    commands.push(RESET.to_string());
    commands
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_action_is_ping() {
        let payload = Payload::new("KnockKnockProtocol");
        assert_eq!(payload.action(), None);
        assert_eq!(payload.effective_action(), PING);
        assert!(payload.is_ping());
    }

    #[test]
    fn test_menu_always_ends_with_reset() {
        assert_eq!(menu(["On", "Off"]), vec!["On", "Off", "Reset"]);
        assert_eq!(menu(["Reset", "On"]), vec!["On", "Reset"]);
        assert_eq!(menu(Vec::<String>::new()), vec!["Reset"]);
    }

    #[test]
    fn test_terminal_sentinel() {
        let bye = Payload::new("KnockKnockProtocol").with_response(BYE);
        assert!(bye.is_terminal());
        assert!(!Payload::new("x").with_response("Bye").is_terminal());
    }

    #[test]
    fn test_builders_preserve_command_order() {
        let payload = Payload::new("k").with_commands(["b", "a", "c"]);
        assert_eq!(payload.commands(), ["b", "a", "c"]);
        assert!(payload.offers("a"));
        assert!(!payload.offers("d"));
    }
}
