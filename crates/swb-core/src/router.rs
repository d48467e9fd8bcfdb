//! Router - selects one protocol per connection and forwards to it

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::payload::{menu, Payload, CHOOSER, PING, RESET, RESET_CURRENT};
use crate::protocol::{Protocol, ProtocolContext};

/// Key of the router's own responses
pub const ROUTER_KEY: &str = "ProxyProtocol";

/// Builds a protocol instance for one connection
pub type ProtocolFactory =
    Arc<dyn Fn(&ProtocolContext) -> Result<Box<dyn Protocol>> + Send + Sync>;

/// Selector token to factory map, kept in menu order
#[derive(Clone, Default)]
pub struct ProtocolRegistry {
    entries: Vec<(String, ProtocolFactory)>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `selector`. A repeated selector replaces the
    /// earlier factory but keeps its menu position.
    pub fn register<F>(&mut self, selector: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&ProtocolContext) -> Result<Box<dyn Protocol>> + Send + Sync + 'static,
    {
        let selector = selector.into();
        let factory: ProtocolFactory = Arc::new(factory);
        match self.entries.iter_mut().find(|(s, _)| *s == selector) {
            Some(entry) => entry.1 = factory,
            None => self.entries.push((selector, factory)),
        }
        self
    }

    /// Builder-style [`register`](Self::register)
    pub fn with<F>(mut self, selector: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&ProtocolContext) -> Result<Box<dyn Protocol>> + Send + Sync + 'static,
    {
        self.register(selector, factory);
        self
    }

    pub fn selectors(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(s, _)| s.as_str())
    }

    pub fn contains(&self, selector: &str) -> bool {
        self.entries.iter().any(|(s, _)| s == selector)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Instantiate the protocol registered under `selector`
    pub fn build(&self, selector: &str, context: &ProtocolContext) -> Result<Box<dyn Protocol>> {
        let (_, factory) = self
            .entries
            .iter()
            .find(|(s, _)| s == selector)
            .ok_or_else(|| Error::UnknownSelector(selector.to_string()))?;
        factory(context)
    }

    /// The chooser menu: every selector followed by `Reset`
    pub fn menu(&self) -> Vec<String> {
        menu(self.selectors())
    }
}

impl std::fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.selectors()).finish()
    }
}

/// Router state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterState {
    /// No protocol selected; the chooser menu is on offer
    Choosing,
    /// Forwarding to the protocol chosen with this selector
    Delegating(String),
}

/// The proxy protocol every connection starts with
pub struct Router {
    registry: Arc<ProtocolRegistry>,
    context: ProtocolContext,
    state: RouterState,
    /// Instances created on this connection, keyed by selector
    instances: HashMap<String, Box<dyn Protocol>>,
}

impl Router {
    pub fn new(registry: Arc<ProtocolRegistry>, context: ProtocolContext) -> Self {
        Self {
            registry,
            context,
            state: RouterState::Choosing,
            instances: HashMap::new(),
        }
    }

    pub fn state(&self) -> &RouterState {
        &self.state
    }

    pub fn is_choosing(&self) -> bool {
        self.state == RouterState::Choosing
    }

    /// Key of the protocol currently delegated to
    pub fn active_key(&self) -> Option<&str> {
        match &self.state {
            RouterState::Choosing => None,
            RouterState::Delegating(selector) => self.instances.get(selector).map(|p| p.key()),
        }
    }

    /// Fit a payload a protocol produced out of band (through the outbox)
    /// to the router's current menu. Results from a protocol that is no
    /// longer active carry the chooser menu instead of stale commands.
    pub fn annotate(&self, payload: Payload) -> Payload {
        match self.active_key() {
            Some(key) if key == payload.key() => {
                let key = key.to_string();
                Self::decorate(payload, &key)
            }
            _ => payload.with_commands(self.registry.menu()),
        }
    }

    fn chooser(&self, response: impl Into<String>) -> Payload {
        Payload::new(ROUTER_KEY)
            .with_action(CHOOSER)
            .with_response(response)
            .with_commands(self.registry.menu())
    }

    fn choose(&mut self, payload: Payload) -> Payload {
        let action = payload.effective_action();
        match action {
            PING | RESET | CHOOSER => self.chooser("Choose a protocol"),
            selector if self.registry.contains(selector) => {
                let selector = selector.to_string();
                self.select(selector)
            }
            other => {
                debug!(conn = %self.context.connection_id(), action = %other, "Unknown protocol selector");
                self.chooser(format!("Unknown protocol: {}. Choose a protocol", other))
            }
        }
    }

    fn select(&mut self, selector: String) -> Payload {
        if !self.instances.contains_key(&selector) {
            match self.registry.build(&selector, &self.context) {
                Ok(protocol) => {
                    self.instances.insert(selector.clone(), protocol);
                }
                Err(e) => {
                    warn!(conn = %self.context.connection_id(), selector = %selector, error = %e, "Protocol construction failed");
                    return self.chooser(format!("Could not start {}: {}", selector, e));
                }
            }
        }

        let protocol = match self.instances.get_mut(&selector) {
            Some(protocol) => protocol,
            None => return self.chooser("Choose a protocol"),
        };

        info!(conn = %self.context.connection_id(), protocol = %protocol.key(), "Protocol chosen");
        let status = protocol.process(Payload::ping().with_key(protocol.key()));
        let banner = format!(
            "Chose Protocol: {}\n{}",
            protocol.key(),
            status.response().unwrap_or_default()
        );
        let key = protocol.key().to_string();
        self.state = RouterState::Delegating(selector);
        Self::decorate(status, &key).with_response(banner)
    }

    fn delegate(&mut self, selector: String, payload: Payload) -> Payload {
        let action = payload.effective_action().to_string();
        let protocol = match self.instances.get_mut(&selector) {
            Some(protocol) => protocol,
            None => {
                self.state = RouterState::Choosing;
                return self.chooser("Choose a protocol");
            }
        };

        match action.as_str() {
            RESET => {
                let key = protocol.key().to_string();
                self.state = RouterState::Choosing;
                info!(conn = %self.context.connection_id(), protocol = %key, "Returned to chooser");
                self.chooser(format!("Left {}. Choose a protocol", key))
            }
            RESET_CURRENT => {
                let key = protocol.key().to_string();
                protocol.process(Payload::request(RESET).with_key(key.as_str()));
                self.state = RouterState::Choosing;
                info!(conn = %self.context.connection_id(), protocol = %key, "Protocol reset");
                self.chooser(format!("Reset {}. Choose a protocol", key))
            }
            _ => {
                let key = protocol.key().to_string();
                let response = protocol.process(payload);
                Self::decorate(response, &key)
            }
        }
    }

    /// Append the router-level escape actions after the delegate's own menu
    fn decorate(response: Payload, key: &str) -> Payload {
        let commands: Vec<String> = response
            .commands()
            .iter()
            .filter(|c| c.as_str() != RESET && c.as_str() != RESET_CURRENT)
            .cloned()
            .chain([RESET_CURRENT.to_string(), RESET.to_string()])
            .collect();
        let response = if response.key().is_empty() {
            response.with_key(key)
        } else {
            response
        };
        response.with_commands(commands)
    }
}

impl Protocol for Router {
    fn key(&self) -> &str {
        ROUTER_KEY
    }

    fn process(&mut self, payload: Payload) -> Payload {
        match self.state.clone() {
            RouterState::Choosing => self.choose(payload),
            RouterState::Delegating(selector) => self.delegate(selector, payload),
        }
    }

    fn close(&mut self) {
        for (selector, mut protocol) in self.instances.drain() {
            debug!(conn = %self.context.connection_id(), selector = %selector, "Closing protocol");
            protocol.close();
        }
        self.state = RouterState::Choosing;
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        self.close();
    }
}
