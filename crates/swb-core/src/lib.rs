//! Switchboard Core - payloads, protocols and the router
//!
//! This crate provides the protocol engine shared by server and controller:
//! - The `Payload` message and its reserved action tokens
//! - The `Protocol` trait implemented by every control domain
//! - The `Router` that selects and forwards to one protocol per connection
//! - Two-phase argument negotiation (`CommandInfo` challenges)
//! - Serialized access to shared hardware through `Transport`

pub mod args;
pub mod error;
pub mod payload;
pub mod protocol;
pub mod router;
pub mod transport;

pub use args::{negotiate, negotiate_with, ArgEntry, ArgSchema, ArgValues, CommandArgs, Negotiation, Negotiator};
pub use error::{Error, Result};
pub use payload::{menu, Payload, BYE, CHOOSER, COMMAND_INFO, PING, RESET, RESET_CURRENT};
pub use protocol::{Outbox, Protocol, ProtocolContext};
pub use router::{ProtocolFactory, ProtocolRegistry, Router, RouterState, ROUTER_KEY};
pub use transport::{Transport, TransportLease};
