//! Switchboard wire format
//!
//! Newline-delimited UTF-8 JSON, one payload per line, in both directions.
//!
//! ```text
//! {"action":"KnockKnock"}
//! {"key":"KnockKnockProtocol","action":"Ping","response":"Chose Protocol: ...","commands":["Start","ResetCurrent","Reset"]}
//! ```
//!
//! Decoding never fails: blank or malformed lines become a `Ping`.

pub mod codec;
pub mod error;
pub mod parser;

pub use codec::{decode, encode, encode_line, try_decode};
pub use error::{ProtocolError, ProtocolResult};
pub use parser::{Parser, MAX_LINE_SIZE};
