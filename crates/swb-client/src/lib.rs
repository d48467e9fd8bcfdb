//! Switchboard Client
//!
//! The controller side of a connection: tracks connection state, queues
//! payloads while disconnected, and keeps every received payload by protocol
//! key for the UI to read or subscribe to.
//!
//! ```no_run
//! use swb_client::ClientSession;
//! use swb_core::Payload;
//!
//! # async fn demo() -> swb_client::ClientResult<()> {
//! let session = ClientSession::new();
//! let mut chooser = session.subscribe(swb_core::ROUTER_KEY);
//! session.send(Payload::ping());
//! session.connect("127.0.0.1:6390").await?;
//! let menu = chooser.recv().await;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod session;

pub use error::{ClientError, ClientResult};
pub use session::{fill_command_info, ClientSession, ConnectionState, Delivery, Target};
