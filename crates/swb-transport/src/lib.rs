//! Switchboard Transport Layer
//!
//! Serves the payload protocol to controllers:
//! - TCP: one router per accepted connection, coalesced asynchronous output
//! - Discovery: service advertisement and lookup
//! - Metrics: Prometheus metrics (optional feature)

pub mod discovery;
pub mod error;
pub mod handler;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod tcp;

pub use discovery::{DiscoveryStream, FileDiscovery, LocalDiscovery, ServiceDiscovery, ServiceInfo};
pub use error::{TransportError, TransportResult};
pub use handler::ConnectionHandler;
#[cfg(feature = "metrics")]
pub use metrics::{Metrics, MetricsServer};
pub use tcp::{ConnectionInfo, ConnectionServer, ServerConfig, DEFAULT_FLUSH_DELAY};
