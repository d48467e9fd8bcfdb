//! The interface every stateful command handler implements

use tokio::sync::mpsc;

use crate::payload::Payload;

/// Channel for payloads produced after `process` has returned
/// (hardware results, device events).
pub type Outbox = mpsc::UnboundedSender<Payload>;

/// Per-connection handles given to a protocol when it is created
#[derive(Debug, Clone)]
pub struct ProtocolContext {
    connection_id: String,
    outbox: Outbox,
}

impl ProtocolContext {
    pub fn new(connection_id: impl Into<String>, outbox: Outbox) -> Self {
        Self {
            connection_id: connection_id.into(),
            outbox,
        }
    }

    /// Create a context together with the receiving end of its outbox
    pub fn channel(connection_id: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<Payload>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(connection_id, tx), rx)
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }
}

/// A stateful handler for one control domain, owned by a single connection.
///
/// Implementations must:
/// - answer `Ping` with the current status and no side effects,
/// - treat `Reset` as a return to the initial state, dropping any pending
///   argument negotiation,
/// - list every currently legal action (always including `Reset`) in the
///   `commands` of each response,
/// - report bad input in the response text instead of failing.
///
/// `process` is never called concurrently on the same instance.
pub trait Protocol: Send {
    /// Key echoed in every response of this protocol
    fn key(&self) -> &str;

    /// Handle one request and produce its response
    fn process(&mut self, payload: Payload) -> Payload;

    /// Release owned resources. Must be idempotent.
    fn close(&mut self);
}

impl<P: Protocol + ?Sized> Protocol for Box<P> {
    fn key(&self) -> &str {
        (**self).key()
    }

    fn process(&mut self, payload: Payload) -> Payload {
        (**self).process(payload)
    }

    fn close(&mut self) {
        (**self).close()
    }
}
