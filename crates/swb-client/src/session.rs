//! Client session state machine
//!
//! ```text
//! Disconnected --connect--> Connecting --socket open--> Connected
//!      ^                         |                          |
//!      +------- failure ---------+------ close / error -----+
//! ```
//!
//! Reconnection is never automatic: after a failure the session reports
//! `Disconnected` and waits for an explicit `connect`/`reconnect`.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use swb_core::{ArgSchema, Payload};
use swb_protocol::{encode_line, Parser};
use swb_storage::{KeyValueStore, LAST_SERVICE_KEY};
use swb_transport::{ServiceDiscovery, TransportError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ClientError, ClientResult};

/// Payloads kept per protocol key
const MAX_HISTORY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Where the session connects to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A literal `host:port`
    Address(String),
    /// A service name resolved through discovery on every connect
    Service(String),
}

/// What [`ClientSession::send`] did with a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Queued,
}

/// Build the resubmission of a `CommandInfo` challenge: the action named by
/// `schema` with the filled schema as `data`.
pub fn fill_command_info(schema: &ArgSchema, values: &[(&str, &str)]) -> Payload {
    let mut filled = schema.clone();
    for (key, value) in values {
        filled.set(key, *value);
    }
    let payload = Payload::request(filled.command.as_str());
    match filled.to_json() {
        Ok(json) => payload.with_data(json),
        Err(_) => payload,
    }
}

struct Link {
    state: ConnectionState,
    /// Bumped on every open and close so stale socket tasks are ignored
    generation: u64,
    queue: VecDeque<Payload>,
    writer: Option<mpsc::UnboundedSender<Payload>>,
    reader: Option<JoinHandle<()>>,
    target: Option<Target>,
    last_error: Option<String>,
}

struct Inner {
    link: Mutex<Link>,
    state: watch::Sender<ConnectionState>,
    inbound: mpsc::UnboundedSender<Payload>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Payload>>>,
    history: DashMap<String, VecDeque<Payload>>,
    pending: DashMap<String, ArgSchema>,
    subscribers: DashMap<String, Vec<mpsc::UnboundedSender<Payload>>>,
    everything: Mutex<Vec<mpsc::UnboundedSender<Payload>>>,
}

impl Inner {
    fn set_state(&self, link: &mut Link, state: ConnectionState) {
        if link.state != state {
            debug!(from = %link.state, to = %state, "Connection state changed");
        }
        link.state = state;
        self.state.send_replace(state);
    }

    /// Stop the socket tasks of the current connection, if any
    fn drop_link(&self, link: &mut Link) {
        link.writer = None;
        if let Some(reader) = link.reader.take() {
            reader.abort();
        }
        link.generation += 1;
    }

    fn connection_lost(&self, generation: u64, reason: String) {
        let mut link = self.link.lock();
        if link.generation != generation {
            return;
        }
        warn!(reason = %reason, "Connection lost");
        self.drop_link(&mut link);
        link.last_error = Some(reason);
        self.set_state(&mut link, ConnectionState::Disconnected);
    }

    /// Record and fan out one received payload
    fn dispatch(&self, payload: Payload) {
        let key = payload.key().to_string();

        let schema = if payload.is_command_info() {
            payload.data().and_then(|data| ArgSchema::from_json(data).ok())
        } else {
            None
        };
        match schema {
            Some(schema) => {
                debug!(key = %key, command = %schema.command, "Arguments requested");
                self.pending.insert(key.clone(), schema);
            }
            None => {
                if payload.is_command_info() {
                    warn!(key = %key, "CommandInfo without a readable schema");
                }
                let mut history = self.history.entry(key.clone()).or_default();
                if history.len() == MAX_HISTORY {
                    history.pop_front();
                }
                history.push_back(payload.clone());
            }
        }

        if let Some(mut subscribers) = self.subscribers.get_mut(&key) {
            subscribers.retain(|tx| tx.send(payload.clone()).is_ok());
        }
        self.everything
            .lock()
            .retain(|tx| tx.send(payload.clone()).is_ok());
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(reader) = self.link.get_mut().reader.take() {
            reader.abort();
        }
    }
}

/// Controller-side connection to a Switchboard server.
///
/// Cloning gives another handle to the same session.
#[derive(Clone)]
pub struct ClientSession {
    inner: Arc<Inner>,
    store: Option<Arc<dyn KeyValueStore>>,
    discovery: Option<Arc<dyn ServiceDiscovery>>,
}

impl ClientSession {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                link: Mutex::new(Link {
                    state: ConnectionState::Disconnected,
                    generation: 0,
                    queue: VecDeque::new(),
                    writer: None,
                    reader: None,
                    target: None,
                    last_error: None,
                }),
                state,
                inbound,
                inbound_rx: Mutex::new(Some(inbound_rx)),
                history: DashMap::new(),
                pending: DashMap::new(),
                subscribers: DashMap::new(),
                everything: Mutex::new(Vec::new()),
            }),
            store: None,
            discovery: None,
        }
    }

    /// Remember the last service in `store`
    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Resolve service names through `discovery`
    pub fn with_discovery(mut self, discovery: Arc<dyn ServiceDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Follow connection state changes
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Why the last connection ended or failed to open
    pub fn last_error(&self) -> Option<String> {
        self.inner.link.lock().last_error.clone()
    }

    pub fn target(&self) -> Option<Target> {
        self.inner.link.lock().target.clone()
    }

    /// Payloads waiting for a connection
    pub fn queued(&self) -> usize {
        self.inner.link.lock().queue.len()
    }

    /// Connect to `host:port`
    pub async fn connect(&self, addr: &str) -> ClientResult<()> {
        self.inner.link.lock().target = Some(Target::Address(addr.to_string()));
        self.open(addr).await
    }

    /// Resolve `name` through discovery, connect, and remember it as the last service
    pub async fn connect_service(&self, name: &str) -> ClientResult<()> {
        let discovery = self
            .discovery
            .as_ref()
            .ok_or_else(|| ClientError::Discovery("no service discovery configured".into()))?;
        let service = match discovery.resolve(name).await {
            Ok(service) => service,
            Err(TransportError::Discovery(_)) => {
                return Err(ClientError::UnknownService(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        info!(service = %service, "Resolved service");

        self.inner.link.lock().target = Some(Target::Service(name.to_string()));
        if let Some(store) = &self.store {
            store.set(LAST_SERVICE_KEY, name).await?;
        }
        self.open(&service.address()).await
    }

    /// Connect again to the current target
    pub async fn reconnect(&self) -> ClientResult<()> {
        let target = self.target().ok_or(ClientError::NoTarget)?;
        match target {
            Target::Address(addr) => self.open(&addr).await,
            Target::Service(name) => self.connect_service(&name).await,
        }
    }

    /// Connect to the service remembered in the store
    pub async fn connect_last(&self) -> ClientResult<()> {
        let store = self.store.as_ref().ok_or(ClientError::NoTarget)?;
        let name = store.get(LAST_SERVICE_KEY).await?.ok_or(ClientError::NoTarget)?;
        self.connect_service(&name).await
    }

    /// Close the connection. Queued payloads stay queued.
    pub fn disconnect(&self) {
        let mut link = self.inner.link.lock();
        if link.state != ConnectionState::Disconnected {
            info!("Disconnecting");
        }
        self.inner.drop_link(&mut link);
        link.last_error = None;
        self.inner.set_state(&mut link, ConnectionState::Disconnected);
    }

    /// Disconnect and discard the queue, pending arguments, history and the
    /// remembered target.
    pub async fn forget(&self) -> ClientResult<()> {
        {
            let mut link = self.inner.link.lock();
            self.inner.drop_link(&mut link);
            let dropped = link.queue.len();
            link.queue.clear();
            link.target = None;
            link.last_error = None;
            self.inner.set_state(&mut link, ConnectionState::Disconnected);
            info!(dropped, "Session forgotten");
        }
        self.inner.pending.clear();
        self.inner.history.clear();
        if let Some(store) = &self.store {
            store.delete(LAST_SERVICE_KEY).await?;
        }
        Ok(())
    }

    /// Send now when connected, otherwise queue for the next connection
    pub fn send(&self, payload: Payload) -> Delivery {
        let mut link = self.inner.link.lock();
        if link.state == ConnectionState::Connected {
            if let Some(writer) = link.writer.clone() {
                if let Err(mpsc::error::SendError(payload)) = writer.send(payload) {
                    link.queue.push_back(payload);
                    return Delivery::Queued;
                }
                return Delivery::Sent;
            }
        }
        debug!(action = %payload.effective_action(), "Queued while {}", link.state);
        link.queue.push_back(payload);
        Delivery::Queued
    }

    /// Send a bare action
    pub fn request(&self, action: &str) -> Delivery {
        self.send(Payload::request(action))
    }

    /// Answer the pending `CommandInfo` of `key` with `values`.
    /// Returns `None` when nothing is pending for that key.
    pub fn answer_command_info(&self, key: &str, values: &[(&str, &str)]) -> Option<Delivery> {
        let schema = self.take_command_info(key)?;
        Some(self.send(fill_command_info(&schema, values)))
    }

    /// Payloads received from protocol `key`
    pub fn subscribe(&self, key: &str) -> mpsc::UnboundedReceiver<Payload> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.entry(key.to_string()).or_default().push(tx);
        rx
    }

    /// Every payload received, in arrival order
    pub fn subscribe_all(&self) -> mpsc::UnboundedReceiver<Payload> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.everything.lock().push(tx);
        rx
    }

    pub fn history(&self, key: &str) -> Vec<Payload> {
        self.inner
            .history
            .get(key)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn latest(&self, key: &str) -> Option<Payload> {
        self.inner.history.get(key).and_then(|h| h.back().cloned())
    }

    pub fn clear_history(&self, key: &str) {
        self.inner.history.remove(key);
    }

    /// Schema of the argument challenge waiting for `key`
    pub fn command_info(&self, key: &str) -> Option<ArgSchema> {
        self.inner.pending.get(key).map(|s| s.value().clone())
    }

    pub fn take_command_info(&self, key: &str) -> Option<ArgSchema> {
        self.inner.pending.remove(key).map(|(_, schema)| schema)
    }

    async fn open(&self, addr: &str) -> ClientResult<()> {
        let attempt = {
            let mut link = self.inner.link.lock();
            self.inner.drop_link(&mut link);
            self.inner.set_state(&mut link, ConnectionState::Connecting);
            link.generation
        };
        info!(addr, "Connecting");

        let connected = TcpStream::connect(addr).await;

        // disconnect/forget or a newer connect may have run meanwhile
        let superseded = |link: &Link| link.generation != attempt || link.state != ConnectionState::Connecting;

        let stream = match connected {
            Ok(stream) => stream,
            Err(e) => {
                let mut link = self.inner.link.lock();
                if !superseded(&link) {
                    link.last_error = Some(format!("could not connect to {}: {}", addr, e));
                    self.inner.set_state(&mut link, ConnectionState::Disconnected);
                }
                warn!(addr, error = %e, "Connect failed");
                return Err(e.into());
            }
        };
        self.start_dispatcher();

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let weak = Arc::downgrade(&self.inner);

        let mut link = self.inner.link.lock();
        if superseded(&link) {
            debug!(addr, "Connect attempt abandoned");
            return Err(ClientError::NotConnected);
        }
        link.generation += 1;
        let generation = link.generation;
        tokio::spawn(write_loop(weak.clone(), generation, write_half, rx));
        link.reader = Some(tokio::spawn(read_loop(
            weak,
            generation,
            self.inner.inbound.clone(),
            read_half,
        )));

        // Flush in FIFO order before anything sent from now on
        let flushed = link.queue.len();
        for payload in link.queue.drain(..) {
            let _ = tx.send(payload);
        }
        link.writer = Some(tx);
        link.last_error = None;
        self.inner.set_state(&mut link, ConnectionState::Connected);
        info!(addr, flushed, "Connected");
        Ok(())
    }

    /// Start the task that records and fans out received payloads
    fn start_dispatcher(&self) {
        let Some(mut rx) = self.inner.inbound_rx.lock().take() else {
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.dispatch(payload);
            }
        });
    }
}

impl Default for ClientSession {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("state", &self.state())
            .field("target", &self.target())
            .field("queued", &self.queued())
            .finish()
    }
}

async fn write_loop(
    inner: Weak<Inner>,
    generation: u64,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Payload>,
) {
    while let Some(payload) = rx.recv().await {
        if let Err(e) = writer.write_all(&encode_line(&payload)).await {
            if let Some(inner) = inner.upgrade() {
                inner.connection_lost(generation, format!("write failed: {}", e));
            }
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(
    inner: Weak<Inner>,
    generation: u64,
    inbound: mpsc::UnboundedSender<Payload>,
    mut reader: OwnedReadHalf,
) {
    let mut parser = Parser::new();
    let mut buf = vec![0u8; 4096];

    let reason = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break "server closed the connection".to_string(),
            Ok(n) => {
                if let Err(e) = parser.feed(&buf[..n]) {
                    warn!(error = %e, "Dropped oversized payload from server");
                }
                while let Some(payload) = parser.next_payload() {
                    if inbound.send(payload).is_err() {
                        return;
                    }
                }
            }
            Err(e) => break format!("read failed: {}", e),
        }
    };

    if let Some(inner) = inner.upgrade() {
        inner.connection_lost(generation, reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use swb_core::ROUTER_KEY;
    use swb_devices::{default_registry, DeviceConfig, Hardware, KNOCK_KNOCK_KEY, RF_SWITCH_KEY};
    use swb_storage::MemoryStore;
    use swb_transport::{ConnectionServer, LocalDiscovery, ServerConfig};

    async fn start_server() -> Arc<ConnectionServer> {
        let registry = Arc::new(default_registry(&DeviceConfig::default(), &Hardware::unavailable()));
        let config = ServerConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            ..ServerConfig::default()
        };
        let server = Arc::new(ConnectionServer::bind(config, registry).await.unwrap());
        let runner = server.clone();
        tokio::spawn(async move { runner.run().await });
        server
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Payload>) -> Payload {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for a payload")
            .unwrap()
    }

    async fn wait_for_state(session: &ClientSession, state: ConnectionState) {
        let mut rx = session.watch_state();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == state))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_queue_flushed_in_order_on_connect() {
        let server = start_server().await;
        let session = ClientSession::new();
        let mut all = session.subscribe_all();

        assert_eq!(session.send(Payload::ping()), Delivery::Queued);
        assert_eq!(session.request("KnockKnock"), Delivery::Queued);
        assert_eq!(session.queued(), 2);

        session.connect(&server.local_addr().to_string()).await.unwrap();
        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(session.queued(), 0);

        let menu = next(&mut all).await;
        assert_eq!(menu.key(), ROUTER_KEY);
        assert_eq!(menu.commands(), ["KnockKnock", "RfSwitch", "ZigBee", "Reset"]);

        let banner = next(&mut all).await;
        assert_eq!(banner.key(), KNOCK_KNOCK_KEY);
        assert!(banner.response().unwrap().starts_with("Chose Protocol: KnockKnockProtocol"));

        // Flushed exactly once: nothing else arrives
        assert_eq!(session.request("Start"), Delivery::Sent);
        assert_eq!(next(&mut all).await.response(), Some("Knock! Knock!"));
        assert_eq!(session.history(KNOCK_KNOCK_KEY).len(), 2);
        assert_eq!(session.history(ROUTER_KEY).len(), 1);
    }

    #[tokio::test]
    async fn test_command_info_stashed_instead_of_history() {
        let server = start_server().await;
        let session = ClientSession::new();
        let mut rf = session.subscribe(RF_SWITCH_KEY);
        session.connect(&server.local_addr().to_string()).await.unwrap();

        session.request("RfSwitch");
        next(&mut rf).await;
        session.request("AddSwitch");
        let challenge = next(&mut rf).await;
        assert!(challenge.is_command_info());

        let schema = session.command_info(RF_SWITCH_KEY).unwrap();
        assert_eq!(schema.command, "AddSwitch");
        assert!(session
            .history(RF_SWITCH_KEY)
            .iter()
            .all(|p| !p.is_command_info()));

        let delivery = session.answer_command_info(
            RF_SWITCH_KEY,
            &[("name", "porch"), ("on_code", "10"), ("off_code", "11")],
        );
        assert_eq!(delivery, Some(Delivery::Sent));
        assert!(session.command_info(RF_SWITCH_KEY).is_none());

        let added = next(&mut rf).await;
        assert_eq!(added.response(), Some("Added switch porch"));
        assert_eq!(session.latest(RF_SWITCH_KEY), Some(added));
    }

    #[tokio::test]
    async fn test_server_close_surfaces_disconnected() {
        let server = start_server().await;
        let session = ClientSession::new();
        let mut knock = session.subscribe(KNOCK_KNOCK_KEY);
        session.connect(&server.local_addr().to_string()).await.unwrap();

        for action in ["KnockKnock", "Start", "Who's there?", "Turnip who?", "n"] {
            session.request(action);
            next(&mut knock).await;
        }
        wait_for_state(&session, ConnectionState::Disconnected).await;
        assert!(session.last_error().unwrap().contains("closed"));

        // No automatic reconnect; sends queue until asked
        assert_eq!(session.request("Ping"), Delivery::Queued);
        session.reconnect().await.unwrap();
        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(session.queued(), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_reports_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let session = ClientSession::new();
        session.request("Ping");
        assert!(matches!(session.connect(&addr).await, Err(ClientError::Io(_))));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(session.last_error().is_some());
        assert_eq!(session.queued(), 1);
    }

    /// Start `connect` in the background and return once it is in flight
    async fn connect_in_background(
        session: &ClientSession,
        addr: String,
    ) -> JoinHandle<ClientResult<()>> {
        let mut states = session.watch_state();
        let connecting = {
            let session = session.clone();
            tokio::spawn(async move { session.connect(&addr).await })
        };
        tokio::time::timeout(
            Duration::from_secs(2),
            states.wait_for(|s| *s == ConnectionState::Connecting),
        )
        .await
        .unwrap()
        .unwrap();
        connecting
    }

    #[tokio::test]
    async fn test_forget_while_connecting_is_final() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let session = ClientSession::new();
        session.request("Ping");
        let connecting = connect_in_background(&session, addr).await;

        session.forget().await.unwrap();
        let result = connecting.await.unwrap();

        assert!(matches!(result, Err(ClientError::NotConnected)));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(session.target(), None);
        assert_eq!(session.queued(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_while_connecting_stays_disconnected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let session = ClientSession::new();
        session.request("Ping");
        let connecting = connect_in_background(&session, addr.clone()).await;

        session.disconnect();
        assert!(matches!(connecting.await.unwrap(), Err(ClientError::NotConnected)));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        // The queue waits for the next explicit connect
        assert_eq!(session.queued(), 1);
        assert_eq!(session.target(), Some(Target::Address(addr)));
    }

    #[tokio::test]
    async fn test_service_is_remembered_and_forgotten() {
        let server = start_server().await;
        let discovery = Arc::new(LocalDiscovery::default());
        discovery
            .advertise("kitchen", server.local_addr().port())
            .await
            .unwrap();
        let store = Arc::new(MemoryStore::new());

        let session = ClientSession::new()
            .with_store(store.clone())
            .with_discovery(discovery.clone());
        assert!(matches!(
            session.connect_service("garage").await,
            Err(ClientError::UnknownService(_))
        ));

        session.connect_service("kitchen").await.unwrap();
        assert_eq!(session.target(), Some(Target::Service("kitchen".into())));
        assert_eq!(store.get(LAST_SERVICE_KEY).await.unwrap().as_deref(), Some("kitchen"));
        session.disconnect();

        // A fresh session picks up where the last one left off
        let later = ClientSession::new()
            .with_store(store.clone())
            .with_discovery(discovery);
        later.connect_last().await.unwrap();
        assert_eq!(later.state(), ConnectionState::Connected);

        later.request("Ping");
        later.forget().await.unwrap();
        assert_eq!(later.state(), ConnectionState::Disconnected);
        assert_eq!(later.target(), None);
        assert_eq!(store.get(LAST_SERVICE_KEY).await.unwrap(), None);
        assert!(matches!(later.connect_last().await, Err(ClientError::NoTarget)));
        assert!(matches!(later.reconnect().await, Err(ClientError::NoTarget)));
    }
}
