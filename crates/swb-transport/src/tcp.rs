//! TCP connection server
//!
//! One task per accepted connection, each owning its own [`Router`]. Replies
//! to requests are written as soon as they are produced; payloads protocols
//! emit later (hardware results, device events) are held for a short delay
//! and written together.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use parking_lot::Mutex;
use swb_core::{Payload, ProtocolContext, ProtocolRegistry, Router};
use swb_protocol::{encode_line, Parser, MAX_LINE_SIZE};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::discovery::ServiceDiscovery;
use crate::error::{TransportError, TransportResult};
use crate::handler::ConnectionHandler;
#[cfg(feature = "metrics")]
use crate::metrics::Metrics;

/// Default delay for coalescing asynchronous output
pub const DEFAULT_FLUSH_DELAY: Duration = Duration::from_millis(100);

/// Connection server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Name advertised through service discovery
    pub service_name: String,
    /// How long asynchronous payloads are held before being written
    pub flush_delay: Duration,
    /// Longest accepted line
    pub max_line: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 6390)),
            service_name: "switchboard".to_string(),
            flush_delay: DEFAULT_FLUSH_DELAY,
            max_line: MAX_LINE_SIZE,
        }
    }
}

/// Snapshot of one live connection
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: String,
    pub peer: SocketAddr,
    /// Key of the selected protocol, if any
    pub protocol: Option<String>,
    pub connected_at: SystemTime,
}

struct LiveConnection {
    info: ConnectionInfo,
    close: Arc<Notify>,
}

type ConnectionMap = Arc<DashMap<String, LiveConnection>>;

/// State shared by the accept loop and every connection task
struct Shared {
    registry: Arc<ProtocolRegistry>,
    config: ServerConfig,
    connections: ConnectionMap,
    /// Signalled whenever a connection leaves the registry
    drained: Notify,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<Metrics>>,
}

/// TCP server for Switchboard
pub struct ConnectionServer {
    shared: Arc<Shared>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    discovery: Option<Arc<dyn ServiceDiscovery>>,
    shutdown: watch::Sender<bool>,
}

impl ConnectionServer {
    /// Bind the listening socket. Connections are accepted once [`run`](Self::run) starts.
    pub async fn bind(config: ServerConfig, registry: Arc<ProtocolRegistry>) -> TransportResult<Self> {
        let listener = TcpListener::bind(config.bind).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            shared: Arc::new(Shared {
                registry,
                config,
                connections: Arc::new(DashMap::new()),
                drained: Notify::new(),
                #[cfg(feature = "metrics")]
                metrics: None,
            }),
            listener: Mutex::new(Some(listener)),
            local_addr,
            discovery: None,
            shutdown,
        })
    }

    /// Advertise the server while it runs
    pub fn with_discovery(mut self, discovery: Arc<dyn ServiceDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Record Prometheus metrics. Must be called before `run`.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.metrics = Some(metrics);
        }
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }

    /// Snapshot of every live connection
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.shared
            .connections
            .iter()
            .map(|entry| entry.value().info.clone())
            .collect()
    }

    /// Stop accepting, close every connection, then withdraw the advertisement.
    /// `run` returns once teardown is complete.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Accept connections until [`shutdown`](Self::shutdown)
    pub async fn run(&self) -> TransportResult<()> {
        let listener = self.listener.lock().take().ok_or(TransportError::AlreadyRunning)?;
        let mut shutdown = self.shutdown.subscribe();
        info!(addr = %self.local_addr, service = %self.shared.config.service_name, "Switchboard server listening");

        if let Some(discovery) = &self.discovery {
            discovery
                .advertise(&self.shared.config.service_name, self.local_addr.port())
                .await?;
        }

        while !*shutdown.borrow() {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_connection(stream, peer),
                    Err(e) => error!(error = %e, "Failed to accept connection"),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        drop(listener);
        info!(connections = self.connection_count(), "Shutting down");
        self.close_all().await;

        if let Some(discovery) = &self.discovery {
            discovery.withdraw(&self.shared.config.service_name).await?;
        }
        info!("Server stopped");
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let id = Uuid::new_v4().to_string();
        let close = Arc::new(Notify::new());
        self.shared.connections.insert(
            id.clone(),
            LiveConnection {
                info: ConnectionInfo {
                    id: id.clone(),
                    peer,
                    protocol: None,
                    connected_at: SystemTime::now(),
                },
                close: close.clone(),
            },
        );
        self.shared.record_connection();

        let shared = self.shared.clone();
        tokio::spawn(async move {
            info!(conn = %id, peer = %peer, "Client connected");
            match handle_connection(stream, &id, &shared, close).await {
                Ok(reason) => info!(conn = %id, reason, "Client disconnected"),
                Err(e) => warn!(conn = %id, error = %e, "Connection closed with error"),
            }
            shared.connections.remove(&id);
            shared.record_disconnection();
            shared.drained.notify_waiters();
        });
    }

    /// Ask every connection to close and wait until the registry is empty
    async fn close_all(&self) {
        for entry in self.shared.connections.iter() {
            entry.value().close.notify_one();
        }
        loop {
            let drained = self.shared.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            if self.shared.connections.is_empty() {
                return;
            }
            drained.await;
        }
    }
}

/// Read, dispatch and write until the connection ends; returns why it ended
async fn handle_connection(
    mut stream: TcpStream,
    id: &str,
    shared: &Shared,
    close: Arc<Notify>,
) -> std::io::Result<&'static str> {
    let (context, mut outbox) = ProtocolContext::channel(id);
    let router = Router::new(shared.registry.clone(), context);
    let mut handler =
        ConnectionHandler::with_parser(id, router, Parser::with_max_line(shared.config.max_line));

    let result = connection_loop(&mut stream, &mut handler, &mut outbox, shared, &close).await;

    handler.cleanup();
    let _ = stream.shutdown().await;
    result
}

async fn connection_loop(
    stream: &mut TcpStream,
    handler: &mut ConnectionHandler,
    outbox: &mut mpsc::UnboundedReceiver<Payload>,
    shared: &Shared,
    close: &Notify,
) -> std::io::Result<&'static str> {
    let mut buf = vec![0u8; 4096];
    let mut pending: Vec<Payload> = Vec::new();
    let mut flush_at: Option<Instant> = None;

    loop {
        let deadline = flush_at.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            result = stream.read(&mut buf) => {
                let n = result?;
                if n == 0 {
                    return Ok("peer closed");
                }
                let before = handler.active_protocol().map(str::to_string);
                let responses = handler.process(&buf[..n]);
                shared.record_requests(handler.take_handled(), &responses, n);
                shared.record_dropped(handler.take_dropped_frames());

                let after = handler.active_protocol().map(str::to_string);
                if after != before {
                    if let Some(mut live) = shared.connections.get_mut(handler.connection_id.as_str()) {
                        live.info.protocol = after.clone();
                    }
                    if let Some(protocol) = &after {
                        shared.record_selection(protocol);
                    }
                }

                for response in &responses {
                    stream.write_all(&encode_line(response)).await?;
                }
                if handler.is_finished() {
                    return Ok("terminal response");
                }
            }

            Some(payload) = outbox.recv() => {
                pending.push(payload);
                if flush_at.is_none() {
                    flush_at = Some(Instant::now() + shared.config.flush_delay);
                }
            }

            _ = sleep_until(deadline), if flush_at.is_some() => {
                flush_at = None;
                // Pick up anything queued while the timer ran
                while let Ok(payload) = outbox.try_recv() {
                    pending.push(payload);
                }
                let count = pending.len();
                debug!(conn = %handler.connection_id, count, "Flushing asynchronous payloads");
                let mut out = Vec::new();
                for payload in pending.drain(..) {
                    out.extend(encode_line(&handler.annotate(payload)));
                }
                stream.write_all(&out).await?;
                shared.record_flush(count, out.len());
            }

            _ = close.notified() => {
                return Ok("server shutdown");
            }
        }
    }
}

#[cfg(feature = "metrics")]
impl Shared {
    fn record_connection(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.record_connection();
        }
    }

    fn record_disconnection(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.record_disconnection();
        }
    }

    fn record_selection(&self, protocol: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_selection(protocol);
        }
    }

    fn record_requests(&self, handled: Vec<(String, Duration)>, responses: &[Payload], received: usize) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        for (action, elapsed) in handled {
            metrics.record_payload(&action, elapsed.as_secs_f64());
        }
        let sent: usize = responses.iter().map(|r| encode_line(r).len()).sum();
        metrics.record_bytes(received as u64, sent as u64);
    }

    fn record_dropped(&self, frames: u64) {
        if let Some(metrics) = &self.metrics {
            metrics.oversized_frames.inc_by(frames);
        }
    }

    fn record_flush(&self, count: usize, bytes: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.async_payloads_flushed.inc_by(count as u64);
            metrics.record_bytes(0, bytes as u64);
        }
    }
}

#[cfg(not(feature = "metrics"))]
impl Shared {
    fn record_connection(&self) {}
    fn record_disconnection(&self) {}
    fn record_selection(&self, _protocol: &str) {}
    fn record_requests(&self, _handled: Vec<(String, Duration)>, _responses: &[Payload], _received: usize) {}
    fn record_dropped(&self, _frames: u64) {}
    fn record_flush(&self, _count: usize, _bytes: usize) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::LocalDiscovery;
    use swb_core::{ArgSchema, COMMAND_INFO};
    use swb_core::Transport;
    use swb_devices::{default_registry, DeviceConfig, Hardware, RfRadio, SimulatedRadio, SwitchConfig};
    use swb_protocol::decode;
    use tokio::io::{AsyncBufReadExt, BufReader, Lines};
    use tokio::net::tcp::OwnedReadHalf;
    use tokio::net::tcp::OwnedWriteHalf;

    struct TestClient {
        lines: Lines<BufReader<OwnedReadHalf>>,
        writer: OwnedWriteHalf,
    }

    impl TestClient {
        async fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (reader, writer) = stream.into_split();
            Self {
                lines: BufReader::new(reader).lines(),
                writer,
            }
        }

        async fn send_raw(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
        }

        async fn send(&mut self, payload: &Payload) {
            self.writer.write_all(&encode_line(payload)).await.unwrap();
        }

        async fn recv(&mut self) -> Option<Payload> {
            tokio::time::timeout(Duration::from_secs(2), self.lines.next_line())
                .await
                .expect("timed out waiting for a line")
                .unwrap()
                .map(|line| decode(&line))
        }

        async fn request(&mut self, payload: Payload) -> Payload {
            self.send(&payload).await;
            self.recv().await.unwrap()
        }
    }

    fn config() -> ServerConfig {
        ServerConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            flush_delay: Duration::from_millis(20),
            ..ServerConfig::default()
        }
    }

    fn devices() -> DeviceConfig {
        let mut devices = DeviceConfig::default();
        devices.rf.switches = vec![SwitchConfig::new("lamp", 1361, 1364)];
        devices
    }

    async fn start(hardware: Hardware) -> Arc<ConnectionServer> {
        let registry = Arc::new(default_registry(&devices(), &hardware));
        let server = Arc::new(ConnectionServer::bind(config(), registry).await.unwrap());
        let runner = server.clone();
        tokio::spawn(async move { runner.run().await });
        server
    }

    #[tokio::test]
    async fn test_ping_then_knock_knock() {
        let server = start(Hardware::unavailable()).await;
        let mut client = TestClient::connect(server.local_addr()).await;

        let menu = client.request(Payload::ping()).await;
        assert_eq!(menu.commands(), ["KnockKnock", "RfSwitch", "ZigBee", "Reset"]);

        let chosen = client.request(Payload::request("KnockKnock")).await;
        assert_eq!(chosen.key(), "KnockKnockProtocol");
        assert!(chosen
            .response()
            .unwrap()
            .starts_with("Chose Protocol: KnockKnockProtocol\n"));
        assert_eq!(chosen.commands(), ["Start", "ResetCurrent", "Reset"]);
    }

    #[tokio::test]
    async fn test_garbage_line_is_ping() {
        let server = start(Hardware::unavailable()).await;
        let mut client = TestClient::connect(server.local_addr()).await;

        client.send_raw("???").await;
        let reply = client.recv().await.unwrap();
        assert_eq!(reply.commands(), ["KnockKnock", "RfSwitch", "ZigBee", "Reset"]);

        // Still open
        let reply = client.request(Payload::ping()).await;
        assert_eq!(reply.key(), swb_core::ROUTER_KEY);
    }

    #[tokio::test]
    async fn test_bye_closes_connection() {
        let server = start(Hardware::unavailable()).await;
        let mut client = TestClient::connect(server.local_addr()).await;

        for action in ["KnockKnock", "Start", "Who's there?", "Turnip who?"] {
            client.request(Payload::request(action)).await;
        }
        let bye = client.request(Payload::request("n")).await;
        assert!(bye.is_terminal());
        assert!(client.recv().await.is_none());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_connections_are_isolated() {
        let server = start(Hardware::unavailable()).await;
        let mut a = TestClient::connect(server.local_addr()).await;
        let mut b = TestClient::connect(server.local_addr()).await;

        a.request(Payload::request("ZigBee")).await;
        b.request(Payload::request("RfSwitch")).await;

        for _ in 0..3 {
            let reply = a.request(Payload::ping()).await;
            assert_eq!(reply.key(), "ZigBeeProtocol");
            assert!(!reply.response().unwrap().contains("RfSwitch"));
            let reply = b.request(Payload::ping()).await;
            assert_eq!(reply.key(), "RfSwitchProtocol");
        }

        let mut protocols: Vec<_> = server
            .connections()
            .into_iter()
            .filter_map(|c| c.protocol)
            .collect();
        protocols.sort();
        assert_eq!(protocols, ["RfSwitchProtocol", "ZigBeeProtocol"]);
    }

    #[tokio::test]
    async fn test_hardware_result_arrives_after_ack() {
        let radio = SimulatedRadio::new();
        let sent = radio.sent();
        let hardware = Hardware::new(
            Transport::spawn("rf", Box::new(radio) as Box<dyn RfRadio>),
            Transport::unavailable("zigbee"),
        );
        let server = start(hardware).await;
        let mut client = TestClient::connect(server.local_addr()).await;

        client.request(Payload::request("RfSwitch")).await;
        let challenge = client.request(Payload::request("SwitchOn")).await;
        assert_eq!(challenge.action(), Some(COMMAND_INFO));

        let schema = ArgSchema::from_json(challenge.data().unwrap()).unwrap();
        let ack = client
            .request(Payload::request("SwitchOn").with_data(schema.to_json().unwrap()))
            .await;
        assert!(ack.response().unwrap().starts_with("Executing SwitchOn lamp"));

        let result = client.recv().await.unwrap();
        assert_eq!(result.response(), Some("lamp is on"));
        assert_eq!(result.commands().last().map(String::as_str), Some("Reset"));
        assert!(result.offers("ResetCurrent"));
        assert_eq!(*sent.lock(), vec![1361]);
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections_and_withdraws() {
        let discovery = Arc::new(LocalDiscovery::default());
        let registry = Arc::new(default_registry(&devices(), &Hardware::unavailable()));
        let server = Arc::new(
            ConnectionServer::bind(config(), registry)
                .await
                .unwrap()
                .with_discovery(discovery.clone()),
        );
        let runner = server.clone();
        let task = tokio::spawn(async move { runner.run().await });

        let mut client = TestClient::connect(server.local_addr()).await;
        client.request(Payload::ping()).await;
        assert_eq!(server.connection_count(), 1);
        assert!(discovery.resolve("switchboard").await.is_ok());

        server.shutdown();
        assert!(client.recv().await.is_none());
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(server.connection_count(), 0);
        assert!(discovery.resolve("switchboard").await.is_err());

        // A stopped server cannot be restarted
        assert!(matches!(server.run().await, Err(TransportError::AlreadyRunning)));
    }
}
