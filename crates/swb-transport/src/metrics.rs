//! Prometheus metrics for Switchboard
//!
//! Exposed in Prometheus text format over a minimal HTTP endpoint.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::TransportResult;

/// Switchboard metrics collector
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    // Connection metrics
    pub connections_total: IntCounter,
    pub connections_active: IntGauge,

    // Payload metrics
    pub payloads_total: IntCounterVec,
    pub payload_duration_seconds: HistogramVec,
    pub protocol_selections: IntCounterVec,
    pub oversized_frames: IntCounter,

    // Asynchronous output
    pub async_payloads_flushed: IntCounter,

    // Data metrics
    pub bytes_received: IntCounter,
    pub bytes_sent: IntCounter,
}

impl Metrics {
    /// Create a collector with every metric registered
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let connections_total =
            IntCounter::new("swb_connections_total", "Total number of connections")?;
        let connections_active =
            IntGauge::new("swb_connections_active", "Number of active connections")?;

        let payloads_total = IntCounterVec::new(
            Opts::new("swb_payloads_total", "Total number of request payloads processed, by request action"),
            &["action"],
        )?;
        let payload_duration_seconds = HistogramVec::new(
            HistogramOpts::new("swb_payload_duration_seconds", "Payload processing duration")
                .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
            &["action"],
        )?;
        let protocol_selections = IntCounterVec::new(
            Opts::new("swb_protocol_selections_total", "Protocols chosen by connections"),
            &["protocol"],
        )?;
        let oversized_frames = IntCounter::new(
            "swb_oversized_frames_total",
            "Lines dropped for exceeding the size limit",
        )?;

        let async_payloads_flushed = IntCounter::new(
            "swb_async_payloads_flushed_total",
            "Hardware results and events written after coalescing",
        )?;

        let bytes_received =
            IntCounter::new("swb_bytes_received_total", "Total bytes received from clients")?;
        let bytes_sent = IntCounter::new("swb_bytes_sent_total", "Total bytes sent to clients")?;

        registry.register(Box::new(connections_total.clone()))?;
        registry.register(Box::new(connections_active.clone()))?;
        registry.register(Box::new(payloads_total.clone()))?;
        registry.register(Box::new(payload_duration_seconds.clone()))?;
        registry.register(Box::new(protocol_selections.clone()))?;
        registry.register(Box::new(oversized_frames.clone()))?;
        registry.register(Box::new(async_payloads_flushed.clone()))?;
        registry.register(Box::new(bytes_received.clone()))?;
        registry.register(Box::new(bytes_sent.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            payloads_total,
            payload_duration_seconds,
            protocol_selections,
            oversized_frames,
            async_payloads_flushed,
            bytes_received,
            bytes_sent,
        })
    }

    /// Record a new connection
    pub fn record_connection(&self) {
        self.connections_total.inc();
        self.connections_active.inc();
    }

    /// Record a connection closed
    pub fn record_disconnection(&self) {
        self.connections_active.dec();
    }

    /// Record one processed request under its action
    pub fn record_payload(&self, action: &str, duration_secs: f64) {
        self.payloads_total.with_label_values(&[action]).inc();
        self.payload_duration_seconds
            .with_label_values(&[action])
            .observe(duration_secs);
    }

    pub fn record_selection(&self, protocol: &str) {
        self.protocol_selections.with_label_values(&[protocol]).inc();
    }

    /// Record bytes transferred
    pub fn record_bytes(&self, received: u64, sent: u64) {
        self.bytes_received.inc_by(received);
        self.bytes_sent.inc_by(sent);
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            error!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

/// HTTP server for the metrics endpoint
pub struct MetricsServer {
    metrics: Arc<Metrics>,
    addr: SocketAddr,
}

impl MetricsServer {
    pub fn new(metrics: Arc<Metrics>, addr: SocketAddr) -> Self {
        Self { metrics, addr }
    }

    /// Run the metrics HTTP server
    pub async fn run(&self) -> TransportResult<()> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Metrics server listening on http://{}/metrics", self.addr);

        loop {
            match listener.accept().await {
                Ok((mut stream, _)) => {
                    let metrics = self.metrics.clone();

                    tokio::spawn(async move {
                        let mut buf = [0u8; 1024];
                        if let Ok(n) = stream.read(&mut buf).await {
                            if n > 0 {
                                let request = String::from_utf8_lossy(&buf[..n]);
                                let response = http_response(&request, &metrics);
                                let _ = stream.write_all(response.as_bytes()).await;
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept metrics connection");
                }
            }
        }
    }
}

fn http_response(request: &str, metrics: &Metrics) -> String {
    if request.starts_with("GET /metrics") || request.starts_with("GET / ") {
        let body = metrics.export();
        format!(
            "HTTP/1.1 200 OK\r\n\
             Content-Type: text/plain; version=0.0.4; charset=utf-8\r\n\
             Content-Length: {}\r\n\
             \r\n\
             {}",
            body.len(),
            body
        )
    } else if request.starts_with("GET /health") {
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: 2\r\n\
         \r\n\
         OK"
            .to_string()
    } else {
        "HTTP/1.1 404 Not Found\r\n\
         Content-Length: 0\r\n\
         \r\n"
            .to_string()
    }
}
