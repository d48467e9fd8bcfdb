//! Switchboard Daemon (swbd)
//!
//! Serves the payload protocol to controllers over TCP, with simulated RF and
//! ZigBee hardware behind the device protocols.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (0.0.0.0:6390, advertised as "switchboard")
//! swbd
//!
//! # Custom port and service name
//! swbd --port 7000 --service-name kitchen
//!
//! # With configuration file
//! swbd --config /etc/switchboard/swbd.toml
//!
//! # With Prometheus metrics on :9390
//! swbd --metrics-port 9390
//!
//! # Advertise in a shared discovery directory
//! swbd --discovery-dir /run/switchboard/services
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use swb_devices::{default_registry, DeviceConfig, Hardware, RfConfig, ZigbeeConfig};
use swb_transport::{ConnectionServer, FileDiscovery, Metrics, MetricsServer, ServerConfig};

const DEFAULT_BIND: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 6390;

/// Switchboard Daemon - device control over a line protocol
#[derive(Parser, Debug)]
#[command(name = "swbd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP port to listen on
    #[arg(long, env = "SWB_PORT")]
    port: Option<u16>,

    /// Bind address
    #[arg(long, env = "SWB_BIND")]
    bind: Option<String>,

    /// Name to advertise the service under
    #[arg(long, env = "SWB_SERVICE_NAME")]
    service_name: Option<String>,

    /// Directory of service files controllers resolve names through
    #[arg(long, env = "SWB_DISCOVERY_DIR")]
    discovery_dir: Option<PathBuf>,

    /// Configuration file path
    #[arg(short, long, env = "SWB_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, env = "SWB_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Serve Prometheus metrics on this port
    #[arg(long, env = "SWB_METRICS_PORT")]
    metrics_port: Option<u16>,

    /// Disable the RF switch domain
    #[arg(long)]
    no_rf: bool,

    /// Disable the ZigBee domain
    #[arg(long)]
    no_zigbee: bool,
}

/// Contents of the TOML configuration file
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    server: ServerSection,
    rf: RfConfig,
    zigbee: ZigbeeConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ServerSection {
    bind: Option<String>,
    port: Option<u16>,
    service_name: Option<String>,
    discovery_dir: Option<PathBuf>,
    flush_delay_ms: Option<u64>,
    metrics_port: Option<u16>,
}

/// Effective settings after merging arguments, file and defaults
#[derive(Debug)]
struct Settings {
    server: ServerConfig,
    devices: DeviceConfig,
    metrics: Option<SocketAddr>,
    discovery_dir: PathBuf,
}

fn load_file(path: &Path) -> Result<FileConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("Invalid config file {}", path.display()))
}

/// Command-line values win over file values, which win over defaults
fn resolve(args: &Args, file: FileConfig) -> Result<Settings> {
    let FileConfig { server, rf, zigbee } = file;

    let host = args
        .bind
        .clone()
        .or(server.bind)
        .unwrap_or_else(|| DEFAULT_BIND.to_string());
    let port = args.port.or(server.port).unwrap_or(DEFAULT_PORT);
    let bind: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", host, port))?;

    let mut config = ServerConfig {
        bind,
        ..ServerConfig::default()
    };
    if let Some(name) = args.service_name.clone().or(server.service_name) {
        config.service_name = name;
    }
    if let Some(ms) = server.flush_delay_ms {
        config.flush_delay = Duration::from_millis(ms);
    }

    let mut devices = DeviceConfig { rf, zigbee };
    if args.no_rf {
        devices.rf.enabled = false;
    }
    if args.no_zigbee {
        devices.zigbee.enabled = false;
    }

    let metrics = args
        .metrics_port
        .or(server.metrics_port)
        .map(|port| SocketAddr::new(bind.ip(), port));

    let discovery_dir = args
        .discovery_dir
        .clone()
        .or(server.discovery_dir)
        .unwrap_or_else(FileDiscovery::default_dir);

    Ok(Settings {
        server: config,
        devices,
        metrics,
        discovery_dir,
    })
}

/// Host that controllers on this machine should dial
fn advertised_host(bind: &SocketAddr) -> String {
    if bind.ip().is_unspecified() {
        "127.0.0.1".to_string()
    } else {
        bind.ip().to_string()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    print_banner();

    let file = match &args.config {
        Some(path) => {
            info!(path = %path.display(), "Loading configuration");
            load_file(path)?
        }
        None => FileConfig::default(),
    };
    let settings = resolve(&args, file)?;

    let hardware = Hardware::simulated(&settings.devices);
    let registry = Arc::new(default_registry(&settings.devices, &hardware));
    info!(protocols = ?registry.selectors().collect::<Vec<_>>(), "Protocols registered");

    let discovery = FileDiscovery::new(&settings.discovery_dir, advertised_host(&settings.server.bind))
        .with_context(|| format!("Failed to open discovery directory {}", settings.discovery_dir.display()))?;

    info!(
        bind = %settings.server.bind,
        service = %settings.server.service_name,
        flush_delay_ms = settings.server.flush_delay.as_millis() as u64,
        metrics = settings.metrics.is_some(),
        "Starting Switchboard daemon"
    );

    let mut server = ConnectionServer::bind(settings.server, registry)
        .await
        .context("Failed to start connection server")?
        .with_discovery(Arc::new(discovery));

    if let Some(addr) = settings.metrics {
        let metrics = Arc::new(Metrics::new().context("Failed to register metrics")?);
        let metrics_server = MetricsServer::new(metrics.clone(), addr);
        tokio::spawn(async move {
            if let Err(e) = metrics_server.run().await {
                error!(error = %e, "Metrics server error");
            }
        });
        server = server.with_metrics(metrics);
    }

    let server = Arc::new(server);
    let runner = server.clone();
    let mut serve = tokio::spawn(async move { runner.run().await });

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!(connections = server.connection_count(), "Shutting down...");
            server.shutdown();
        }
        finished = &mut serve => {
            finished??;
            return Ok(());
        }
    }

    serve.await??;
    info!("Stopped");
    Ok(())
}

fn print_banner() {
    println!(
        r#"
  ╔═╗╦ ╦╔╗
  ╚═╗║║║╠╩╗
  ╚═╝╚╩╝╚═╝
  Switchboard
  Version {}
"#,
        env!("CARGO_PKG_VERSION")
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[server]
bind = "127.0.0.1"
port = 7100
service_name = "kitchen"
discovery_dir = "/run/switchboard/services"
flush_delay_ms = 250

[rf]
switches = [{ name = "lamp", on_code = 1361, off_code = 1364 }]

[zigbee]
channel = 20
devices = [{ id = "bulb-1", name = "Hall bulb", dimmable = true }]
"#;

    fn args(extra: &[&str]) -> Args {
        Args::parse_from(std::iter::once("swbd").chain(extra.iter().copied()))
    }

    #[test]
    fn test_defaults_without_file() {
        let settings = resolve(&args(&[]), FileConfig::default()).unwrap();
        assert_eq!(settings.server.bind, "0.0.0.0:6390".parse().unwrap());
        assert_eq!(settings.server.service_name, "switchboard");
        assert_eq!(settings.server.flush_delay, Duration::from_millis(100));
        assert!(settings.devices.rf.enabled);
        assert!(settings.metrics.is_none());
        assert_eq!(settings.discovery_dir, FileDiscovery::default_dir());
    }

    #[test]
    fn test_file_values_apply() {
        let file: FileConfig = toml::from_str(SAMPLE).unwrap();
        let settings = resolve(&args(&[]), file).unwrap();

        assert_eq!(settings.server.bind, "127.0.0.1:7100".parse().unwrap());
        assert_eq!(settings.server.service_name, "kitchen");
        assert_eq!(settings.server.flush_delay, Duration::from_millis(250));
        assert_eq!(settings.devices.rf.switches[0].on_code, 1361);
        assert_eq!(settings.devices.zigbee.channel, 20);
        assert!(settings.devices.zigbee.devices[0].dimmable);
        assert_eq!(settings.discovery_dir, PathBuf::from("/run/switchboard/services"));
    }

    #[test]
    fn test_arguments_override_file() {
        let file: FileConfig = toml::from_str(SAMPLE).unwrap();
        let settings = resolve(
            &args(&["--port", "7200", "--service-name", "garage", "--no-rf", "--metrics-port", "9390"]),
            file,
        )
        .unwrap();

        assert_eq!(settings.server.bind, "127.0.0.1:7200".parse().unwrap());
        assert_eq!(settings.server.service_name, "garage");
        assert!(!settings.devices.rf.enabled);
        assert!(settings.devices.zigbee.enabled);
        assert_eq!(settings.metrics, Some("127.0.0.1:9390".parse().unwrap()));

        let settings = resolve(&args(&["--discovery-dir", "/tmp/swb"]), toml::from_str(SAMPLE).unwrap()).unwrap();
        assert_eq!(settings.discovery_dir, PathBuf::from("/tmp/swb"));
    }

    #[test]
    fn test_invalid_bind_is_rejected() {
        assert!(resolve(&args(&["--bind", "not an address"]), FileConfig::default()).is_err());
    }

    #[test]
    fn test_load_file_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = load_file(file.path()).unwrap();
        assert_eq!(config.server.port, Some(7100));

        let mut broken = tempfile::NamedTempFile::new().unwrap();
        broken.write_all(b"[server\nport = ").unwrap();
        assert!(load_file(broken.path()).is_err());
        assert!(load_file(Path::new("/nonexistent/swbd.toml")).is_err());
    }

    #[test]
    fn test_advertised_host() {
        assert_eq!(advertised_host(&"0.0.0.0:6390".parse().unwrap()), "127.0.0.1");
        assert_eq!(advertised_host(&"10.0.0.5:6390".parse().unwrap()), "10.0.0.5");
    }
}
