//! Service discovery
//!
//! Servers advertise themselves under a service name; controllers browse
//! for names and resolve them to an address.
//!
//! - [`LocalDiscovery`] keeps the directory in process, which is enough for a
//!   server and controllers that share a runtime, and for addresses supplied
//!   on the command line.
//! - [`FileDiscovery`] keeps one JSON file per service in a state directory,
//!   so separate processes on one machine find each other:
//!   - Linux: `$XDG_STATE_HOME/switchboard/services/<name>.json`
//!   - elsewhere: the local data directory, else the temp directory

use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{TransportError, TransportResult};

/// One advertised service
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl ServiceInfo {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
        }
    }

    /// `host:port`, ready for `TcpStream::connect`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ServiceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.name, self.host, self.port)
    }
}

/// Services already known when browsing started, then new advertisements
pub struct DiscoveryStream {
    known: VecDeque<ServiceInfo>,
    updates: broadcast::Receiver<ServiceInfo>,
}

impl DiscoveryStream {
    /// Next discovered service, or `None` once the directory is gone
    pub async fn next(&mut self) -> Option<ServiceInfo> {
        if let Some(service) = self.known.pop_front() {
            return Some(service);
        }
        loop {
            match self.updates.recv().await {
                Ok(service) => return Some(service),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(missed = n, "Discovery stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Advertisement and browsing of services on the local network
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    /// Make `name` reachable on `port` of this host
    async fn advertise(&self, name: &str, port: u16) -> TransportResult<()>;

    /// Remove the advertisement for `name`
    async fn withdraw(&self, name: &str) -> TransportResult<()>;

    /// Browse for services
    fn discover(&self) -> DiscoveryStream;

    /// Look up one service by name
    async fn resolve(&self, name: &str) -> TransportResult<ServiceInfo>;
}

/// In-process service directory
pub struct LocalDiscovery {
    host: String,
    services: DashMap<String, ServiceInfo>,
    updates: broadcast::Sender<ServiceInfo>,
}

impl LocalDiscovery {
    /// Directory that advertises services on `host`
    pub fn new(host: impl Into<String>) -> Self {
        let (updates, _) = broadcast::channel(64);
        Self {
            host: host.into(),
            services: DashMap::new(),
            updates,
        }
    }

    /// Add a service that was found by other means
    pub fn with_service(self, service: ServiceInfo) -> Self {
        self.insert(service);
        self
    }

    pub fn insert(&self, service: ServiceInfo) {
        self.services.insert(service.name.clone(), service.clone());
        let _ = self.updates.send(service);
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl Default for LocalDiscovery {
    fn default() -> Self {
        Self::new("127.0.0.1")
    }
}

#[async_trait]
impl ServiceDiscovery for LocalDiscovery {
    async fn advertise(&self, name: &str, port: u16) -> TransportResult<()> {
        let service = ServiceInfo::new(name, self.host.clone(), port);
        info!(service = %service, "Advertising service");
        self.insert(service);
        Ok(())
    }

    async fn withdraw(&self, name: &str) -> TransportResult<()> {
        if self.services.remove(name).is_some() {
            info!(service = %name, "Withdrew service");
        }
        Ok(())
    }

    fn discover(&self) -> DiscoveryStream {
        let updates = self.updates.subscribe();
        let mut known: Vec<ServiceInfo> = self.services.iter().map(|e| e.value().clone()).collect();
        known.sort_by(|a, b| a.name.cmp(&b.name));
        DiscoveryStream {
            known: known.into(),
            updates,
        }
    }

    async fn resolve(&self, name: &str) -> TransportResult<ServiceInfo> {
        self.services
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| TransportError::Discovery(format!("no service named {}", name)))
    }
}

/// Contents of one service file
#[derive(Debug, Serialize, Deserialize)]
struct ServiceFile {
    #[serde(flatten)]
    service: ServiceInfo,
    /// Process that advertised the service
    pid: u32,
    /// Seconds since the Unix epoch
    advertised_at: u64,
}

/// Service directory shared between processes through JSON files
///
/// Files are replaced atomically, so a reader never sees a half-written
/// entry. An entry left behind by a process that died stays until the name
/// is advertised or withdrawn again.
pub struct FileDiscovery {
    dir: PathBuf,
    host: String,
    updates: broadcast::Sender<ServiceInfo>,
}

impl FileDiscovery {
    /// Directory at `dir` that advertises services on `host`
    pub fn new(dir: impl Into<PathBuf>, host: impl Into<String>) -> TransportResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let (updates, _) = broadcast::channel(64);
        Ok(Self {
            dir,
            host: host.into(),
            updates,
        })
    }

    /// Platform default location of the service files
    pub fn default_dir() -> PathBuf {
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(std::env::temp_dir)
            .join("switchboard")
            .join("services")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> PathBuf {
        let stem: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", stem))
    }

    /// Write the file for `service` (write to temp, then rename)
    fn write(&self, service: &ServiceInfo) -> TransportResult<()> {
        let path = self.path_for(&service.name);
        let file = ServiceFile {
            service: service.clone(),
            pid: std::process::id(),
            advertised_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| TransportError::Discovery(e.to_string()))?;

        let temp_path = path.with_extension(format!("json.{}.tmp", file.pid));
        {
            let mut out = fs::File::create(&temp_path)?;
            out.write_all(json.as_bytes())?;
            out.sync_all()?;
        }
        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    fn read(path: &Path) -> TransportResult<ServiceInfo> {
        let text = fs::read_to_string(path)?;
        let file: ServiceFile = serde_json::from_str(&text)
            .map_err(|e| TransportError::Discovery(format!("{}: {}", path.display(), e)))?;
        Ok(file.service)
    }

    /// Every readable service file, sorted by name
    fn list(&self) -> Vec<ServiceInfo> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "Cannot read discovery directory");
                return Vec::new();
            }
        };

        let mut services: Vec<ServiceInfo> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().map_or(false, |ext| ext == "json"))
            .filter_map(|path| match Self::read(&path) {
                Ok(service) => Some(service),
                Err(e) => {
                    debug!(error = %e, "Skipping service file");
                    None
                }
            })
            .collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        services
    }
}

#[async_trait]
impl ServiceDiscovery for FileDiscovery {
    async fn advertise(&self, name: &str, port: u16) -> TransportResult<()> {
        let service = ServiceInfo::new(name, self.host.clone(), port);
        self.write(&service)?;
        info!(service = %service, dir = %self.dir.display(), "Advertising service");
        let _ = self.updates.send(service);
        Ok(())
    }

    async fn withdraw(&self, name: &str) -> TransportResult<()> {
        match fs::remove_file(self.path_for(name)) {
            Ok(()) => {
                info!(service = %name, "Withdrew service");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Files present now, then services advertised through this instance
    fn discover(&self) -> DiscoveryStream {
        DiscoveryStream {
            known: self.list().into(),
            updates: self.updates.subscribe(),
        }
    }

    async fn resolve(&self, name: &str) -> TransportResult<ServiceInfo> {
        let path = self.path_for(name);
        let service = match Self::read(&path) {
            Ok(service) => service,
            Err(TransportError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                return Err(TransportError::Discovery(format!("no service named {}", name)))
            }
            Err(e) => return Err(e),
        };
        // Names that only differ in replaced characters share a file
        if service.name != name {
            return Err(TransportError::Discovery(format!("no service named {}", name)));
        }
        Ok(service)
    }
}
