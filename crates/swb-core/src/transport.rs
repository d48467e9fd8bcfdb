//! Serialized access to a shared hardware transport
//!
//! Radios and dongles are not reentrant, so every operation on one device runs
//! on a single worker thread that owns the driver. Protocol instances hold a
//! [`TransportLease`]; cancelling a lease drops only that lease's queued jobs.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::error::{Error, Result};

type Job<D> = Box<dyn FnOnce(&mut D) + Send>;

struct Envelope<D> {
    lease: u64,
    cancelled: Arc<AtomicBool>,
    job: Job<D>,
}

struct Inner<D> {
    name: String,
    sender: Option<mpsc::UnboundedSender<Envelope<D>>>,
    next_lease: AtomicU64,
    queued: Arc<AtomicUsize>,
}

/// Process-wide handle to one hardware device
pub struct Transport<D> {
    inner: Arc<Inner<D>>,
}

impl<D> Clone for Transport<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: Send + 'static> Transport<D> {
    /// Start the worker thread that owns `device`
    pub fn spawn(name: impl Into<String>, mut device: D) -> Self {
        let name = name.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope<D>>();
        let queued = Arc::new(AtomicUsize::new(0));
        let worker_queued = queued.clone();
        let worker_name = name.clone();

        let spawned = std::thread::Builder::new()
            .name(format!("transport-{}", name))
            .spawn(move || {
                while let Some(envelope) = rx.blocking_recv() {
                    worker_queued.fetch_sub(1, Ordering::SeqCst);
                    if envelope.cancelled.load(Ordering::SeqCst) {
                        debug!(transport = %worker_name, lease = envelope.lease, "Skipping cancelled job");
                        continue;
                    }
                    (envelope.job)(&mut device);
                }
                debug!(transport = %worker_name, "Transport worker stopped");
            });

        let sender = match spawned {
            Ok(_) => {
                info!(transport = %name, "Transport started");
                Some(tx)
            }
            Err(e) => {
                error!(transport = %name, error = %e, "Failed to start transport worker");
                None
            }
        };

        Self {
            inner: Arc::new(Inner {
                name,
                sender,
                next_lease: AtomicU64::new(1),
                queued,
            }),
        }
    }

    /// A transport whose hardware is absent
    pub fn unavailable(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                sender: None,
                next_lease: AtomicU64::new(1),
                queued: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_available(&self) -> bool {
        self.inner
            .sender
            .as_ref()
            .map_or(false, |tx| !tx.is_closed())
    }

    /// Jobs waiting for the worker
    pub fn queued(&self) -> usize {
        self.inner.queued.load(Ordering::SeqCst)
    }

    /// Scheduling handle for one protocol instance
    pub fn lease(&self) -> TransportLease<D> {
        TransportLease {
            transport: self.clone(),
            id: self.inner.next_lease.fetch_add(1, Ordering::Relaxed),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl<D> std::fmt::Debug for Transport<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("name", &self.inner.name)
            .field("available", &self.inner.sender.is_some())
            .finish()
    }
}

/// One protocol instance's right to queue work on a [`Transport`]
pub struct TransportLease<D> {
    transport: Transport<D>,
    id: u64,
    cancelled: Arc<AtomicBool>,
}

impl<D: Send + 'static> TransportLease<D> {
    pub fn is_available(&self) -> bool {
        !self.is_cancelled() && self.transport.is_available()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn transport_name(&self) -> &str {
        self.transport.name()
    }

    /// Queue `job` behind every job already submitted to the transport
    pub fn submit<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce(&mut D) + Send + 'static,
    {
        if self.is_cancelled() {
            return Err(Error::TransportClosed(format!(
                "{} lease {} was cancelled",
                self.transport.name(),
                self.id
            )));
        }
        let sender = self
            .transport
            .inner
            .sender
            .as_ref()
            .ok_or_else(|| Error::TransportClosed(self.transport.name().to_string()))?;

        self.transport.inner.queued.fetch_add(1, Ordering::SeqCst);
        let envelope = Envelope {
            lease: self.id,
            cancelled: self.cancelled.clone(),
            job: Box::new(job),
        };
        sender.send(envelope).map_err(|_| {
            self.transport.inner.queued.fetch_sub(1, Ordering::SeqCst);
            Error::TransportClosed(self.transport.name().to_string())
        })
    }

    /// Drop every job of this lease that has not started yet. Idempotent.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            debug!(transport = %self.transport.name(), lease = self.id, "Lease cancelled");
        }
    }
}

impl<D> Drop for TransportLease<D> {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        log: Vec<String>,
    }

    fn record(lease: &TransportLease<Recorder>, tx: &std_mpsc::Sender<Vec<String>>, entry: &str) {
        let tx = tx.clone();
        let entry = entry.to_string();
        lease
            .submit(move |device| {
                device.log.push(entry);
                let _ = tx.send(device.log.clone());
            })
            .unwrap();
    }

    #[test]
    fn test_jobs_run_in_submission_order() {
        let transport = Transport::spawn("test", Recorder::default());
        let lease = transport.lease();
        let (tx, rx) = std_mpsc::channel();

        record(&lease, &tx, "a");
        record(&lease, &tx, "b");
        record(&lease, &tx, "c");

        let mut last = Vec::new();
        for _ in 0..3 {
            last = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        }
        assert_eq!(last, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_cancel_only_drops_own_jobs() {
        let transport = Transport::spawn("test", Recorder::default());
        let gate = transport.lease();
        let a = transport.lease();
        let b = transport.lease();
        let (tx, rx) = std_mpsc::channel();
        let (gate_tx, gate_rx) = std_mpsc::channel::<()>();

        // Hold the worker until both leases have queued work
        gate.submit(move |_| {
            let _ = gate_rx.recv_timeout(Duration::from_secs(2));
        })
        .unwrap();
        record(&a, &tx, "a1");
        record(&b, &tx, "b1");
        record(&a, &tx, "a2");

        a.cancel();
        let _ = gate_tx.send(());

        let log = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(log, vec!["b1"]);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        // Cancelled leases refuse new work; siblings keep going
        assert!(a.submit(|_| {}).is_err());
        record(&b, &tx, "b2");
        let log = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(log, vec!["b1", "b2"]);
    }

    #[test]
    fn test_unavailable_transport_rejects_jobs() {
        let transport: Transport<Recorder> = Transport::unavailable("radio");
        let lease = transport.lease();
        assert!(!transport.is_available());
        assert!(!lease.is_available());
        assert!(matches!(lease.submit(|_| {}), Err(Error::TransportClosed(_))));
    }
}
