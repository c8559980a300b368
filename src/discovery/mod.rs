//! Backend discovery
//!
//! Browses the LAN for the backend's mDNS service and remembers the last
//! address it resolved. On start the remembered (or explicitly configured)
//! address is reported right away, before any live resolution. Failures are
//! logged; without an address the client simply stays mesh-only.

pub mod cache;
pub mod endpoint;

pub use cache::{CacheError, EndpointCache};
pub use endpoint::{BackendEndpoint, EndpointError};

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::transport::TransportEvent;

/// mDNS service type the backend advertises
pub const SERVICE_TYPE: &str = "_guttertheory._tcp.local.";

/// Discovery settings
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub cache_path: PathBuf,
    /// Explicit backend address; takes precedence over the cache
    pub seed: Option<BackendEndpoint>,
    pub mdns_enabled: bool,
}

/// Current endpoint plus its persisted copy. Repeated offers of the same
/// address are no-ops.
pub struct EndpointTracker {
    current: Option<BackendEndpoint>,
    cache: EndpointCache,
}

impl EndpointTracker {
    pub fn new(cache: EndpointCache) -> Self {
        Self { current: None, cache }
    }

    pub fn current(&self) -> Option<&BackendEndpoint> {
        self.current.as_ref()
    }

    /// Adopt an address without writing it back (it came from the cache)
    fn recall(&mut self, endpoint: BackendEndpoint) {
        self.current = Some(endpoint);
    }

    /// Record a resolved address. Returns `false` for a duplicate.
    pub fn offer(&mut self, endpoint: BackendEndpoint) -> bool {
        if self.current.as_ref() == Some(&endpoint) {
            return false;
        }
        if let Err(e) = self.cache.store(&endpoint) {
            warn!(path = %self.cache.path().display(), error = %e, "Failed to persist backend endpoint");
        }
        self.current = Some(endpoint);
        true
    }
}

struct Browsing {
    daemon: Option<ServiceDaemon>,
    task: Option<JoinHandle<()>>,
}

/// Backend address resolver
pub struct BackendDiscovery {
    config: DiscoveryConfig,
    events: mpsc::Sender<TransportEvent>,
    tracker: Arc<Mutex<EndpointTracker>>,
    browsing: Mutex<Option<Browsing>>,
}

impl BackendDiscovery {
    pub fn new(config: DiscoveryConfig, events: mpsc::Sender<TransportEvent>) -> Self {
        let tracker = EndpointTracker::new(EndpointCache::new(config.cache_path.clone()));
        Self {
            config,
            events,
            tracker: Arc::new(Mutex::new(tracker)),
            browsing: Mutex::new(None),
        }
    }

    /// Last known backend address
    pub fn current(&self) -> Option<BackendEndpoint> {
        self.tracker.lock().current().cloned()
    }

    pub fn is_running(&self) -> bool {
        self.browsing.lock().is_some()
    }

    /// Report the known address, then browse. Idempotent while running.
    pub fn start(&self) -> Result<(), DiscoveryError> {
        let mut browsing = self.browsing.lock();
        if browsing.is_some() {
            return Ok(());
        }

        let known = {
            let mut tracker = self.tracker.lock();
            if let Some(seed) = self.config.seed.clone() {
                tracker.offer(seed);
            } else if tracker.current().is_none() {
                if let Some(cached) = tracker.cache.load() {
                    tracker.recall(cached);
                }
            }
            tracker.current().cloned()
        };
        if let Some(endpoint) = known {
            info!(endpoint = %endpoint, "Using known backend endpoint");
            if self.events.try_send(TransportEvent::Endpoint(endpoint)).is_err() {
                debug!("Event queue full, known endpoint not reported");
            }
        }

        if !self.config.mdns_enabled {
            *browsing = Some(Browsing { daemon: None, task: None });
            return Ok(());
        }

        let daemon = ServiceDaemon::new().map_err(DiscoveryError::Daemon)?;
        let receiver = match daemon.browse(SERVICE_TYPE) {
            Ok(receiver) => receiver,
            Err(e) => {
                if let Err(e) = daemon.shutdown() {
                    debug!(error = %e, "mDNS daemon shutdown failed");
                }
                return Err(DiscoveryError::Browse(e));
            }
        };

        let tracker = self.tracker.clone();
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            while let Ok(event) = receiver.recv_async().await {
                match event {
                    ServiceEvent::ServiceResolved(info) => {
                        let Some(endpoint) = endpoint_of(&info) else {
                            debug!(service = info.get_fullname(), "Resolved service has no usable address");
                            continue;
                        };
                        if !tracker.lock().offer(endpoint.clone()) {
                            continue;
                        }
                        info!(endpoint = %endpoint, service = info.get_fullname(), "Backend discovered");
                        if events.send(TransportEvent::Endpoint(endpoint)).await.is_err() {
                            break;
                        }
                    }
                    ServiceEvent::SearchStarted(_) => debug!("mDNS search started"),
                    ServiceEvent::SearchStopped(_) => break,
                    _ => {}
                }
            }
        });

        info!(service = SERVICE_TYPE, "Backend discovery started");
        *browsing = Some(Browsing {
            daemon: Some(daemon),
            task: Some(task),
        });
        Ok(())
    }

    /// Stop browsing; the known address is kept
    pub fn stop(&self) {
        let Some(browsing) = self.browsing.lock().take() else {
            return;
        };
        if let Some(task) = browsing.task {
            task.abort();
        }
        if let Some(daemon) = browsing.daemon {
            if let Err(e) = daemon.shutdown() {
                warn!(error = %e, "Failed to shut down mDNS daemon");
            }
        }
        info!("Backend discovery stopped");
    }
}

/// Compose `http://host:port`, preferring an IPv4 address
fn endpoint_of(info: &ServiceInfo) -> Option<BackendEndpoint> {
    let host = info
        .get_addresses()
        .iter()
        .map(|addr| IpAddr::from(*addr))
        .min_by_key(|ip| !ip.is_ipv4())?;
    BackendEndpoint::from_host_port(host, info.get_port()).ok()
}

/// Discovery errors
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Failed to create mDNS daemon: {0}")]
    Daemon(#[source] mdns_sd::Error),

    #[error("Failed to start mDNS browse: {0}")]
    Browse(#[source] mdns_sd::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(dir: &tempfile::TempDir, seed: Option<&str>) -> DiscoveryConfig {
        DiscoveryConfig {
            cache_path: dir.path().join("backend.json"),
            seed: seed.map(|s| BackendEndpoint::parse(s).unwrap()),
            mdns_enabled: false,
        }
    }

    async fn next_endpoint(rx: &mut mpsc::Receiver<TransportEvent>) -> BackendEndpoint {
        match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(TransportEvent::Endpoint(endpoint))) => endpoint,
            other => panic!("expected endpoint event, got {other:?}"),
        }
    }

    #[test]
    fn tracker_dedupes_repeated_offers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = EndpointCache::new(dir.path().join("backend.json"));
        let mut tracker = EndpointTracker::new(cache.clone());
        let a = BackendEndpoint::parse("http://10.0.0.1:8000").unwrap();
        let b = BackendEndpoint::parse("http://10.0.0.2:8000").unwrap();

        assert!(tracker.offer(a.clone()));
        assert!(!tracker.offer(a.clone()));

        // A duplicate does not rewrite the cache
        std::fs::remove_file(cache.path()).unwrap();
        assert!(!tracker.offer(a));
        assert_eq!(cache.load(), None);

        assert!(tracker.offer(b.clone()));
        assert_eq!(cache.load(), Some(b));
    }

    #[tokio::test]
    async fn cached_endpoint_is_reported_on_start() {
        let dir = tempfile::tempdir().unwrap();
        let cached = BackendEndpoint::parse("http://10.0.0.7:8000").unwrap();
        EndpointCache::new(dir.path().join("backend.json"))
            .store(&cached)
            .unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let discovery = BackendDiscovery::new(config(&dir, None), tx);
        tokio_test::assert_ok!(discovery.start());

        assert_eq!(next_endpoint(&mut rx).await, cached);
        assert_eq!(discovery.current(), Some(cached));
    }

    #[tokio::test]
    async fn seed_wins_over_cache_and_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let cache = EndpointCache::new(dir.path().join("backend.json"));
        cache
            .store(&BackendEndpoint::parse("http://10.0.0.7:8000").unwrap())
            .unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let discovery = BackendDiscovery::new(config(&dir, Some("http://192.168.4.2:9000")), tx);
        discovery.start().unwrap();

        let seed = BackendEndpoint::parse("http://192.168.4.2:9000").unwrap();
        assert_eq!(next_endpoint(&mut rx).await, seed);
        assert_eq!(cache.load(), Some(seed));
    }

    #[tokio::test]
    async fn nothing_known_reports_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let discovery = BackendDiscovery::new(config(&dir, None), tx);
        discovery.start().unwrap();

        assert!(rx.try_recv().is_err());
        assert_eq!(discovery.current(), None);
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let discovery = BackendDiscovery::new(config(&dir, Some("http://10.0.0.1:1")), tx);

        discovery.start().unwrap();
        discovery.start().unwrap();
        assert!(discovery.is_running());
        next_endpoint(&mut rx).await;
        assert!(rx.try_recv().is_err());

        discovery.stop();
        discovery.stop();
        assert!(!discovery.is_running());
        // The known address survives a stop
        assert!(discovery.current().is_some());
    }
}
