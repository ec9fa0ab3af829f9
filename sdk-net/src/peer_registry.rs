//! Directory of configured peers and their live connection handles.
//!
//! The endpoint → handle map is mutated concurrently by connection tasks
//! (registration, loss) and read by callers; removal is check-and-set on
//! the connection id so a stale loss report cannot evict a newer handle.
//! The configured peer list is copy-on-write: the reconnect pass iterates
//! a snapshot while administrative add/remove swap in a new list.

use {
    crate::{
        connection::{ConnectionHandle, ConnectionId},
        endpoint::PeerEndpoint,
        error::{Result, SdkNetError},
        frame::Frame,
        protocol::NegotiatedProtocol,
    },
    arc_swap::ArcSwap,
    dashmap::DashMap,
    log::{debug, info},
    parking_lot::RwLock,
    std::sync::Arc,
};

/// Upward notifications about peer availability.
///
/// Called on I/O threads, after the registry has been updated.
pub trait PeerObserver: Send + Sync {
    fn on_peer_available(&self, _endpoint: &PeerEndpoint, _protocol: &NegotiatedProtocol) {}

    fn on_peer_lost(&self, _endpoint: &PeerEndpoint) {}
}

pub struct PeerRegistry {
    configured: ArcSwap<Vec<PeerEndpoint>>,
    handles: DashMap<PeerEndpoint, ConnectionHandle>,
    observers: RwLock<Vec<Arc<dyn PeerObserver>>>,
}

impl PeerRegistry {
    pub fn new(configured: Vec<PeerEndpoint>) -> Self {
        Self {
            configured: ArcSwap::from_pointee(configured),
            handles: DashMap::new(),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn add_observer(&self, observer: Arc<dyn PeerObserver>) {
        self.observers.write().push(observer);
    }

    fn observers(&self) -> Vec<Arc<dyn PeerObserver>> {
        self.observers.read().clone()
    }

    // ── Live handles ────────────────────────────────────────────────────

    /// Publish `handle` and notify observers.
    ///
    /// A handle already registered for the same endpoint is replaced and
    /// closed.
    pub fn register(&self, handle: ConnectionHandle) {
        let endpoint = handle.endpoint().clone();
        let previous = self.handles.insert(endpoint.clone(), handle.clone());
        if let Some(previous) = previous.filter(|p| p.id() != handle.id()) {
            debug!("replacing {} for {}", previous.id(), endpoint);
            previous.close("replaced by a newer connection");
        }
        info!(
            "peer {} available, protocol {}",
            endpoint,
            handle.protocol().version()
        );
        for observer in self.observers() {
            observer.on_peer_available(&endpoint, handle.protocol());
        }
    }

    /// Remove the handle of `endpoint` if it is still connection `id`.
    ///
    /// Returns whether an entry was removed; observers are told about the
    /// loss only then.
    pub fn unregister(&self, endpoint: &PeerEndpoint, id: ConnectionId) -> bool {
        let removed = self
            .handles
            .remove_if(endpoint, |_, handle| handle.id() == id)
            .is_some();
        if removed {
            for observer in self.observers() {
                observer.on_peer_lost(endpoint);
            }
        }
        removed
    }

    /// Remove whatever handle `endpoint` has, without closing it.
    pub fn remove(&self, endpoint: &PeerEndpoint) -> Option<ConnectionHandle> {
        let (_, handle) = self.handles.remove(endpoint)?;
        for observer in self.observers() {
            observer.on_peer_lost(endpoint);
        }
        Some(handle)
    }

    /// Remove and return every handle.
    pub fn drain(&self) -> Vec<ConnectionHandle> {
        let endpoints: Vec<PeerEndpoint> = self.handles.iter().map(|e| e.key().clone()).collect();
        endpoints
            .iter()
            .filter_map(|endpoint| self.remove(endpoint))
            .collect()
    }

    pub fn get(&self, endpoint: &PeerEndpoint) -> Option<ConnectionHandle> {
        self.handles.get(endpoint).map(|entry| entry.value().clone())
    }

    /// Whether `endpoint` has a registered handle whose transport is still up.
    pub fn is_alive(&self, endpoint: &PeerEndpoint) -> bool {
        self.handles
            .get(endpoint)
            .is_some_and(|entry| entry.value().is_active())
    }

    /// Endpoints with a live handle, sorted.
    pub fn available(&self) -> Vec<PeerEndpoint> {
        let mut endpoints: Vec<PeerEndpoint> = self
            .handles
            .iter()
            .filter(|entry| entry.value().is_active())
            .map(|entry| entry.key().clone())
            .collect();
        endpoints.sort();
        endpoints
    }

    pub fn handles(&self) -> Vec<ConnectionHandle> {
        self.handles.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Send `frame` to every registered peer.
    ///
    /// A failure on one peer does not stop delivery to the others; the
    /// result for each peer is returned.
    pub fn broadcast(&self, frame: &Frame) -> Vec<(PeerEndpoint, Result<()>)> {
        self.handles()
            .into_iter()
            .map(|handle| {
                let result = handle.send(frame.clone());
                (handle.endpoint().clone(), result)
            })
            .collect()
    }

    /// Send `frame` to `endpoint`, failing at once if it has no live handle.
    pub fn send_to_peer(&self, endpoint: &PeerEndpoint, frame: Frame) -> Result<()> {
        let handle = self
            .get(endpoint)
            .filter(ConnectionHandle::is_active)
            .ok_or_else(|| SdkNetError::PeerNotAvailable(endpoint.clone()))?;
        handle.send(frame)
    }

    // ── Configured peers ────────────────────────────────────────────────

    /// Snapshot of the configured peer list.
    pub fn configured(&self) -> Arc<Vec<PeerEndpoint>> {
        self.configured.load_full()
    }

    pub fn is_configured(&self, endpoint: &PeerEndpoint) -> bool {
        self.configured.load().contains(endpoint)
    }

    /// Add `endpoint` to the configured list. Returns `false` if present.
    pub fn add_configured(&self, endpoint: PeerEndpoint) -> bool {
        let mut added = false;
        self.configured.rcu(|current| {
            added = !current.contains(&endpoint);
            let mut next = current.to_vec();
            if added {
                next.push(endpoint.clone());
            }
            next
        });
        added
    }

    /// Drop `endpoint` from the configured list. Returns `false` if absent.
    pub fn remove_configured(&self, endpoint: &PeerEndpoint) -> bool {
        let mut removed = false;
        self.configured.rcu(|current| {
            removed = current.contains(endpoint);
            current
                .iter()
                .filter(|peer| *peer != endpoint)
                .cloned()
                .collect::<Vec<_>>()
        });
        removed
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
