use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use hashbrown::{HashMap, HashSet};
use parking_lot::RwLock;
use tracing::{debug, trace};

use super::{
    connection::{Connection, Handle},
    uri::Uri,
};

/// What the registry knows about a locator it has been asked to track.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerStatus {
    /// A connection exists but has not reported success yet.
    Connecting,
    Connected,
    /// The last attempt failed or the connection left.
    Disconnected,
}

#[derive(Default)]
struct Tables {
    connections: HashMap<Handle, Arc<Connection>>,
    by_locator: HashMap<Uri, Handle>,
    locators: HashMap<Handle, Uri>,
    persistent: HashSet<Uri>,
    status: HashMap<Uri, PeerStatus>,
}

/// Owns every live connection and the maps between handles and locators.
///
/// Connections are looked up by handle on every event, so a stale handle
/// simply misses instead of reaching a dead object.
pub struct PeerRegistry {
    next_handle: AtomicU64,
    tables: RwLock<Tables>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(1),
            tables: RwLock::new(Tables::default()),
        }
    }

    /// Hands out a handle never returned before by this registry.
    pub fn allocate_handle(&self) -> Handle {
        Handle::new(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    /// Tracks `connection`. Outgoing connections carry the locator they were
    /// dialled at, which then maps back to the handle.
    pub fn add_connection(&self, locator: Option<Uri>, connection: Arc<Connection>) {
        let handle = connection.handle();
        let mut tables = self.tables.write();
        if let Some(locator) = locator {
            trace!(%handle, %locator, "tracking locator");
            tables.by_locator.insert(locator.clone(), handle);
            tables.locators.insert(handle, locator.clone());
            tables.status.insert(locator, PeerStatus::Connecting);
        }
        tables.connections.insert(handle, connection);
    }

    /// Marks the locator behind `handle` as connected.
    pub fn mark_connected(&self, handle: Handle) {
        let mut tables = self.tables.write();
        if let Some(locator) = tables.locators.get(&handle).cloned() {
            tables.status.insert(locator, PeerStatus::Connected);
        }
    }

    /// Forgets `handle` and its locator mapping, returning the connection if
    /// it was still tracked.
    pub fn remove_connection(&self, handle: Handle) -> Option<Arc<Connection>> {
        let mut tables = self.tables.write();
        let connection = tables.connections.remove(&handle);
        if let Some(locator) = tables.locators.remove(&handle) {
            // the locator may already point at a newer connection
            if tables.by_locator.get(&locator) == Some(&handle) {
                tables.by_locator.remove(&locator);
                tables.status.insert(locator, PeerStatus::Disconnected);
            }
        }
        if connection.is_some() {
            debug!(%handle, "connection removed from registry");
        }
        connection
    }

    pub fn lookup_by_handle(&self, handle: Handle) -> Option<Arc<Connection>> {
        self.tables.read().connections.get(&handle).cloned()
    }

    pub fn lookup_by_locator(&self, locator: &Uri) -> Option<Arc<Connection>> {
        let tables = self.tables.read();
        tables
            .by_locator
            .get(locator)
            .and_then(|handle| tables.connections.get(handle))
            .cloned()
    }

    pub fn locator_of(&self, handle: Handle) -> Option<Uri> {
        self.tables.read().locators.get(&handle).cloned()
    }

    pub fn status(&self, locator: &Uri) -> Option<PeerStatus> {
        self.tables.read().status.get(locator).copied()
    }

    /// Returns true if the locator was not persistent before.
    pub fn add_persistent_peer(&self, locator: Uri) -> bool {
        self.tables.write().persistent.insert(locator)
    }

    /// Stops re-dialling `locator`. Any live connection to it stays up.
    pub fn remove_persistent_peer(&self, locator: &Uri) -> bool {
        self.tables.write().persistent.remove(locator)
    }

    pub fn persistent_peers(&self) -> Vec<Uri> {
        self.tables.read().persistent.iter().cloned().collect()
    }

    /// Persistent peers with no connection currently tracked for them,
    /// whether established or still in progress.
    pub fn peers_to_connect(&self) -> Vec<Uri> {
        let tables = self.tables.read();
        tables
            .persistent
            .iter()
            .filter(|locator| {
                tables
                    .by_locator
                    .get(*locator)
                    .and_then(|handle| tables.connections.get(handle))
                    .map_or(true, |connection| connection.is_closed())
            })
            .cloned()
            .collect()
    }

    pub fn handles(&self) -> Vec<Handle> {
        self.tables.read().connections.keys().copied().collect()
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.tables.read().connections.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tables.read().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns every tracked connection. Persistent peers are
    /// kept so a restarted node dials them again.
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        let mut tables = self.tables.write();
        tables.by_locator.clear();
        tables.locators.clear();
        for status in tables.status.values_mut() {
            *status = PeerStatus::Disconnected;
        }
        tables.connections.drain().map(|(_, c)| c).collect()
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
