//! Registry of live connections.
//!
//! Used for health reporting and for disconnecting every client on
//! shutdown. Uses DashMap for lock-free concurrent access from the
//! server tasks.

use crate::conn::ConnHandle;
use dashmap::DashMap;
use tracing::info;

/// Lock-free registry of connected clients, keyed by connection ID.
pub struct ConnRegistry {
    conns: DashMap<String, ConnHandle>,
}

impl ConnRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            conns: DashMap::new(),
        }
    }

    /// Register a connection.
    pub fn register(&self, handle: ConnHandle) {
        self.conns.insert(handle.cid().to_string(), handle);
    }

    /// Remove a connection.
    pub fn unregister(&self, cid: &str) {
        self.conns.remove(cid);
    }

    /// Number of live connections.
    pub fn count(&self) -> usize {
        self.conns.len()
    }

    /// Close every connection.
    pub fn close_all(&self) {
        if self.conns.is_empty() {
            return;
        }
        info!("Closing {} connection(s)", self.conns.len());
        for entry in self.conns.iter() {
            entry.value().close();
        }
        self.conns.clear();
    }
}

impl Default for ConnRegistry {
    fn default() -> Self {
        Self::new()
    }
}
