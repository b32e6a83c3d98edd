//! Remembers which health path answered on each port.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::debug;

/// What discovery last learned about a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedEndpoint {
    /// This path answered with something other than 404/400.
    Path(String),
    /// No candidate path answered; skip HTTP until invalidated.
    NoEndpoint,
}

#[derive(Debug, Default)]
pub struct EndpointCache {
    entries: RwLock<HashMap<u16, CachedEndpoint>>,
}

impl EndpointCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, port: u16) -> Option<CachedEndpoint> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(&port).cloned()
    }

    pub fn remember(&self, port: u16, path: &str) {
        debug!(port, path, "caching health endpoint");
        self.insert(port, CachedEndpoint::Path(path.to_string()));
    }

    pub fn mark_none(&self, port: u16) {
        debug!(port, "no http health endpoint found");
        self.insert(port, CachedEndpoint::NoEndpoint);
    }

    pub fn invalidate(&self, port: u16) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.remove(&port).is_some() {
            debug!(port, "health endpoint cache invalidated");
        }
    }

    fn insert(&self, port: u16, entry: CachedEndpoint) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(port, entry);
    }
}
