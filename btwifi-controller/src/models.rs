//! In-memory list models handed to the UI layer
//!
//! The UI only relies on `add`, `get`, `remove` and `clear`; everything else
//! here is convenience for the engine and tests.

use btwifi_proto::AccessPoint;

use crate::scanner::PeerHandle;

pub trait ListModel<T> {
    fn add(&mut self, item: T);

    fn get(&self, index: usize) -> Option<&T>;

    fn remove(&mut self, index: usize) -> Option<T>;

    fn clear(&mut self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Networks visible to the device, replaced wholesale on every list response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessPoints {
    items: Vec<AccessPoint>,
}

impl AccessPoints {
    pub fn iter(&self) -> std::slice::Iter<'_, AccessPoint> {
        self.items.iter()
    }

    pub fn find(&self, ssid: &str) -> Option<&AccessPoint> {
        self.items.iter().find(|ap| ap.ssid == ssid)
    }

    pub fn to_vec(&self) -> Vec<AccessPoint> {
        self.items.clone()
    }
}

impl ListModel<AccessPoint> for AccessPoints {
    fn add(&mut self, item: AccessPoint) {
        self.items.push(item);
    }

    fn get(&self, index: usize) -> Option<&AccessPoint> {
        self.items.get(index)
    }

    fn remove(&mut self, index: usize) -> Option<AccessPoint> {
        (index < self.items.len()).then(|| self.items.remove(index))
    }

    fn clear(&mut self) {
        self.items.clear();
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// Scan result set: one entry per address, later sightings overwrite earlier ones
#[derive(Debug, Clone, Default)]
pub struct DiscoveredPeers {
    items: Vec<PeerHandle>,
}

impl DiscoveredPeers {
    /// Insert or refresh a peer; returns `true` if the address was new
    pub fn upsert(&mut self, peer: PeerHandle) -> bool {
        match self.items.iter_mut().find(|p| p.address == peer.address) {
            Some(existing) => {
                *existing = peer;
                false
            }
            None => {
                self.items.push(peer);
                true
            }
        }
    }

    /// First peer whose name or address contains `pattern`
    pub fn matching(&self, pattern: &str) -> Option<&PeerHandle> {
        self.items.iter().find(|p| {
            p.address.contains(pattern) || p.name.as_deref().is_some_and(|n| n.contains(pattern))
        })
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PeerHandle> {
        self.items.iter()
    }
}

impl ListModel<PeerHandle> for DiscoveredPeers {
    fn add(&mut self, item: PeerHandle) {
        self.upsert(item);
    }

    fn get(&self, index: usize) -> Option<&PeerHandle> {
        self.items.get(index)
    }

    fn remove(&mut self, index: usize) -> Option<PeerHandle> {
        (index < self.items.len()).then(|| self.items.remove(index))
    }

    fn clear(&mut self) {
        self.items.clear();
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}
