/*!
 * Discoverability
 * Timed pairing windows and the peers seen during them
 */

pub mod sampler;
pub mod session;

use std::collections::btree_map::{self, BTreeMap};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::bluetooth::DeviceInfo;

pub use sampler::PeerSampler;
pub use session::Discoverability;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Peer {
    pub address: String,
    pub name: String,
    pub last_seen: DateTime<Utc>,
    pub connected: bool,
}

/// Address-keyed peers from one sampling run. Entries are only ever upserted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct PeerSnapshot {
    peers: BTreeMap<String, Peer>,
}

impl PeerSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `device` as seen at `now`. `last_seen` never moves backwards.
    pub fn upsert(&mut self, device: &DeviceInfo, now: DateTime<Utc>) {
        self.peers
            .entry(device.address.clone())
            .and_modify(|peer| {
                peer.name = device.alias.clone();
                peer.connected = device.connected;
                peer.last_seen = peer.last_seen.max(now);
            })
            .or_insert_with(|| Peer {
                address: device.address.clone(),
                name: device.alias.clone(),
                last_seen: now,
                connected: device.connected,
            });
    }

    pub fn get(&self, address: &str) -> Option<&Peer> {
        self.peers.get(address)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> btree_map::Values<'_, String, Peer> {
        self.peers.values()
    }

    pub fn connected(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values().filter(|peer| peer.connected)
    }

    pub fn into_map(self) -> BTreeMap<String, Peer> {
        self.peers
    }
}

impl<'a> IntoIterator for &'a PeerSnapshot {
    type Item = &'a Peer;
    type IntoIter = btree_map::Values<'a, String, Peer>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::mock::device;
    use chrono::Duration;

    #[test]
    fn upsert_refreshes_name_and_connection() {
        let mut snapshot = PeerSnapshot::new();
        let t0 = Utc::now();
        snapshot.upsert(&device("AA:BB:CC:DD:EE:01", "", false), t0);
        snapshot.upsert(&device("AA:BB:CC:DD:EE:01", "Phone", true), t0 + Duration::seconds(1));

        let peer = snapshot.get("AA:BB:CC:DD:EE:01").unwrap();
        assert_eq!(peer.name, "Phone");
        assert!(peer.connected);
        assert_eq!(peer.last_seen, t0 + Duration::seconds(1));
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn last_seen_never_goes_backwards() {
        let mut snapshot = PeerSnapshot::new();
        let t0 = Utc::now();
        snapshot.upsert(&device("AA:BB:CC:DD:EE:01", "Phone", true), t0);
        snapshot.upsert(&device("AA:BB:CC:DD:EE:01", "Phone", true), t0 - Duration::hours(1));
        assert_eq!(snapshot.get("AA:BB:CC:DD:EE:01").unwrap().last_seen, t0);
    }

    #[test]
    fn serializes_as_address_map() {
        let mut snapshot = PeerSnapshot::new();
        snapshot.upsert(&device("AA:BB:CC:DD:EE:01", "Phone", true), Utc::now());
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["AA:BB:CC:DD:EE:01"]["name"], "Phone");
        assert_eq!(json["AA:BB:CC:DD:EE:01"]["connected"], true);
    }
}
