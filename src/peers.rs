//! Table of peers known to this node. Entries are seeded from configuration
//! at boot and upserted by discovery announcements; the `active` flag
//! follows ping results and transport outcomes. Entries are never evicted
//! in normal operation.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::context::{is_balancer_id, NodeId};

/// One known peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub id: NodeId,
    pub address: String,
    pub sync_port: u16,
    /// Client-service base port, learned from the peer's announcement.
    /// Backends do not need each other's service ports; the balancer routes
    /// only to peers whose service port is known.
    pub service_port: Option<u16>,
    pub active: bool,
}

/// Peer table shared across the coordination tasks. Mutated under a short
/// exclusive lock; readers take snapshots for iteration.
#[derive(Debug)]
pub struct PeerTable {
    me: NodeId,
    entries: Mutex<HashMap<NodeId, PeerEntry>>,
}

impl PeerTable {
    pub fn new(me: NodeId) -> Self {
        PeerTable {
            me,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Inserts or refreshes a peer entry. A fresh upsert always marks the
    /// peer active (we just heard from it or were told it exists). Returns
    /// true if the peer was previously unknown.
    pub fn upsert(
        &self,
        id: NodeId,
        address: String,
        sync_port: u16,
        service_port: Option<u16>,
    ) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(&id) {
            Some(entry) => {
                entry.address = address;
                entry.sync_port = sync_port;
                if service_port.is_some() {
                    entry.service_port = service_port;
                }
                entry.active = true;
                false
            }
            None => {
                entries.insert(
                    id.clone(),
                    PeerEntry {
                        id,
                        address,
                        sync_port,
                        service_port,
                        active: true,
                    },
                );
                true
            }
        }
    }

    /// Flips a peer's active flag. Returns true if the flag actually
    /// changed (callers log liveness transitions, not every observation).
    pub fn set_active(&self, id: &str, active: bool) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(id) {
            Some(entry) if entry.active != active => {
                entry.active = active;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<PeerEntry> {
        self.entries.lock().unwrap().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.lock().unwrap().contains_key(id)
    }

    /// Snapshot of all entries except my own, sorted by ID for
    /// deterministic iteration.
    pub fn snapshot(&self) -> Vec<PeerEntry> {
        let entries = self.entries.lock().unwrap();
        let mut peers: Vec<PeerEntry> = entries
            .values()
            .filter(|p| p.id != self.me)
            .cloned()
            .collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    /// IDs of peers currently marked active, excluding myself.
    pub fn active_ids(&self) -> Vec<NodeId> {
        self.snapshot()
            .into_iter()
            .filter(|p| p.active)
            .map(|p| p.id)
            .collect()
    }

    /// IDs of active peers that host data, i.e. excluding balancers.
    /// Replication events fan out to exactly this set.
    pub fn active_data_ids(&self) -> Vec<NodeId> {
        self.active_ids()
            .into_iter()
            .filter(|id| !is_balancer_id(id))
            .collect()
    }

    /// Active non-balancer peers whose service port is known; this is the
    /// balancer's routing view.
    pub fn routable_backends(&self) -> Vec<PeerEntry> {
        self.snapshot()
            .into_iter()
            .filter(|p| {
                p.active && !is_balancer_id(&p.id) && p.service_port.is_some()
            })
            .collect()
    }
}
