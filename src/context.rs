//! Shared coordination state, injected explicitly into every component at
//! construction time. There are no process-wide singletons: each node builds
//! one `CoordinationContext`, wraps it in an `Arc`, and hands it to the
//! transport, the periodic tasks, and the service dispatchers.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};

use crate::clock::ClockManager;
use crate::peers::PeerTable;

/// Node ID type: a short string, totally ordered by byte comparison. The
/// ordering is what breaks ties during coordinator election.
pub type NodeId = String;

/// Returns true if the given node ID identifies a balancer. Balancers are
/// excluded from data replication and never participate in election or
/// clock synchronization.
pub fn is_balancer_id(id: &str) -> bool {
    id == "balancer" || id.starts_with("balancer")
}

/// Explicitly shared coordination state of one node.
#[derive(Debug)]
pub struct CoordinationContext {
    /// My node ID.
    pub id: NodeId,

    /// Host/interface this node binds and advertises.
    pub host: String,

    /// Base client-service port (posts +0, messages +100, follow +200,
    /// users +300).
    pub service_port: u16,

    /// Sync port actually bound (the configured base may be occupied, in
    /// which case the bind-retry ladder walks upward).
    bound_sync_port: AtomicU16,

    /// Table of every peer known to this node.
    pub peers: PeerTable,

    /// Logical and physical clocks.
    pub clock: ClockManager,

    /// Whether this node currently believes itself to be the clock-sync
    /// coordinator.
    coordinator: AtomicBool,
}

impl CoordinationContext {
    pub fn new(
        id: NodeId,
        host: String,
        service_port: u16,
        sync_port: u16,
        clock: ClockManager,
    ) -> Self {
        let peers = PeerTable::new(id.clone());
        CoordinationContext {
            id,
            host,
            service_port,
            bound_sync_port: AtomicU16::new(sync_port),
            peers,
            clock,
            coordinator: AtomicBool::new(false),
        }
    }

    /// Records the sync port the listener actually bound.
    pub fn set_bound_sync_port(&self, port: u16) {
        self.bound_sync_port.store(port, Ordering::SeqCst);
    }

    pub fn sync_port(&self) -> u16 {
        self.bound_sync_port.load(Ordering::SeqCst)
    }

    /// Full sync endpoint advertised in announcements.
    pub fn sync_addr(&self) -> String {
        format!("tcp://{}:{}", self.host, self.sync_port())
    }

    pub fn is_coordinator(&self) -> bool {
        self.coordinator.load(Ordering::SeqCst)
    }

    pub fn set_coordinator(&self, flag: bool) {
        self.coordinator.store(flag, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod context_tests {
    use super::*;

    #[test]
    fn balancer_id_rule() {
        assert!(is_balancer_id("balancer"));
        assert!(is_balancer_id("balancer2"));
        assert!(!is_balancer_id("server1"));
        assert!(!is_balancer_id("b1"));
    }

    #[test]
    fn sync_addr_reflects_bound_port() {
        let ctx = CoordinationContext::new(
            "s1".into(),
            "127.0.0.1".into(),
            5555,
            6000,
            ClockManager::new_ephemeral(),
        );
        assert_eq!(ctx.sync_addr(), "tcp://127.0.0.1:6000");
        ctx.set_bound_sync_port(6002);
        assert_eq!(ctx.sync_addr(), "tcp://127.0.0.1:6002");
    }
}
