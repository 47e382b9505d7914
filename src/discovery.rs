//! Peer discovery and liveness monitoring: periodic pings toward every
//! known peer, plus presence announcements so that a freshly started node
//! populates the tables of its peers (and vice versa) without manual
//! intervention.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};

use crate::context::{CoordinationContext, NodeId};
use crate::message::{SyncMessage, SyncReply};
use crate::transport::SyncClient;
use crate::utils::Timer;

/// Delay before the first round of peer pings after startup.
const FIRST_PING_DELAY: Duration = Duration::from_secs(5);

/// Delay before the startup presence announcement, giving the local
/// listeners time to come up first.
const ANNOUNCE_DELAY: Duration = Duration::from_secs(8);

/// The discovery service of one node.
pub struct Discovery {
    ctx: Arc<CoordinationContext>,
    client: Arc<SyncClient>,
    ping_interval: Duration,
}

impl Discovery {
    pub fn new(
        ctx: Arc<CoordinationContext>,
        client: Arc<SyncClient>,
        ping_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Discovery {
            ctx,
            client,
            ping_interval,
        })
    }

    /// Spawns the periodic discovery worker.
    pub fn spawn(
        self: Arc<Self>,
        mut rx_term: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ping_ticker = time::interval_at(
                Instant::now() + FIRST_PING_DELAY,
                self.ping_interval,
            );
            ping_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            let announce_timer = Timer::new();
            if let Err(e) = announce_timer.kickoff(ANNOUNCE_DELAY) {
                pf_error!("error scheduling announcement: {}", e);
            }

            pf_debug!("discovery worker spawned");
            loop {
                tokio::select! {
                    _ = ping_ticker.tick() => {
                        self.ping_peers().await;
                    },

                    () = announce_timer.timeout() => {
                        self.announce();
                    },

                    _ = rx_term.changed() => break,
                }
            }
            pf_debug!("discovery worker exited");
        })
    }

    /// Pings every known peer; the transport flips the liveness flags from
    /// the outcomes.
    async fn ping_peers(&self) {
        let peers = self.ctx.peers.snapshot();
        let mut active = 0;
        let mut inactive = 0;
        for peer in peers {
            let result = self
                .client
                .send_with_response(
                    &peer.id,
                    SyncMessage::ServerPing {
                        from_server: self.ctx.id.clone(),
                    },
                )
                .await;
            match result {
                Ok(reply) if reply.success => active += 1,
                _ => inactive += 1,
            }
        }
        pf_debug!(
            "peer check complete: {} active, {} inactive",
            active,
            inactive
        );
    }

    /// Announces this node's presence to every known peer.
    pub fn announce(&self) {
        pf_info!("announcing presence of {} to peers", self.ctx.id);
        let announcement = SyncMessage::ServerAnnouncement {
            server_id: self.ctx.id.clone(),
            server_address: self.ctx.host.clone(),
            service_port: self.ctx.service_port,
            sync_address: self.ctx.sync_addr(),
        };
        for peer in self.ctx.peers.snapshot() {
            self.client.send(peer.id, announcement.clone());
        }
    }

    /// Handles an inbound `SERVER_ANNOUNCEMENT`: upserts the peer and, if
    /// it was previously unknown, announces back so the newcomer learns of
    /// this node quickly.
    pub fn handle_announcement(
        &self,
        server_id: NodeId,
        server_address: String,
        service_port: u16,
        sync_address: String,
    ) -> SyncReply {
        let Some(sync_port) = extract_port(&sync_address) else {
            pf_warn!("malformed sync address '{}'", sync_address);
            return SyncReply::err(format!(
                "malformed sync address: {}",
                sync_address
            ));
        };

        let newcomer = self.ctx.peers.upsert(
            server_id.clone(),
            server_address,
            sync_port,
            Some(service_port),
        );
        if newcomer {
            pf_info!("discovered new peer {}", server_id);
            self.announce();
        } else {
            pf_debug!("refreshed peer entry for {}", server_id);
        }
        SyncReply::ok()
    }

    /// Handles an inbound `SERVER_PING`.
    pub fn handle_ping(&self, from_server: &str) -> SyncReply {
        pf_trace!("ping received from {}", from_server);
        SyncReply::pong(self.ctx.id.clone())
    }
}

/// Extracts the port from a sync endpoint, tolerating both the
/// `tcp://host:port` and bare `host:port` forms.
pub fn extract_port(address: &str) -> Option<u16> {
    let trimmed = address.strip_prefix("tcp://").unwrap_or(address);
    let (_, port) = trimmed.rsplit_once(':')?;
    port.parse().ok()
}
