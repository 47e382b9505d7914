//! Bully coordinator election. The coordinator (highest node ID among the
//! live backends) drives the berkeley clock-sync rounds; every backend
//! periodically verifies that a coordinator exists and is alive, and starts
//! an election when it is not. Transient dual-coordinator windows are
//! closed by the step-down rule on `COORDINATOR` announcements.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};

use crate::context::{CoordinationContext, NodeId};
use crate::message::{SyncMessage, SyncReply};
use crate::transport::SyncClient;
use crate::utils::Timer;

/// How long an election waits for higher-ID peers to respond before the
/// initiator declares itself coordinator.
const ELECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// The bully election state machine of one backend.
pub struct BullyElection {
    ctx: Arc<CoordinationContext>,
    client: Arc<SyncClient>,
    check_interval: Duration,

    /// Guard against concurrent election rounds from this node.
    election_in_progress: AtomicBool,

    /// Higher-ID peers the in-flight election is waiting on.
    awaiting: Mutex<HashSet<NodeId>>,

    /// Peers that answered the in-flight election.
    responded: Mutex<HashSet<NodeId>>,

    /// Fires when the response-collection window of an election closes.
    response_timer: Timer,
}

impl BullyElection {
    pub fn new(
        ctx: Arc<CoordinationContext>,
        client: Arc<SyncClient>,
        check_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(BullyElection {
            ctx,
            client,
            check_interval,
            election_in_progress: AtomicBool::new(false),
            awaiting: Mutex::new(HashSet::new()),
            responded: Mutex::new(HashSet::new()),
            response_timer: Timer::new(),
        })
    }

    /// Spawns the periodic coordinator-check worker.
    pub fn spawn(
        self: Arc<Self>,
        mut rx_term: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(self.check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await; // skip the immediate first tick

            pf_debug!("coordinator check worker spawned");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.check_coordinator().await;
                    },

                    () = self.response_timer.timeout() => {
                        self.finish_election();
                    },

                    _ = rx_term.changed() => break,
                }
            }
            pf_debug!("coordinator check worker exited");
        })
    }

    /// One periodic check: heartbeat if I am coordinator, otherwise verify
    /// someone else is, electing if nobody answers for the role.
    async fn check_coordinator(&self) {
        if self.ctx.is_coordinator() {
            let heartbeat = SyncMessage::CoordinatorHeartbeat {
                coordinator_id: self.ctx.id.clone(),
            };
            self.client.broadcast(heartbeat);
            pf_debug!("sent coordinator heartbeat");
            return;
        }

        match self.find_current_coordinator().await {
            None => {
                pf_info!("no coordinator found, starting election");
                self.start_election();
            }
            Some(coordinator) => {
                pf_debug!("verifying coordinator {} is alive", coordinator);
                let ping = SyncMessage::CoordinatorPing {
                    from_server: self.ctx.id.clone(),
                };
                if self
                    .client
                    .send_with_response(&coordinator, ping)
                    .await
                    .is_err()
                {
                    pf_info!(
                        "coordinator {} did not answer, starting election",
                        coordinator
                    );
                    self.start_election();
                }
            }
        }
    }

    /// Asks each active peer whether it believes itself coordinator.
    async fn find_current_coordinator(&self) -> Option<NodeId> {
        for peer in self.ctx.peers.active_ids() {
            let request = SyncMessage::IsCoordinatorRequest {
                from_server: self.ctx.id.clone(),
            };
            match self.client.send_with_response(&peer, request).await {
                Ok(reply) if reply.is_coordinator == Some(true) => {
                    return Some(peer);
                }
                Ok(_) => {}
                Err(e) => {
                    pf_debug!("coordinator query to {} failed: {}", peer, e);
                }
            }
        }
        None
    }

    /// Starts an election round unless one is already in flight.
    pub fn start_election(&self) {
        if self
            .election_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            pf_debug!("election already in progress, ignoring");
            return;
        }

        pf_info!("starting coordinator election");
        let higher: HashSet<NodeId> = self
            .ctx
            .peers
            .active_ids()
            .into_iter()
            .filter(|id| id.as_str() > self.ctx.id.as_str())
            .collect();

        if higher.is_empty() {
            // nobody outranks me
            self.declare_coordinator();
            return;
        }

        *self.awaiting.lock().unwrap() = higher.clone();
        self.responded.lock().unwrap().clear();
        for peer in higher {
            pf_debug!("sending election message to {}", peer);
            self.client.send(
                peer,
                SyncMessage::Election {
                    from_server: self.ctx.id.clone(),
                },
            );
        }
        if let Err(e) = self.response_timer.kickoff(ELECTION_TIMEOUT) {
            pf_error!("error arming election timer: {}", e);
        }
    }

    /// Closes the response window of the in-flight election.
    fn finish_election(&self) {
        if !self.election_in_progress.load(Ordering::SeqCst) {
            return; // round already settled by a COORDINATOR message
        }

        let awaiting = self.awaiting.lock().unwrap().clone();
        let responded = self.responded.lock().unwrap();
        let any_higher_alive =
            awaiting.iter().any(|id| responded.contains(id));
        drop(responded);

        if any_higher_alive {
            pf_info!(
                "a higher-id peer responded, awaiting its coordinator claim"
            );
            self.election_in_progress.store(false, Ordering::SeqCst);
        } else {
            self.declare_coordinator();
        }
    }

    /// Declares this node coordinator and tells every active peer.
    fn declare_coordinator(&self) {
        self.ctx.set_coordinator(true);
        pf_info!("this node was elected coordinator");
        self.client.broadcast(SyncMessage::Coordinator {
            coordinator_id: self.ctx.id.clone(),
        });
        self.election_in_progress.store(false, Ordering::SeqCst);
    }

    /// Handles an inbound `ELECTION` from a (lower-ID) initiator: always
    /// answer, and bully with an election of our own if we outrank it.
    pub fn handle_election(&self, from_server: NodeId) -> SyncReply {
        pf_info!("election message received from {}", from_server);
        self.client.send(
            from_server.clone(),
            SyncMessage::ElectionResponse {
                from_server: self.ctx.id.clone(),
            },
        );
        if self.ctx.id.as_str() > from_server.as_str() {
            self.start_election();
        }
        SyncReply::ok()
    }

    /// Handles an inbound `ELECTION_RESPONSE`.
    pub fn handle_election_response(&self, from_server: NodeId) -> SyncReply {
        pf_debug!("election response received from {}", from_server);
        self.responded.lock().unwrap().insert(from_server);
        SyncReply::ok()
    }

    /// Handles an inbound `COORDINATOR` announcement. A node that believed
    /// itself coordinator steps down when a higher ID claims the role.
    pub fn handle_coordinator(&self, coordinator_id: NodeId) -> SyncReply {
        if self.ctx.is_coordinator()
            && self.ctx.id.as_str() < coordinator_id.as_str()
        {
            self.ctx.set_coordinator(false);
            pf_info!("stepping down, {} is now coordinator", coordinator_id);
        } else if !self.ctx.is_coordinator() {
            pf_info!("acknowledging {} as coordinator", coordinator_id);
        }
        self.election_in_progress.store(false, Ordering::SeqCst);
        SyncReply::ok()
    }
}

#[cfg(test)]
mod election_tests {
    use super::*;
    use crate::clock::ClockManager;
    use crate::utils::RookeryError;

    fn election(
        me: &str,
        peers: &[(&str, bool)],
    ) -> (Arc<CoordinationContext>, Arc<BullyElection>) {
        let ctx = Arc::new(CoordinationContext::new(
            me.into(),
            "127.0.0.1".into(),
            5555,
            41500,
            ClockManager::new_ephemeral(),
        ));
        for (id, active) in peers {
            ctx.peers.upsert((*id).into(), "127.0.0.1".into(), 1, None);
            ctx.peers.set_active(id, *active);
        }
        let client = SyncClient::new(ctx.clone());
        let bully =
            BullyElection::new(ctx.clone(), client, Duration::from_secs(30));
        (ctx, bully)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn highest_id_declares_itself() -> Result<(), RookeryError> {
        let (ctx, bully) =
            election("s3", &[("s1", true), ("s2", true)]);
        bully.start_election();
        assert!(ctx.is_coordinator());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn inactive_higher_peers_do_not_block(
    ) -> Result<(), RookeryError> {
        // s9 outranks us but is down; the election must not wait on it
        let (ctx, bully) = election("s2", &[("s1", true), ("s9", false)]);
        bully.start_election();
        assert!(ctx.is_coordinator());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn window_without_responses_declares_self(
    ) -> Result<(), RookeryError> {
        let (ctx, bully) = election("s2", &[("s3", true)]);
        bully.start_election();
        assert!(!ctx.is_coordinator());

        // nobody responded within the window
        bully.finish_election();
        assert!(ctx.is_coordinator());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn response_from_higher_peer_defers(
    ) -> Result<(), RookeryError> {
        let (ctx, bully) = election("s2", &[("s3", true)]);
        bully.start_election();
        bully.handle_election_response("s3".into());
        bully.finish_election();
        assert!(!ctx.is_coordinator());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn coordinator_claim_forces_step_down(
    ) -> Result<(), RookeryError> {
        let (ctx, bully) = election("s2", &[("s1", true)]);
        bully.start_election();
        assert!(ctx.is_coordinator());

        bully.handle_coordinator("s3".into());
        assert!(!ctx.is_coordinator());

        // a lower-id claim must not dethrone us
        bully.start_election();
        bully.handle_coordinator("s1".into());
        assert!(ctx.is_coordinator());
        Ok(())
    }
}
