//! Berkeley physical-clock synchronization. The elected coordinator
//! periodically polls every active peer for its clock difference, averages
//! the answers (its own difference counting as zero), corrects its own
//! offset by the average, and sends each responder the correction that
//! brings it onto the same average. Round-trip delay is deliberately not
//! compensated.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};

use crate::context::{CoordinationContext, NodeId};
use crate::message::{SyncMessage, SyncReply};
use crate::transport::SyncClient;

/// How long a round stays open collecting `TIME_RESPONSE`s; responses
/// arriving later are discarded.
const RESPONSE_WINDOW: Duration = Duration::from_secs(3);

/// The berkeley synchronization driver/responder of one backend.
pub struct BerkeleySync {
    ctx: Arc<CoordinationContext>,
    client: Arc<SyncClient>,
    sync_interval: Duration,

    /// Clock differences collected during the open round.
    diffs: Mutex<HashMap<NodeId, i64>>,

    /// Whether a collection window is currently open.
    round_open: AtomicBool,
}

impl BerkeleySync {
    pub fn new(
        ctx: Arc<CoordinationContext>,
        client: Arc<SyncClient>,
        sync_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(BerkeleySync {
            ctx,
            client,
            sync_interval,
            diffs: Mutex::new(HashMap::new()),
            round_open: AtomicBool::new(false),
        })
    }

    /// Spawns the periodic synchronization worker. Rounds execute only
    /// while this node believes itself coordinator.
    pub fn spawn(
        self: Arc<Self>,
        mut rx_term: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(self.sync_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await; // skip the immediate first tick

            pf_debug!("clock sync worker spawned");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if self.ctx.is_coordinator() {
                            self.run_round().await;
                        }
                    },

                    _ = rx_term.changed() => break,
                }
            }
            pf_debug!("clock sync worker exited");
        })
    }

    /// Executes one synchronization round as coordinator.
    async fn run_round(&self) {
        let active = self.ctx.peers.active_ids();
        if active.is_empty() {
            pf_debug!("no active peers to synchronize with");
            return;
        }
        pf_info!(
            "starting clock synchronization round with {} peers",
            active.len()
        );

        {
            let mut diffs = self.diffs.lock().unwrap();
            diffs.clear();
            diffs.insert(self.ctx.id.clone(), 0);
        }
        self.round_open.store(true, Ordering::SeqCst);

        self.client.broadcast(SyncMessage::TimeRequest {
            coordinator: self.ctx.id.clone(),
            timestamp: self.ctx.clock.physical().now_ms(),
        });

        time::sleep(RESPONSE_WINDOW).await;
        self.round_open.store(false, Ordering::SeqCst);

        let diffs = self.diffs.lock().unwrap().clone();
        let average = round_average(&diffs);
        pf_info!(
            "average clock offset over {} samples: {} ms",
            diffs.len(),
            average
        );

        match self.ctx.clock.shift_physical(-average) {
            Ok(offset) => {
                pf_debug!("coordinator offset adjusted to {} ms", offset);
            }
            Err(e) => pf_error!("error persisting clock offset: {}", e),
        }

        for (peer, diff) in diffs {
            if peer == self.ctx.id {
                continue;
            }
            let adjustment = average - diff;
            pf_debug!(
                "sending clock adjustment {} ms to {}",
                adjustment,
                peer
            );
            self.client.send(
                peer,
                SyncMessage::ClockAdjustment {
                    coordinator: self.ctx.id.clone(),
                    adjustment,
                },
            );
        }
    }

    /// Handles an inbound `TIME_REQUEST` from the coordinator: report how
    /// far our clock sits from the coordinator's. The coordinator itself
    /// ignores the request.
    pub fn handle_time_request(
        &self,
        coordinator: NodeId,
        timestamp: i64,
    ) -> SyncReply {
        if self.ctx.is_coordinator() {
            return SyncReply::ok();
        }

        let local = self.ctx.clock.physical().now_ms();
        let difference = local - timestamp;
        pf_debug!(
            "time request from coordinator {}, difference {} ms",
            coordinator,
            difference
        );
        self.client.send(
            coordinator,
            SyncMessage::TimeResponse {
                server_id: self.ctx.id.clone(),
                request_timestamp: timestamp,
                response_timestamp: local,
                time_difference: difference,
            },
        );
        SyncReply::ok()
    }

    /// Handles an inbound `TIME_RESPONSE`. Only meaningful at the
    /// coordinator while a round is open; anything else is discarded.
    pub fn handle_time_response(
        &self,
        server_id: NodeId,
        time_difference: i64,
    ) -> SyncReply {
        if self.ctx.is_coordinator() && self.round_open.load(Ordering::SeqCst)
        {
            pf_debug!(
                "time response from {}: {} ms",
                server_id,
                time_difference
            );
            self.diffs
                .lock()
                .unwrap()
                .insert(server_id, time_difference);
        } else {
            pf_debug!("discarding late time response from {}", server_id);
        }
        SyncReply::ok()
    }

    /// Handles an inbound `CLOCK_ADJUSTMENT` from the coordinator.
    pub fn handle_clock_adjustment(
        &self,
        coordinator: NodeId,
        adjustment: i64,
    ) -> SyncReply {
        pf_info!(
            "clock adjustment {} ms received from coordinator {}",
            adjustment,
            coordinator
        );
        match self.ctx.clock.shift_physical(adjustment) {
            Ok(offset) => {
                pf_debug!("clock adjusted, new offset {} ms", offset);
                SyncReply::ok()
            }
            Err(e) => SyncReply::err(e),
        }
    }

    #[cfg(test)]
    fn open_round_for_test(&self) {
        let mut diffs = self.diffs.lock().unwrap();
        diffs.clear();
        diffs.insert(self.ctx.id.clone(), 0);
        self.round_open.store(true, Ordering::SeqCst);
    }

    #[cfg(test)]
    fn collected(&self) -> HashMap<NodeId, i64> {
        self.diffs.lock().unwrap().clone()
    }
}

/// Integer mean of the collected differences.
fn round_average(diffs: &HashMap<NodeId, i64>) -> i64 {
    if diffs.is_empty() {
        return 0;
    }
    let sum: i64 = diffs.values().sum();
    sum / diffs.len() as i64
}

#[cfg(test)]
mod berkeley_tests {
    use super::*;
    use crate::clock::ClockManager;
    use crate::utils::RookeryError;

    fn berkeley(
        me: &str,
        coordinator: bool,
    ) -> (Arc<CoordinationContext>, Arc<BerkeleySync>) {
        let ctx = Arc::new(CoordinationContext::new(
            me.into(),
            "127.0.0.1".into(),
            5555,
            41600,
            ClockManager::new_ephemeral(),
        ));
        ctx.set_coordinator(coordinator);
        let client = SyncClient::new(ctx.clone());
        let sync =
            BerkeleySync::new(ctx.clone(), client, Duration::from_secs(60));
        (ctx, sync)
    }

    #[test]
    fn average_over_samples() {
        let mut diffs = HashMap::new();
        diffs.insert("s3".to_string(), 0);
        diffs.insert("s1".to_string(), 100);
        diffs.insert("s2".to_string(), -40);
        assert_eq!(round_average(&diffs), 20);
        assert_eq!(round_average(&HashMap::new()), 0);
    }

    #[test]
    fn peer_adjustments_converge_on_average() {
        // one peer +100 ms ahead, one 40 ms behind: every responder lands
        // on the round average after applying `average - diff`
        let mut diffs = HashMap::new();
        diffs.insert("s3".to_string(), 0);
        diffs.insert("s1".to_string(), 100);
        diffs.insert("s2".to_string(), -40);
        let average = round_average(&diffs);

        let s1_after = 100 + (average - 100);
        let s2_after = -40 + (average - (-40));
        assert_eq!(s1_after, average);
        assert_eq!(s2_after, average);
        assert_eq!(s1_after, s2_after);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn responses_gated_by_round_window() -> Result<(), RookeryError> {
        let (_ctx, sync) = berkeley("s3", true);

        // no round open yet: responses are late and discarded
        sync.handle_time_response("s1".into(), 50);
        assert!(!sync.collected().contains_key("s1"));

        sync.open_round_for_test();
        sync.handle_time_response("s1".into(), 50);
        assert_eq!(sync.collected()["s1"], 50);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn non_coordinator_ignores_responses() -> Result<(), RookeryError>
    {
        let (_ctx, sync) = berkeley("s1", false);
        sync.open_round_for_test();
        sync.handle_time_response("s2".into(), 50);
        // round bookkeeping only ever fills at the coordinator
        assert!(!sync.collected().contains_key("s2"));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn adjustment_shifts_local_offset() -> Result<(), RookeryError> {
        let (ctx, sync) = berkeley("s1", false);
        let reply = sync.handle_clock_adjustment("s3".into(), -75);
        assert!(reply.success);
        assert_eq!(ctx.clock.physical().offset(), -75);

        let reply = sync.handle_clock_adjustment("s3".into(), 25);
        assert!(reply.success);
        assert_eq!(ctx.clock.physical().offset(), -50);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn coordinator_ignores_time_requests() -> Result<(), RookeryError>
    {
        let (ctx, sync) = berkeley("s3", true);
        let before = ctx.clock.physical().offset();
        let reply = sync.handle_time_request("s3".into(), 123);
        assert!(reply.success);
        assert_eq!(ctx.clock.physical().offset(), before);
        Ok(())
    }
}
