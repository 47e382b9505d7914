//! Inter-node sync transport. Each node owns one inbound listener serving
//! every control-plane message type, and dials peers through short-lived
//! outbound connections, one connection per round trip. Liveness flags in
//! the peer table follow the outcome of every outbound call, and a per-peer
//! suppression window damps retry storms toward dead peers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};

use crate::context::{CoordinationContext, NodeId};
use crate::message::{SyncEnvelope, SyncMessage, SyncReply};
use crate::peers::PeerEntry;
use crate::utils::{
    read_frame, tcp_bind_with_retry, write_frame, RookeryError,
};

/// Timeout applied to each step of a fire-and-forget send.
const SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeout applied to each step of a synchronous call.
const CALL_TIMEOUT: Duration = Duration::from_secs(3);

/// After a failed attempt, fire-and-forget sends toward that peer are
/// silently dropped for this long. Synchronous calls are never suppressed
/// because their callers block on the answer.
const RETRY_SUPPRESS_WINDOW: Duration = Duration::from_secs(10);

/// Handler for inbound sync messages. Backends plug in the full
/// coordination stack; the balancer plugs in its reduced responder.
#[async_trait]
pub trait SyncService: Send + Sync + 'static {
    async fn handle(&self, message: SyncMessage) -> SyncReply;
}

/// Outbound half of the transport. Cheap to clone through `Arc`; every
/// coordination task holds one.
pub struct SyncClient {
    ctx: Arc<CoordinationContext>,
    last_failed: Mutex<HashMap<NodeId, Instant>>,
}

impl SyncClient {
    pub fn new(ctx: Arc<CoordinationContext>) -> Arc<Self> {
        Arc::new(SyncClient {
            ctx,
            last_failed: Mutex::new(HashMap::new()),
        })
    }

    /// Fire-and-forget best-effort send on a background task. Dropped
    /// silently if the peer failed within the suppression window.
    pub fn send(self: &Arc<Self>, peer: NodeId, message: SyncMessage) {
        if self.suppressed(&peer) {
            pf_debug!("suppressing send -> {} (recent failure)", peer);
            return;
        }

        let client = self.clone();
        tokio::spawn(async move {
            let Some(entry) = client.ctx.peers.get(&peer) else {
                pf_warn!("send to unknown peer {}", peer);
                return;
            };
            match client.call_inner(&entry, &message, SEND_TIMEOUT).await {
                Ok(_) => client.note_success(&peer),
                Err(e) => {
                    pf_debug!("send -> {} failed: {}", peer, e);
                    client.note_failure(&peer);
                }
            }
        });
    }

    /// Synchronous round trip. Always attempted regardless of the
    /// suppression window; a failure marks the peer inactive and surfaces
    /// as an error to the caller.
    pub async fn send_with_response(
        &self,
        peer: &str,
        message: SyncMessage,
    ) -> Result<SyncReply, RookeryError> {
        let Some(entry) = self.ctx.peers.get(peer) else {
            return logged_err!("unknown peer {}", peer);
        };
        match self.call_inner(&entry, &message, CALL_TIMEOUT).await {
            Ok(reply) => {
                self.note_success(peer);
                Ok(reply)
            }
            Err(e) => {
                self.note_failure(peer);
                Err(RookeryError(format!(
                    "peer {} unreachable: {}",
                    peer, e
                )))
            }
        }
    }

    /// Fire-and-forget send to every peer currently marked active,
    /// excluding self.
    pub fn broadcast(self: &Arc<Self>, message: SyncMessage) {
        for peer in self.ctx.peers.active_ids() {
            self.send(peer, message.clone());
        }
    }

    /// One full round trip against a peer: fresh connection, stamped
    /// envelope out, reply in, Lamport merge on the reply. The connection
    /// is dropped on every exit path.
    async fn call_inner(
        &self,
        entry: &PeerEntry,
        message: &SyncMessage,
        step_timeout: Duration,
    ) -> Result<SyncReply, RookeryError> {
        let addr = format!("{}:{}", entry.address, entry.sync_port);
        let mut conn =
            time::timeout(step_timeout, TcpStream::connect(&addr)).await??;

        let envelope = SyncEnvelope {
            logical_time: Some(self.ctx.clock.logical().tick()),
            message: message.clone(),
        };
        time::timeout(step_timeout, write_frame(&mut conn, &envelope))
            .await??;

        let reply: SyncReply =
            time::timeout(step_timeout, read_frame(&mut conn)).await??;
        if let Some(received) = reply.logical_time {
            self.ctx.clock.logical().observe(received);
        }
        Ok(reply)
    }

    fn suppressed(&self, peer: &str) -> bool {
        self.last_failed
            .lock()
            .unwrap()
            .get(peer)
            .map(|at| at.elapsed() < RETRY_SUPPRESS_WINDOW)
            .unwrap_or(false)
    }

    fn note_success(&self, peer: &str) {
        self.last_failed.lock().unwrap().remove(peer);
        if self.ctx.peers.set_active(peer, true) {
            pf_info!("peer {} is active again", peer);
        }
    }

    fn note_failure(&self, peer: &str) {
        self.last_failed
            .lock()
            .unwrap()
            .insert(peer.to_string(), Instant::now());
        if self.ctx.peers.set_active(peer, false) {
            pf_info!("peer {} is not responding, marked inactive", peer);
        }
    }
}

/// Inbound half of the transport: binds the sync port (walking up the
/// retry ladder if occupied) and serves every accepted connection through
/// the given `SyncService`. Failure to bind is fatal for the node.
pub struct SyncListener;

impl SyncListener {
    pub async fn new_and_spawn(
        ctx: Arc<CoordinationContext>,
        service: Arc<dyn SyncService>,
    ) -> Result<JoinHandle<()>, RookeryError> {
        let (listener, bound_port) =
            tcp_bind_with_retry(&ctx.host, ctx.sync_port()).await?;
        ctx.set_bound_sync_port(bound_port);
        pf_info!("sync listener serving on '{}'", ctx.sync_addr());

        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((conn, _addr)) => {
                        let ctx = ctx.clone();
                        let service = service.clone();
                        tokio::spawn(async move {
                            Self::serve_conn(ctx, service, conn).await;
                        });
                    }
                    Err(e) => {
                        pf_warn!("error accepting sync connection: {}", e);
                    }
                }
            }
        });
        Ok(handle)
    }

    /// Serves request/reply exchanges on one inbound connection until the
    /// peer closes it. The Lamport merge happens before dispatch, and the
    /// reply is stamped with the post-merge clock.
    async fn serve_conn(
        ctx: Arc<CoordinationContext>,
        service: Arc<dyn SyncService>,
        mut conn: TcpStream,
    ) {
        loop {
            let raw: serde_json::Value = match read_frame(&mut conn).await {
                Ok(raw) => raw,
                Err(_) => return, // peer closed or sent garbage
            };

            if let Some(received) =
                raw.get("logicalTime").and_then(|v| v.as_u64())
            {
                ctx.clock.logical().observe(received);
            }

            let mut reply =
                match serde_json::from_value::<SyncEnvelope>(raw.clone()) {
                    Ok(envelope) => service.handle(envelope.message).await,
                    Err(_) => {
                        let action = raw
                            .get("action")
                            .and_then(|v| v.as_str())
                            .unwrap_or("<missing>");
                        SyncReply::err(format!("unknown action: {}", action))
                    }
                };
            reply.logical_time = Some(ctx.clock.logical().tick());

            if let Err(e) = write_frame(&mut conn, &reply).await {
                pf_debug!("error writing sync reply: {}", e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod transport_tests {
    use super::*;
    use crate::clock::ClockManager;

    struct PongService {
        id: NodeId,
    }

    #[async_trait]
    impl SyncService for PongService {
        async fn handle(&self, message: SyncMessage) -> SyncReply {
            match message {
                SyncMessage::ServerPing { .. } => {
                    SyncReply::pong(self.id.clone())
                }
                _ => SyncReply::ok(),
            }
        }
    }

    fn test_ctx(id: &str, sync_port: u16) -> Arc<CoordinationContext> {
        Arc::new(CoordinationContext::new(
            id.into(),
            "127.0.0.1".into(),
            5555,
            sync_port,
            ClockManager::new_ephemeral(),
        ))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn call_round_trip_updates_liveness() -> Result<(), RookeryError> {
        let server_ctx = test_ctx("s2", 41300);
        let _listener = SyncListener::new_and_spawn(
            server_ctx.clone(),
            Arc::new(PongService { id: "s2".into() }),
        )
        .await?;

        let client_ctx = test_ctx("s1", 41310);
        client_ctx.peers.upsert(
            "s2".into(),
            "127.0.0.1".into(),
            server_ctx.sync_port(),
            None,
        );
        client_ctx.peers.set_active("s2", false);

        let client = SyncClient::new(client_ctx.clone());
        let reply = client
            .send_with_response(
                "s2",
                SyncMessage::ServerPing {
                    from_server: "s1".into(),
                },
            )
            .await?;
        assert!(reply.success);
        assert_eq!(reply.server_id.as_deref(), Some("s2"));
        assert!(client_ctx.peers.get("s2").unwrap().active);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn failed_call_marks_inactive_and_suppresses(
    ) -> Result<(), RookeryError> {
        let client_ctx = test_ctx("s1", 41320);
        // nothing listens on this port
        client_ctx.peers.upsert(
            "s2".into(),
            "127.0.0.1".into(),
            41399,
            None,
        );

        let client = SyncClient::new(client_ctx.clone());
        let result = client
            .send_with_response(
                "s2",
                SyncMessage::ServerPing {
                    from_server: "s1".into(),
                },
            )
            .await;
        assert!(result.is_err());
        assert!(!client_ctx.peers.get("s2").unwrap().active);
        assert!(client.suppressed("s2"));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn lamport_clocks_advance_through_calls(
    ) -> Result<(), RookeryError> {
        let server_ctx = test_ctx("s2", 41330);
        let _listener = SyncListener::new_and_spawn(
            server_ctx.clone(),
            Arc::new(PongService { id: "s2".into() }),
        )
        .await?;

        let client_ctx = test_ctx("s1", 41340);
        client_ctx.peers.upsert(
            "s2".into(),
            "127.0.0.1".into(),
            server_ctx.sync_port(),
            None,
        );

        let client = SyncClient::new(client_ctx.clone());
        let before = client_ctx.clock.logical().read();
        client
            .send_with_response(
                "s2",
                SyncMessage::ServerPing {
                    from_server: "s1".into(),
                },
            )
            .await?;
        // one tick for the send, one merge of the server's reply stamp
        assert!(client_ctx.clock.logical().read() >= before + 2);
        assert!(server_ctx.clock.logical().read() >= 2);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn unknown_action_gets_error_reply() -> Result<(), RookeryError> {
        let server_ctx = test_ctx("s2", 41350);
        let _listener = SyncListener::new_and_spawn(
            server_ctx.clone(),
            Arc::new(PongService { id: "s2".into() }),
        )
        .await?;

        let mut conn = TcpStream::connect(format!(
            "127.0.0.1:{}",
            server_ctx.sync_port()
        ))
        .await?;
        let bogus = serde_json::json!({ "action": "FROBNICATE" });
        write_frame(&mut conn, &bogus).await?;
        let reply: SyncReply = read_frame(&mut conn).await?;
        assert!(!reply.success);
        assert!(reply.error.unwrap().contains("FROBNICATE"));
        Ok(())
    }
}
