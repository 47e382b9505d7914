//! The front-door balancer: terminates client connections, picks one live
//! backend round-robin, forwards the untouched payload to the service port
//! owning the request's action, and relays the reply. Also hosts the
//! reduced sync responder that registers backends and answers pings but
//! never participates in election or clock sync.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

use crate::context::CoordinationContext;
use crate::discovery::Discovery;
use crate::message::{SyncMessage, SyncReply};
use crate::peers::PeerEntry;
use crate::service::action_port_offset;
use crate::transport::SyncService;
use crate::utils::{
    read_frame_raw, write_frame, write_frame_raw, RookeryError,
};

/// Timeout for dialing a backend service port.
const FORWARD_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Timeout for a backend to answer a forwarded request.
const FORWARD_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Round-robin request router over the live backends.
pub struct BalancerRouter {
    ctx: Arc<CoordinationContext>,
    next_index: AtomicUsize,
}

impl BalancerRouter {
    pub fn new(ctx: Arc<CoordinationContext>) -> Arc<Self> {
        Arc::new(BalancerRouter {
            ctx,
            next_index: AtomicUsize::new(0),
        })
    }

    /// Binds the client-facing router port and spawns the routing loop.
    pub async fn new_and_spawn(
        self: Arc<Self>,
        port: u16,
    ) -> Result<JoinHandle<()>, RookeryError> {
        let listener = TcpListener::bind(format!("{}:{}", self.ctx.host, port))
            .await
            .map_err(|e| {
                RookeryError(format!(
                    "balancer failed to bind router port {}: {}",
                    port, e
                ))
            })?;
        pf_info!("balancer routing clients on port {}", port);

        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((conn, _addr)) => {
                        let router = self.clone();
                        tokio::spawn(async move {
                            router.serve_conn(conn).await;
                        });
                    }
                    Err(e) => {
                        pf_warn!(
                            "balancer error accepting client connection: {}",
                            e
                        );
                    }
                }
            }
        });
        Ok(handle)
    }

    /// Selects the next backend via the wrapping round-robin counter over
    /// the current snapshot of routable backends.
    fn pick_backend(&self) -> Option<PeerEntry> {
        let backends = self.ctx.peers.routable_backends();
        if backends.is_empty() {
            return None;
        }
        let index =
            self.next_index.fetch_add(1, Ordering::SeqCst) % backends.len();
        Some(backends[index].clone())
    }

    async fn serve_conn(&self, mut conn: TcpStream) {
        loop {
            let payload = match read_frame_raw(&mut conn).await {
                Ok(payload) => payload,
                Err(_) => return, // client closed
            };

            let reply = self.route(&payload).await;
            let written = match reply {
                Ok(bytes) => write_frame_raw(&mut conn, &bytes).await,
                Err(e) => write_frame(&mut conn, &e).await,
            };
            if written.is_err() {
                return;
            }
        }
    }

    /// Routes one request payload, returning either the backend's raw reply
    /// or the error reply to relay instead.
    async fn route(&self, payload: &[u8]) -> Result<Vec<u8>, SyncReply> {
        let action = serde_json::from_slice::<serde_json::Value>(payload)
            .ok()
            .and_then(|v| {
                v.get("action").and_then(|a| a.as_str()).map(String::from)
            })
            .unwrap_or_default();

        let Some(backend) = self.pick_backend() else {
            pf_warn!("no backend available for client request");
            return Err(SyncReply::err("no server available"));
        };

        let offset = action_port_offset(&action);
        let port = backend.service_port.unwrap_or_default() + offset;
        pf_debug!(
            "forwarding '{}' to backend {} port {}",
            action,
            backend.id,
            port
        );

        match self.forward(&backend.address, port, payload).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                pf_warn!(
                    "error forwarding to backend {}: {}",
                    backend.id,
                    e
                );
                Err(SyncReply::err("communication error"))
            }
        }
    }

    /// One scoped round trip against a backend service port.
    async fn forward(
        &self,
        address: &str,
        port: u16,
        payload: &[u8],
    ) -> Result<Vec<u8>, RookeryError> {
        let mut conn = time::timeout(
            FORWARD_CONNECT_TIMEOUT,
            TcpStream::connect(format!("{}:{}", address, port)),
        )
        .await??;
        write_frame_raw(&mut conn, payload).await?;
        let reply =
            time::timeout(FORWARD_REPLY_TIMEOUT, read_frame_raw(&mut conn))
                .await??;
        Ok(reply)
    }
}

/// The balancer's reduced sync responder: accepts pings and announcements
/// (which register backends into the routing view), denies being
/// coordinator, and acknowledges everything else without acting on it.
pub struct BalancerSyncService {
    ctx: Arc<CoordinationContext>,
    discovery: Arc<Discovery>,
}

impl BalancerSyncService {
    pub fn new(
        ctx: Arc<CoordinationContext>,
        discovery: Arc<Discovery>,
    ) -> Arc<Self> {
        Arc::new(BalancerSyncService { ctx, discovery })
    }
}

#[async_trait]
impl SyncService for BalancerSyncService {
    async fn handle(&self, message: SyncMessage) -> SyncReply {
        match message {
            SyncMessage::ServerPing { from_server } => {
                self.discovery.handle_ping(&from_server)
            }

            SyncMessage::ServerAnnouncement {
                server_id,
                server_address,
                service_port,
                sync_address,
            } => self.discovery.handle_announcement(
                server_id,
                server_address,
                service_port,
                sync_address,
            ),

            SyncMessage::IsCoordinatorRequest { .. } => {
                SyncReply::coordinator_status(false)
            }

            // election, clock-sync, and replication traffic is
            // acknowledged but never acted upon here
            _ => {
                pf_trace!(
                    "balancer {} acknowledging control message",
                    self.ctx.id
                );
                SyncReply::ok()
            }
        }
    }
}
