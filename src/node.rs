//! Node assembly: configuration surface, the backend's sync-message
//! dispatcher, and the two node roles. A backend hosts the repositories,
//! the four client services, and the full coordination stack; a balancer
//! hosts the round-robin router plus the reduced sync responder.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use rand::Rng;
use serde::Deserialize;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::balancer::{BalancerRouter, BalancerSyncService};
use crate::berkeley::BerkeleySync;
use crate::clock::ClockManager;
use crate::context::{is_balancer_id, CoordinationContext, NodeId};
use crate::discovery::Discovery;
use crate::election::BullyElection;
use crate::message::{SyncMessage, SyncReply};
use crate::replication::{Applier, ReplicationHandle, ReplicationQueue};
use crate::repository::Repositories;
use crate::service::{
    FollowHandler, MessagesHandler, PostsHandler, ServiceWorker,
    UsersHandler, FOLLOW_PORT_OFFSET, MESSAGES_PORT_OFFSET,
    POSTS_PORT_OFFSET, USERS_PORT_OFFSET,
};
use crate::transport::{SyncClient, SyncListener, SyncService};
use crate::utils::RookeryError;

/// Per-node configuration, parsed from a TOML document. Field names mirror
/// the node properties surface one-to-one (dots become underscores).
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Node ID; empty means "generate a random one".
    pub server_id: String,

    /// Host/interface to bind and advertise.
    pub server_address: String,

    /// Base client-service port; the four services bind base+{0,100,200,300}.
    pub service_port: u16,

    /// Control-plane port (base of the bind-retry ladder).
    pub sync_port: u16,

    /// Berkeley round interval.
    pub sync_interval_ms: u64,

    /// Coordinator check / heartbeat interval.
    pub coordinator_check_interval_ms: u64,

    /// Peer ping interval.
    pub discovery_interval_ms: u64,

    /// Run as the front-door balancer instead of a backend.
    pub is_balancer: bool,

    /// Client-facing router port (balancer only).
    pub balancer_port: u16,

    /// Comma list of `id:host:sync_port` triples seeding the peer table.
    pub seed_servers: String,

    /// Node state directory (clock offset, default repository location).
    pub data_directory: String,

    /// Per-entity repository directories; empty means `data_directory`.
    pub user_data_directory: String,
    pub post_data_directory: String,
    pub message_data_directory: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            server_id: String::new(),
            server_address: "127.0.0.1".into(),
            service_port: 5555,
            sync_port: 6000,
            sync_interval_ms: 60_000,
            coordinator_check_interval_ms: 30_000,
            discovery_interval_ms: 15_000,
            is_balancer: false,
            balancer_port: 5000,
            seed_servers: String::new(),
            data_directory: "./data".into(),
            user_data_directory: String::new(),
            post_data_directory: String::new(),
            message_data_directory: String::new(),
        }
    }
}

impl NodeConfig {
    /// Parses a config from an optional TOML document, filling defaults and
    /// generating a random node ID when none is given.
    pub fn from_config_str(
        config_str: Option<&str>,
    ) -> Result<Self, RookeryError> {
        let mut config = parsed_config!(config_str => NodeConfig;
                                        server_id, server_address,
                                        service_port, sync_port,
                                        sync_interval_ms,
                                        coordinator_check_interval_ms,
                                        discovery_interval_ms,
                                        is_balancer, balancer_port,
                                        seed_servers, data_directory,
                                        user_data_directory,
                                        post_data_directory,
                                        message_data_directory)?;
        if config.server_id.is_empty() {
            config.server_id = format!(
                "node-{:06x}",
                rand::thread_rng().gen_range(0..0x1000000)
            );
            pf_info!("generated random node id '{}'", config.server_id);
        }
        Ok(config)
    }

    /// Parses the seed list into `(id, host, sync_port)` triples.
    pub fn seed_entries(
        &self,
    ) -> Result<Vec<(NodeId, String, u16)>, RookeryError> {
        let mut entries = vec![];
        for seed in self
            .seed_servers
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            let parts: Vec<&str> = seed.split(':').collect();
            if parts.len() != 3 {
                return logged_err!("malformed seed entry '{}'", seed);
            }
            entries.push((
                parts[0].to_string(),
                parts[1].to_string(),
                parts[2].parse()?,
            ));
        }
        Ok(entries)
    }

    fn entity_dir(&self, specific: &str) -> PathBuf {
        if specific.is_empty() {
            PathBuf::from(&self.data_directory)
        } else {
            PathBuf::from(specific)
        }
    }

    fn offset_path(&self) -> PathBuf {
        PathBuf::from(&self.data_directory)
            .join(format!("{}.offset", self.server_id))
    }
}

/// Role-independent node interface.
#[async_trait]
pub trait GenericNode {
    /// Creates the node and sets up its listeners and functionality
    /// modules.
    async fn new_and_setup(config: NodeConfig) -> Result<Self, RookeryError>
    where
        Self: Sized;

    /// Starts the node's workers and parks until the termination signal.
    async fn run(
        &mut self,
        rx_term: watch::Receiver<bool>,
    ) -> Result<(), RookeryError>;
}

/// Dispatches inbound sync messages to the backend coordination stack.
struct BackendSyncService {
    ctx: Arc<CoordinationContext>,
    discovery: Arc<Discovery>,
    election: Arc<BullyElection>,
    berkeley: Arc<BerkeleySync>,
    applier: Applier,
}

#[async_trait]
impl SyncService for BackendSyncService {
    async fn handle(&self, message: SyncMessage) -> SyncReply {
        match message {
            SyncMessage::TimeRequest {
                coordinator,
                timestamp,
            } => self.berkeley.handle_time_request(coordinator, timestamp),

            SyncMessage::TimeResponse {
                server_id,
                time_difference,
                ..
            } => self
                .berkeley
                .handle_time_response(server_id, time_difference),

            SyncMessage::ClockAdjustment {
                coordinator,
                adjustment,
            } => self
                .berkeley
                .handle_clock_adjustment(coordinator, adjustment),

            SyncMessage::Election { from_server } => {
                self.election.handle_election(from_server)
            }

            SyncMessage::ElectionResponse { from_server } => {
                self.election.handle_election_response(from_server)
            }

            SyncMessage::Coordinator { coordinator_id } => {
                self.election.handle_coordinator(coordinator_id)
            }

            SyncMessage::CoordinatorHeartbeat { coordinator_id } => {
                pf_trace!("heartbeat from coordinator {}", coordinator_id);
                SyncReply::ok()
            }

            SyncMessage::CoordinatorPing { from_server } => {
                pf_trace!("coordinator ping from {}", from_server);
                SyncReply::ok()
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

            SyncMessage::ServerPing { from_server } => {
                self.discovery.handle_ping(&from_server)
            }

            SyncMessage::IsCoordinatorRequest { .. } => {
                SyncReply::coordinator_status(self.ctx.is_coordinator())
            }

            SyncMessage::DataReplication {
                source_server_id,
                event,
            } => match self.applier.apply(&source_server_id, event) {
                Ok(()) => SyncReply::ok(),
                Err(e) => {
                    pf_error!("error applying replication event: {}", e);
                    SyncReply::err(e)
                }
            },
        }
    }
}

/// A backend node: repositories, client services, and the coordination
/// stack.
pub struct BackendNode {
    config: NodeConfig,
    ctx: Arc<CoordinationContext>,
    repos: Arc<Repositories>,
    discovery: Arc<Discovery>,
    election: Arc<BullyElection>,
    berkeley: Arc<BerkeleySync>,
    replicator: ReplicationHandle,
    queue: Option<ReplicationQueue>,
    worker_handles: Vec<JoinHandle<()>>,
}

#[async_trait]
impl GenericNode for BackendNode {
    async fn new_and_setup(
        config: NodeConfig,
    ) -> Result<Self, RookeryError> {
        let clock = ClockManager::new_persistent(config.offset_path());
        let ctx = Arc::new(CoordinationContext::new(
            config.server_id.clone(),
            config.server_address.clone(),
            config.service_port,
            config.sync_port,
            clock,
        ));

        for (id, host, sync_port) in config.seed_entries()? {
            ctx.peers.upsert(id, host, sync_port, None);
        }

        let id = &config.server_id;
        let repos = Repositories::open(
            &config
                .entity_dir(&config.user_data_directory)
                .join(format!("users_{}.snap", id)),
            &config
                .entity_dir(&config.post_data_directory)
                .join(format!("posts_{}.snap", id)),
            &config
                .entity_dir(&config.message_data_directory)
                .join(format!("messages_{}.snap", id)),
        )?;

        let client = SyncClient::new(ctx.clone());

        // the replication pipeline must exist before any service loop can
        // accept traffic, so it is built ahead of the workers
        let (replicator, queue) =
            ReplicationQueue::new(ctx.clone(), client.clone());
        let applier = Applier::new(repos.clone());

        let discovery = Discovery::new(
            ctx.clone(),
            client.clone(),
            Duration::from_millis(config.discovery_interval_ms),
        );
        let election = BullyElection::new(
            ctx.clone(),
            client.clone(),
            Duration::from_millis(config.coordinator_check_interval_ms),
        );
        let berkeley = BerkeleySync::new(
            ctx.clone(),
            client,
            Duration::from_millis(config.sync_interval_ms),
        );

        let sync_service = Arc::new(BackendSyncService {
            ctx: ctx.clone(),
            discovery: discovery.clone(),
            election: election.clone(),
            berkeley: berkeley.clone(),
            applier,
        });
        let listener_handle =
            SyncListener::new_and_spawn(ctx.clone(), sync_service).await?;

        Ok(BackendNode {
            config,
            ctx,
            repos,
            discovery,
            election,
            berkeley,
            replicator,
            queue: Some(queue),
            worker_handles: vec![listener_handle],
        })
    }

    async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), RookeryError> {
        // coordination workers first, replication drainer included
        let queue = match self.queue.take() {
            Some(queue) => queue,
            None => return logged_err!("backend node already running"),
        };
        self.worker_handles.push(queue.spawn(rx_term.clone()));
        self.worker_handles
            .push(self.discovery.clone().spawn(rx_term.clone()));
        self.worker_handles
            .push(self.election.clone().spawn(rx_term.clone()));
        self.worker_handles
            .push(self.berkeley.clone().spawn(rx_term.clone()));

        // then the four client services
        let host = &self.config.server_address;
        let base = self.config.service_port;
        self.worker_handles.push(
            ServiceWorker::new_and_spawn(
                "posts",
                host,
                base + POSTS_PORT_OFFSET,
                PostsHandler::new(
                    self.repos.clone(),
                    self.replicator.clone(),
                ),
            )
            .await?,
        );
        self.worker_handles.push(
            ServiceWorker::new_and_spawn(
                "messages",
                host,
                base + MESSAGES_PORT_OFFSET,
                MessagesHandler::new(
                    self.repos.clone(),
                    self.replicator.clone(),
                ),
            )
            .await?,
        );
        self.worker_handles.push(
            ServiceWorker::new_and_spawn(
                "follow",
                host,
                base + FOLLOW_PORT_OFFSET,
                FollowHandler::new(
                    self.repos.clone(),
                    self.replicator.clone(),
                ),
            )
            .await?,
        );
        self.worker_handles.push(
            ServiceWorker::new_and_spawn(
                "users",
                host,
                base + USERS_PORT_OFFSET,
                UsersHandler::new(
                    self.repos.clone(),
                    self.replicator.clone(),
                ),
            )
            .await?,
        );

        pf_info!(
            "backend node {} up (services at {}+, sync at {})",
            self.ctx.id,
            base,
            self.ctx.sync_port()
        );

        let _ = rx_term.changed().await;
        pf_warn!("backend node {} shutting down", self.ctx.id);
        for handle in self.worker_handles.drain(..) {
            handle.abort();
        }
        Ok(())
    }
}

impl BackendNode {
    /// Shared coordination state, exposed for inspection.
    pub fn ctx(&self) -> &Arc<CoordinationContext> {
        &self.ctx
    }
}

/// A balancer node: the round-robin router plus the reduced sync
/// responder.
pub struct BalancerNode {
    config: NodeConfig,
    ctx: Arc<CoordinationContext>,
    discovery: Arc<Discovery>,
    router: Arc<BalancerRouter>,
    worker_handles: Vec<JoinHandle<()>>,
    running: bool,
}

#[async_trait]
impl GenericNode for BalancerNode {
    async fn new_and_setup(
        config: NodeConfig,
    ) -> Result<Self, RookeryError> {
        if !is_balancer_id(&config.server_id) {
            pf_warn!(
                "balancer node id '{}' lacks the 'balancer' prefix; data \
                 nodes will include it in replication fan-out",
                config.server_id
            );
        }

        let ctx = Arc::new(CoordinationContext::new(
            config.server_id.clone(),
            config.server_address.clone(),
            0, // a balancer has no service ports of its own
            config.sync_port,
            ClockManager::new_ephemeral(),
        ));

        for (id, host, sync_port) in config.seed_entries()? {
            ctx.peers.upsert(id, host, sync_port, None);
        }

        let client = SyncClient::new(ctx.clone());
        let discovery = Discovery::new(
            ctx.clone(),
            client,
            Duration::from_millis(config.discovery_interval_ms),
        );

        let sync_service =
            BalancerSyncService::new(ctx.clone(), discovery.clone());
        let listener_handle =
            SyncListener::new_and_spawn(ctx.clone(), sync_service).await?;

        let router = BalancerRouter::new(ctx.clone());

        Ok(BalancerNode {
            config,
            ctx,
            discovery,
            router,
            worker_handles: vec![listener_handle],
            running: false,
        })
    }

    async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), RookeryError> {
        if self.running {
            return logged_err!("balancer node already running");
        }
        self.running = true;

        self.worker_handles
            .push(self.discovery.clone().spawn(rx_term.clone()));
        self.worker_handles.push(
            self.router
                .clone()
                .new_and_spawn(self.config.balancer_port)
                .await?,
        );

        pf_info!(
            "balancer {} up (router at {}, sync at {})",
            self.ctx.id,
            self.config.balancer_port,
            self.ctx.sync_port()
        );

        let _ = rx_term.changed().await;
        pf_warn!("balancer {} shutting down", self.ctx.id);
        for handle in self.worker_handles.drain(..) {
            handle.abort();
        }
        Ok(())
    }
}

impl BalancerNode {
    pub fn ctx(&self) -> &Arc<CoordinationContext> {
        &self.ctx
    }
}
