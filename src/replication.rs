//! Asynchronous write replication: a per-node FIFO of mutation events
//! drained by one dedicated worker that fans each event out to every live
//! data peer, and the applier that folds inbound events into the local
//! repositories idempotently. Delivery is at-least-once best-effort; a
//! failed send is not re-enqueued, and the applier never re-emits events.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::context::{CoordinationContext, NodeId};
use crate::message::SyncMessage;
use crate::repository::{Message, Post, Repositories, User};
use crate::transport::SyncClient;
use crate::utils::RookeryError;

/// Typed payload of one replication event; the tag doubles as the wire
/// `eventType` field and the payload as the wire `data` dictionary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "eventType", content = "data")]
pub enum EventBody {
    #[serde(rename = "USER_CREATED", rename_all = "camelCase")]
    UserCreated {
        username: String,
        password: String,
        created_at: DateTime<Utc>,
    },

    /// `username` is the followed side, `follower_username` the follower.
    #[serde(rename = "FOLLOW_ADDED", rename_all = "camelCase")]
    FollowAdded {
        username: String,
        follower_username: String,
    },

    #[serde(rename = "FOLLOW_REMOVED", rename_all = "camelCase")]
    FollowRemoved {
        username: String,
        follower_username: String,
    },

    #[serde(rename = "POST_CREATED", rename_all = "camelCase")]
    PostCreated {
        id: String,
        username: String,
        content: String,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    },

    #[serde(rename = "POST_UPDATED", rename_all = "camelCase")]
    PostUpdated {
        id: String,
        content: String,
        updated_at: DateTime<Utc>,
    },

    #[serde(rename = "POST_DELETED", rename_all = "camelCase")]
    PostDeleted { id: String },

    #[serde(rename = "MESSAGE_SENT", rename_all = "camelCase")]
    MessageSent {
        id: String,
        sender_username: String,
        receiver_username: String,
        content: String,
        sent_at: DateTime<Utc>,
        read: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        read_at: Option<DateTime<Utc>>,
    },
}

impl EventBody {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            EventBody::UserCreated { .. } => "USER_CREATED",
            EventBody::FollowAdded { .. } => "FOLLOW_ADDED",
            EventBody::FollowRemoved { .. } => "FOLLOW_REMOVED",
            EventBody::PostCreated { .. } => "POST_CREATED",
            EventBody::PostUpdated { .. } => "POST_UPDATED",
            EventBody::PostDeleted { .. } => "POST_DELETED",
            EventBody::MessageSent { .. } => "MESSAGE_SENT",
        }
    }
}

/// One replicable mutation, stamped with the originating entity ID and the
/// origin node's physical time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationEvent {
    #[serde(rename = "entityId")]
    pub entity_id: String,

    pub timestamp: i64,

    #[serde(flatten)]
    pub body: EventBody,
}

/// Cloneable producer handle given to the service dispatchers. Every
/// successful local mutation records exactly one event.
#[derive(Debug, Clone)]
pub struct ReplicationHandle {
    ctx: Arc<CoordinationContext>,
    tx_event: mpsc::UnboundedSender<ReplicationEvent>,
}

impl ReplicationHandle {
    fn record(&self, entity_id: String, body: EventBody) {
        let event = ReplicationEvent {
            entity_id,
            timestamp: self.ctx.clock.physical().now_ms(),
            body,
        };
        pf_debug!("queued replication event {}", event.body.kind());
        if self.tx_event.send(event).is_err() {
            pf_warn!("replication queue closed, event dropped");
        }
    }

    /// Handle wired to a bare channel, for exercising producers without a
    /// transport.
    #[cfg(test)]
    pub(crate) fn new_for_test(
        ctx: Arc<CoordinationContext>,
    ) -> (ReplicationHandle, mpsc::UnboundedReceiver<ReplicationEvent>) {
        let (tx_event, rx_event) = mpsc::unbounded_channel();
        (ReplicationHandle { ctx, tx_event }, rx_event)
    }

    pub fn user_created(&self, user: &User) {
        self.record(
            user.username.clone(),
            EventBody::UserCreated {
                username: user.username.clone(),
                password: user.password.clone(),
                created_at: user.created_at,
            },
        );
    }

    pub fn follow_added(&self, username: &str, follower_username: &str) {
        self.record(
            format!("{}_{}", username, follower_username),
            EventBody::FollowAdded {
                username: username.into(),
                follower_username: follower_username.into(),
            },
        );
    }

    pub fn follow_removed(&self, username: &str, follower_username: &str) {
        self.record(
            format!("{}_{}", username, follower_username),
            EventBody::FollowRemoved {
                username: username.into(),
                follower_username: follower_username.into(),
            },
        );
    }

    pub fn post_created(&self, post: &Post) {
        self.record(
            post.id.clone(),
            EventBody::PostCreated {
                id: post.id.clone(),
                username: post.username.clone(),
                content: post.content.clone(),
                created_at: post.created_at,
                updated_at: post.updated_at,
            },
        );
    }

    pub fn post_updated(&self, post: &Post) {
        self.record(
            post.id.clone(),
            EventBody::PostUpdated {
                id: post.id.clone(),
                content: post.content.clone(),
                updated_at: post.updated_at,
            },
        );
    }

    pub fn post_deleted(&self, post_id: &str) {
        self.record(
            post_id.into(),
            EventBody::PostDeleted { id: post_id.into() },
        );
    }

    pub fn message_sent(&self, message: &Message) {
        self.record(
            message.id.clone(),
            EventBody::MessageSent {
                id: message.id.clone(),
                sender_username: message.sender_username.clone(),
                receiver_username: message.receiver_username.clone(),
                content: message.content.clone(),
                sent_at: message.sent_at,
                read: message.read,
                read_at: message.read_at,
            },
        );
    }
}

/// The outbound replication worker: drains the event FIFO and fans each
/// event out to every active data peer (balancers excluded).
pub struct ReplicationQueue {
    ctx: Arc<CoordinationContext>,
    client: Arc<SyncClient>,
    rx_event: mpsc::UnboundedReceiver<ReplicationEvent>,
}

impl ReplicationQueue {
    /// Creates the queue and its producer handle.
    pub fn new(
        ctx: Arc<CoordinationContext>,
        client: Arc<SyncClient>,
    ) -> (ReplicationHandle, ReplicationQueue) {
        let (tx_event, rx_event) = mpsc::unbounded_channel();
        (
            ReplicationHandle {
                ctx: ctx.clone(),
                tx_event,
            },
            ReplicationQueue {
                ctx,
                client,
                rx_event,
            },
        )
    }

    /// Spawns the single drainer worker.
    pub fn spawn(mut self, mut rx_term: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            pf_debug!("replication drainer spawned");
            loop {
                tokio::select! {
                    event = self.rx_event.recv() => {
                        match event {
                            Some(event) => self.fan_out(event),
                            None => break, // all producers dropped
                        }
                    },
                    _ = rx_term.changed() => break,
                }
            }
            pf_debug!("replication drainer exited");
        })
    }

    fn fan_out(&self, event: ReplicationEvent) {
        let peers = self.ctx.peers.active_data_ids();
        pf_debug!(
            "replicating {} for '{}' to {} peers",
            event.body.kind(),
            event.entity_id,
            peers.len()
        );
        for peer in peers {
            self.client.send(
                peer,
                SyncMessage::DataReplication {
                    source_server_id: self.ctx.id.clone(),
                    event: event.clone(),
                },
            );
        }
    }
}

/// Applies inbound replication events to the local repositories. Every
/// branch is idempotent with respect to repeated delivery.
pub struct Applier {
    repos: Arc<Repositories>,
}

impl Applier {
    pub fn new(repos: Arc<Repositories>) -> Self {
        Applier { repos }
    }

    pub fn apply(
        &self,
        source: &NodeId,
        event: ReplicationEvent,
    ) -> Result<(), RookeryError> {
        pf_debug!(
            "applying {} for '{}' from {}",
            event.body.kind(),
            event.entity_id,
            source
        );
        match event.body {
            EventBody::UserCreated {
                username,
                password,
                created_at,
            } => {
                if self.repos.users.get(&username).is_some() {
                    pf_debug!("user '{}' already exists, skipping", username);
                    return Ok(());
                }
                self.repos.users.add(User::with_created_at(
                    username, password, created_at,
                ))?;
            }

            EventBody::FollowAdded {
                username,
                follower_username,
            } => {
                let (Some(mut followed), Some(mut follower)) = (
                    self.repos.users.get(&username),
                    self.repos.users.get(&follower_username),
                ) else {
                    pf_warn!(
                        "follow edge {} <- {} references unknown user, dropped",
                        username,
                        follower_username
                    );
                    return Ok(());
                };
                followed.followers.insert(follower.username.clone());
                follower.following.insert(followed.username.clone());
                self.repos.users.update(followed)?;
                self.repos.users.update(follower)?;
            }

            EventBody::FollowRemoved {
                username,
                follower_username,
            } => {
                let (Some(mut followed), Some(mut follower)) = (
                    self.repos.users.get(&username),
                    self.repos.users.get(&follower_username),
                ) else {
                    pf_warn!(
                        "unfollow edge {} <- {} references unknown user, dropped",
                        username,
                        follower_username
                    );
                    return Ok(());
                };
                followed.followers.remove(&follower.username);
                follower.following.remove(&followed.username);
                self.repos.users.update(followed)?;
                self.repos.users.update(follower)?;
            }

            EventBody::PostCreated {
                id,
                username,
                content,
                created_at,
                updated_at,
            } => {
                if self.repos.posts.get_by_id(&id).is_some() {
                    pf_debug!("post '{}' already exists, skipping", id);
                    return Ok(());
                }
                self.repos.posts.add(Post {
                    id,
                    username,
                    content,
                    created_at,
                    updated_at,
                })?;
            }

            EventBody::PostUpdated {
                id,
                content,
                updated_at,
            } => {
                let Some(mut post) = self.repos.posts.get_by_id(&id) else {
                    pf_warn!("post '{}' not found for update, dropped", id);
                    return Ok(());
                };
                post.content = content;
                post.updated_at = updated_at;
                self.repos.posts.update(post)?;
            }

            EventBody::PostDeleted { id } => {
                // absent is fine: the delete may already have been applied
                self.repos.posts.remove(&id)?;
            }

            EventBody::MessageSent {
                id,
                sender_username,
                receiver_username,
                content,
                sent_at,
                read,
                read_at,
            } => {
                let message = Message {
                    id: id.clone(),
                    sender_username,
                    receiver_username,
                    content,
                    sent_at,
                    read,
                    read_at,
                };
                if self.repos.messages.get_by_id(&id).is_some() {
                    // duplicate delivery, or the read flag advanced at the
                    // origin; folding the newer record in keeps this branch
                    // idempotent either way
                    self.repos.messages.update(message)?;
                } else {
                    self.repos.messages.add(message)?;
                }
            }
        }
        Ok(())
    }
}
