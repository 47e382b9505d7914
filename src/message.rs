//! Control-plane wire messages exchanged on the sync port. Every message is
//! a JSON dictionary whose `action` field selects the variant; requests
//! additionally carry the sender's `logicalTime`, and every reply carries
//! the responder's. Field names follow the wire protocol, not Rust casing.

use serde::{Deserialize, Serialize};

use crate::context::NodeId;
use crate::replication::ReplicationEvent;

/// Envelope around a sync message: the Lamport timestamp rides next to the
/// action fields in the same JSON dictionary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEnvelope {
    #[serde(rename = "logicalTime", skip_serializing_if = "Option::is_none")]
    pub logical_time: Option<u64>,

    #[serde(flatten)]
    pub message: SyncMessage,
}

/// All control-plane actions served by a node's sync port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum SyncMessage {
    /// Coordinator opens a berkeley round, carrying its local physical time.
    #[serde(rename = "TIME_REQUEST")]
    TimeRequest {
        coordinator: NodeId,
        timestamp: i64,
    },

    /// A peer's asynchronous answer to a `TIME_REQUEST`.
    #[serde(rename = "TIME_RESPONSE")]
    TimeResponse {
        #[serde(rename = "serverId")]
        server_id: NodeId,
        #[serde(rename = "requestTimestamp")]
        request_timestamp: i64,
        #[serde(rename = "responseTimestamp")]
        response_timestamp: i64,
        #[serde(rename = "timeDifference")]
        time_difference: i64,
    },

    /// Per-peer offset correction computed at the end of a berkeley round.
    #[serde(rename = "CLOCK_ADJUSTMENT")]
    ClockAdjustment {
        coordinator: NodeId,
        adjustment: i64,
    },

    /// Bully election probe sent to every higher-ID peer.
    #[serde(rename = "ELECTION")]
    Election {
        #[serde(rename = "fromServer")]
        from_server: NodeId,
    },

    /// "I am alive and outrank you" answer to an `ELECTION`.
    #[serde(rename = "ELECTION_RESPONSE")]
    ElectionResponse {
        #[serde(rename = "fromServer")]
        from_server: NodeId,
    },

    /// Winner announcement closing an election round.
    #[serde(rename = "COORDINATOR")]
    Coordinator {
        #[serde(rename = "coordinatorId")]
        coordinator_id: NodeId,
    },

    #[serde(rename = "COORDINATOR_HEARTBEAT")]
    CoordinatorHeartbeat {
        #[serde(rename = "coordinatorId")]
        coordinator_id: NodeId,
    },

    #[serde(rename = "COORDINATOR_PING")]
    CoordinatorPing {
        #[serde(rename = "fromServer")]
        from_server: NodeId,
    },

    #[serde(rename = "IS_COORDINATOR_REQUEST")]
    IsCoordinatorRequest {
        #[serde(rename = "fromServer")]
        from_server: NodeId,
    },

    /// Presence announcement: who I am, where my service port and sync
    /// endpoint live.
    #[serde(rename = "SERVER_ANNOUNCEMENT")]
    ServerAnnouncement {
        #[serde(rename = "serverId")]
        server_id: NodeId,
        #[serde(rename = "serverAddress")]
        server_address: String,
        #[serde(rename = "servicePort")]
        service_port: u16,
        #[serde(rename = "syncAddress")]
        sync_address: String,
    },

    #[serde(rename = "SERVER_PING")]
    ServerPing {
        #[serde(rename = "fromServer")]
        from_server: NodeId,
    },

    /// Fan-out of one local mutation to a data peer.
    #[serde(rename = "DATA_REPLICATION")]
    DataReplication {
        #[serde(rename = "sourceServerId")]
        source_server_id: NodeId,
        #[serde(flatten)]
        event: ReplicationEvent,
    },
}

/// Reply to any sync message. Action-specific fields are optional and
/// omitted when absent so that every reply stays a flat JSON dictionary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncReply {
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(rename = "logicalTime", skip_serializing_if = "Option::is_none")]
    pub logical_time: Option<u64>,

    #[serde(
        rename = "isCoordinator",
        skip_serializing_if = "Option::is_none"
    )]
    pub is_coordinator: Option<bool>,

    #[serde(rename = "serverId", skip_serializing_if = "Option::is_none")]
    pub server_id: Option<NodeId>,

    #[serde(rename = "isActive", skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
}

impl SyncReply {
    /// Plain acknowledgment.
    pub fn ok() -> Self {
        SyncReply {
            success: true,
            ..Default::default()
        }
    }

    pub fn err(error: impl ToString) -> Self {
        SyncReply {
            success: false,
            error: Some(error.to_string()),
            ..Default::default()
        }
    }

    /// Answer to `SERVER_PING`.
    pub fn pong(server_id: NodeId) -> Self {
        SyncReply {
            success: true,
            server_id: Some(server_id),
            is_active: Some(true),
            ..Default::default()
        }
    }

    /// Answer to `IS_COORDINATOR_REQUEST`.
    pub fn coordinator_status(is_coordinator: bool) -> Self {
        SyncReply {
            success: true,
            is_coordinator: Some(is_coordinator),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod message_tests {
    use super::*;
    use crate::replication::EventBody;
    use crate::utils::RookeryError;
    use chrono::Utc;

    #[test]
    fn envelope_wire_shape() -> Result<(), RookeryError> {
        let envelope = SyncEnvelope {
            logical_time: Some(42),
            message: SyncMessage::TimeRequest {
                coordinator: "s3".into(),
                timestamp: 1_700_000_000_000,
            },
        };
        let value = serde_json::to_value(&envelope)?;
        assert_eq!(value["action"], "TIME_REQUEST");
        assert_eq!(value["logicalTime"], 42);
        assert_eq!(value["coordinator"], "s3");
        assert_eq!(value["timestamp"], 1_700_000_000_000i64);
        Ok(())
    }

    #[test]
    fn replication_wire_shape() -> Result<(), RookeryError> {
        let envelope = SyncEnvelope {
            logical_time: Some(7),
            message: SyncMessage::DataReplication {
                source_server_id: "s1".into(),
                event: ReplicationEvent {
                    entity_id: "p-123".into(),
                    timestamp: 99,
                    body: EventBody::PostDeleted { id: "p-123".into() },
                },
            },
        };
        let value = serde_json::to_value(&envelope)?;
        assert_eq!(value["action"], "DATA_REPLICATION");
        assert_eq!(value["sourceServerId"], "s1");
        assert_eq!(value["entityId"], "p-123");
        assert_eq!(value["eventType"], "POST_DELETED");
        assert_eq!(value["data"]["id"], "p-123");

        let decoded: SyncEnvelope = serde_json::from_value(value)?;
        match decoded.message {
            SyncMessage::DataReplication { event, .. } => {
                assert_eq!(event.entity_id, "p-123");
            }
            other => panic!("decoded wrong variant: {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn unknown_action_is_an_error() {
        let raw = r#"{"action":"FROBNICATE","logicalTime":1}"#;
        assert!(serde_json::from_str::<SyncEnvelope>(raw).is_err());
    }

    #[test]
    fn message_event_round_trip() -> Result<(), RookeryError> {
        let now = Utc::now();
        let envelope = SyncEnvelope {
            logical_time: None,
            message: SyncMessage::DataReplication {
                source_server_id: "s2".into(),
                event: ReplicationEvent {
                    entity_id: "m-1".into(),
                    timestamp: 1,
                    body: EventBody::MessageSent {
                        id: "m-1".into(),
                        sender_username: "alice".into(),
                        receiver_username: "bob".into(),
                        content: "hi".into(),
                        sent_at: now,
                        read: false,
                        read_at: None,
                    },
                },
            },
        };
        let bytes = serde_json::to_vec(&envelope)?;
        let decoded: SyncEnvelope = serde_json::from_slice(&bytes)?;
        match decoded.message {
            SyncMessage::DataReplication { event, .. } => match event.body {
                EventBody::MessageSent { sent_at, read, .. } => {
                    assert_eq!(sent_at, now);
                    assert!(!read);
                }
                other => panic!("wrong body: {:?}", other),
            },
            other => panic!("wrong variant: {:?}", other),
        }
        Ok(())
    }
}
