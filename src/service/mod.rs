//! Client-facing services of a backend node. Each of the four services
//! (posts, messages, follow, users) owns one reply socket at its designated
//! port offset and routes typed requests to an action handler; every
//! successful mutation enqueues exactly one replication event.

mod follow;
mod messages;
mod posts;
mod users;

pub use follow::FollowHandler;
pub use messages::MessagesHandler;
pub use posts::PostsHandler;
pub use users::UsersHandler;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::utils::{read_frame, write_frame, RookeryError};

/// Port offset of the posts/feed service over the base service port.
pub const POSTS_PORT_OFFSET: u16 = 0;
/// Port offset of the direct-message service.
pub const MESSAGES_PORT_OFFSET: u16 = 100;
/// Port offset of the follow-graph service.
pub const FOLLOW_PORT_OFFSET: u16 = 200;
/// Port offset of the user account service.
pub const USERS_PORT_OFFSET: u16 = 300;

/// Maps a client action name to the port offset of the service that owns
/// it. Unrecognized actions fall through to the posts service, which will
/// answer with an unknown-action error.
pub fn action_port_offset(action: &str) -> u16 {
    match action {
        "USER_REGISTER" | "USER_LOGIN" | "register" => USERS_PORT_OFFSET,
        "FOLLOW_USER" | "UNFOLLOW_USER" | "GET_FOLLOWERS"
        | "GET_FOLLOWING" => FOLLOW_PORT_OFFSET,
        "SEND_MESSAGE" | "MARK_AS_READ" | "GET_CONVERSATION"
        | "GET_UNREAD_MESSAGES" => MESSAGES_PORT_OFFSET,
        _ => POSTS_PORT_OFFSET,
    }
}

/// Typed client request, decoded from the wire dictionary by its `action`
/// field. Unknown actions fail decoding and surface as error replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum ApiRequest {
    #[serde(rename = "USER_REGISTER", alias = "register")]
    UserRegister { username: String, password: String },

    #[serde(rename = "USER_LOGIN")]
    UserLogin { username: String, password: String },

    #[serde(rename = "CREATE_POST")]
    CreatePost { username: String, content: String },

    #[serde(rename = "UPDATE_POST")]
    UpdatePost {
        #[serde(rename = "postId")]
        post_id: String,
        username: String,
        content: String,
    },

    #[serde(rename = "DELETE_POST")]
    DeletePost {
        #[serde(rename = "postId")]
        post_id: String,
        username: String,
    },

    #[serde(rename = "GET_USER_POSTS")]
    GetUserPosts { username: String },

    #[serde(rename = "GET_FEED")]
    GetFeed { username: String, limit: usize },

    #[serde(rename = "FOLLOW_USER")]
    FollowUser {
        #[serde(rename = "followerUsername")]
        follower_username: String,
        #[serde(rename = "followedUsername")]
        followed_username: String,
    },

    #[serde(rename = "UNFOLLOW_USER")]
    UnfollowUser {
        #[serde(rename = "followerUsername")]
        follower_username: String,
        #[serde(rename = "followedUsername")]
        followed_username: String,
    },

    #[serde(rename = "GET_FOLLOWERS")]
    GetFollowers { username: String },

    #[serde(rename = "GET_FOLLOWING")]
    GetFollowing { username: String },

    #[serde(rename = "SEND_MESSAGE")]
    SendMessage {
        #[serde(rename = "senderUsername")]
        sender_username: String,
        #[serde(rename = "receiverUsername")]
        receiver_username: String,
        content: String,
    },

    #[serde(rename = "MARK_AS_READ")]
    MarkAsRead {
        #[serde(rename = "messageId")]
        message_id: String,
        username: String,
    },

    #[serde(rename = "GET_CONVERSATION")]
    GetConversation {
        username1: String,
        username2: String,
    },

    #[serde(rename = "GET_UNREAD_MESSAGES")]
    GetUnreadMessages { username: String },
}

impl ApiRequest {
    /// Canonical action name of this request.
    pub fn action(&self) -> &'static str {
        match self {
            ApiRequest::UserRegister { .. } => "USER_REGISTER",
            ApiRequest::UserLogin { .. } => "USER_LOGIN",
            ApiRequest::CreatePost { .. } => "CREATE_POST",
            ApiRequest::UpdatePost { .. } => "UPDATE_POST",
            ApiRequest::DeletePost { .. } => "DELETE_POST",
            ApiRequest::GetUserPosts { .. } => "GET_USER_POSTS",
            ApiRequest::GetFeed { .. } => "GET_FEED",
            ApiRequest::FollowUser { .. } => "FOLLOW_USER",
            ApiRequest::UnfollowUser { .. } => "UNFOLLOW_USER",
            ApiRequest::GetFollowers { .. } => "GET_FOLLOWERS",
            ApiRequest::GetFollowing { .. } => "GET_FOLLOWING",
            ApiRequest::SendMessage { .. } => "SEND_MESSAGE",
            ApiRequest::MarkAsRead { .. } => "MARK_AS_READ",
            ApiRequest::GetConversation { .. } => "GET_CONVERSATION",
            ApiRequest::GetUnreadMessages { .. } => "GET_UNREAD_MESSAGES",
        }
    }
}

/// Reply sent back to a client: `success` plus either an `error` string or
/// the action-specific fields flattened into the same dictionary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiReply {
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(flatten)]
    pub body: serde_json::Map<String, serde_json::Value>,
}

impl ApiReply {
    pub fn ok() -> Self {
        ApiReply {
            success: true,
            error: None,
            body: serde_json::Map::new(),
        }
    }

    /// Success reply carrying the given JSON object as extra fields.
    pub fn ok_with(
        body: serde_json::Value,
    ) -> Result<Self, RookeryError> {
        match body {
            serde_json::Value::Object(map) => Ok(ApiReply {
                success: true,
                error: None,
                body: map,
            }),
            other => logged_err!(
                "reply body must be a JSON object, got {}",
                other
            ),
        }
    }

    pub fn err(error: impl ToString) -> Self {
        ApiReply {
            success: false,
            error: Some(error.to_string()),
            body: serde_json::Map::new(),
        }
    }
}

/// One service's request processing capability: the set of actions it
/// accepts and the dispatch that executes them. Validation and not-found
/// outcomes come back as `Ok(error reply)`; only internal faults use `Err`.
pub trait ActionHandler: Send + Sync + 'static {
    fn handles(&self) -> &'static [&'static str];

    fn dispatch(&self, request: ApiRequest)
        -> Result<ApiReply, RookeryError>;
}

/// Generic service worker: owns the listening socket of one service port
/// and runs its processing loop, decoding requests, routing them to the
/// handler, and converting every outcome into a reply. Exceptions never
/// cross the socket.
pub struct ServiceWorker;

impl ServiceWorker {
    pub async fn new_and_spawn(
        name: &'static str,
        host: &str,
        port: u16,
        handler: Arc<dyn ActionHandler>,
    ) -> Result<JoinHandle<()>, RookeryError> {
        let listener = TcpListener::bind(format!("{}:{}", host, port))
            .await
            .map_err(|e| {
                RookeryError(format!(
                    "{} service failed to bind port {}: {}",
                    name, port, e
                ))
            })?;
        pf_info!("{} service serving on port {}", name, port);

        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((conn, _addr)) => {
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            Self::serve_conn(name, handler, conn).await;
                        });
                    }
                    Err(e) => {
                        pf_warn!(
                            "{} service error accepting connection: {}",
                            name,
                            e
                        );
                    }
                }
            }
        });
        Ok(handle)
    }

    async fn serve_conn(
        name: &'static str,
        handler: Arc<dyn ActionHandler>,
        mut conn: TcpStream,
    ) {
        loop {
            let raw: serde_json::Value = match read_frame(&mut conn).await {
                Ok(raw) => raw,
                Err(_) => return, // client closed or sent garbage
            };

            let reply = Self::process(name, handler.as_ref(), raw);
            if let Err(e) = write_frame(&mut conn, &reply).await {
                pf_debug!("{} service error writing reply: {}", name, e);
                return;
            }
        }
    }

    /// Decodes and dispatches one request, converting every failure mode
    /// into an error reply.
    fn process(
        name: &'static str,
        handler: &dyn ActionHandler,
        raw: serde_json::Value,
    ) -> ApiReply {
        let action = raw
            .get("action")
            .and_then(|v| v.as_str())
            .unwrap_or("<missing>")
            .to_string();

        let request: ApiRequest = match serde_json::from_value(raw) {
            Ok(request) => request,
            Err(e) => {
                pf_debug!(
                    "{} service rejecting request '{}': {}",
                    name,
                    action,
                    e
                );
                return ApiReply::err(format!("unknown action: {}", action));
            }
        };

        if !handler.handles().contains(&request.action()) {
            return ApiReply::err(format!(
                "action {} not served here",
                request.action()
            ));
        }

        match handler.dispatch(request) {
            Ok(reply) => reply,
            Err(e) => {
                pf_error!("{} service internal error: {}", name, e);
                ApiReply::err(e)
            }
        }
    }
}

#[cfg(test)]
mod service_tests {
    use super::*;

    #[test]
    fn action_demux_offsets() {
        assert_eq!(action_port_offset("USER_REGISTER"), 300);
        assert_eq!(action_port_offset("register"), 300);
        assert_eq!(action_port_offset("USER_LOGIN"), 300);
        assert_eq!(action_port_offset("FOLLOW_USER"), 200);
        assert_eq!(action_port_offset("GET_FOLLOWING"), 200);
        assert_eq!(action_port_offset("SEND_MESSAGE"), 100);
        assert_eq!(action_port_offset("GET_UNREAD_MESSAGES"), 100);
        assert_eq!(action_port_offset("CREATE_POST"), 0);
        assert_eq!(action_port_offset("GET_FEED"), 0);
        assert_eq!(action_port_offset("SOMETHING_ELSE"), 0);
    }

    #[test]
    fn request_decodes_by_action() {
        let raw = r#"{"action":"FOLLOW_USER","followerUsername":"alice","followedUsername":"bob"}"#;
        let request: ApiRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(
            request,
            ApiRequest::FollowUser {
                follower_username: "alice".into(),
                followed_username: "bob".into(),
            }
        );
        assert_eq!(request.action(), "FOLLOW_USER");
    }

    #[test]
    fn register_alias_accepted() {
        let raw = r#"{"action":"register","username":"alice","password":"pw"}"#;
        let request: ApiRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(request.action(), "USER_REGISTER");
    }

    #[test]
    fn unknown_action_fails_decoding() {
        let raw = r#"{"action":"TELEPORT","username":"alice"}"#;
        assert!(serde_json::from_str::<ApiRequest>(raw).is_err());
    }

    #[test]
    fn reply_wire_shape() {
        let reply = ApiReply::ok_with(serde_json::json!({
            "username": "alice",
        }))
        .unwrap();
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["username"], "alice");
        assert!(value.get("error").is_none());

        let reply = ApiReply::err("nope");
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["error"], "nope");
    }
}
