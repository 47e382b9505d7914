//! Direct-message service: sending, read receipts, and history views.

use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use crate::replication::ReplicationHandle;
use crate::repository::{Message, Repositories};
use crate::service::{ActionHandler, ApiReply, ApiRequest};
use crate::utils::RookeryError;

pub struct MessagesHandler {
    repos: Arc<Repositories>,
    replicator: ReplicationHandle,
}

impl MessagesHandler {
    pub fn new(
        repos: Arc<Repositories>,
        replicator: ReplicationHandle,
    ) -> Arc<Self> {
        Arc::new(MessagesHandler { repos, replicator })
    }

    fn send(
        &self,
        sender_username: String,
        receiver_username: String,
        content: String,
    ) -> Result<ApiReply, RookeryError> {
        if self.repos.users.get(&sender_username).is_none() {
            return Ok(ApiReply::err("sender not found"));
        }
        if self.repos.users.get(&receiver_username).is_none() {
            return Ok(ApiReply::err("receiver not found"));
        }

        let message = Message::new(
            Uuid::new_v4().to_string(),
            sender_username,
            receiver_username,
            content,
        );
        self.repos.messages.add(message.clone())?;
        pf_info!(
            "message {} sent from '{}' to '{}'",
            message.id,
            message.sender_username,
            message.receiver_username
        );
        self.replicator.message_sent(&message);

        ApiReply::ok_with(json!({
            "messageId": message.id,
            "sentAt": message.sent_at,
        }))
    }

    fn mark_read(
        &self,
        message_id: String,
        username: String,
    ) -> Result<ApiReply, RookeryError> {
        let Some(mut message) = self.repos.messages.get_by_id(&message_id)
        else {
            return Ok(ApiReply::err("message not found"));
        };
        if !message.receiver_username.eq_ignore_ascii_case(&username) {
            return Ok(ApiReply::err(
                "only the receiver may mark the message as read",
            ));
        }
        if message.read {
            return Ok(ApiReply::err("message is already marked as read"));
        }

        message.mark_read();
        self.repos.messages.update(message.clone())?;
        pf_info!("message {} marked as read", message.id);
        // replicated as the full updated record so peers converge on the
        // read flag and timestamp
        self.replicator.message_sent(&message);

        ApiReply::ok_with(json!({
            "messageId": message.id,
            "readAt": message.read_at,
        }))
    }

    fn conversation(
        &self,
        username1: String,
        username2: String,
    ) -> Result<ApiReply, RookeryError> {
        if self.repos.users.get(&username1).is_none()
            || self.repos.users.get(&username2).is_none()
        {
            return Ok(ApiReply::err("one or both users not found"));
        }
        let messages =
            self.repos.messages.conversation(&username1, &username2);
        ApiReply::ok_with(json!({
            "count": messages.len(),
            "messages": messages,
        }))
    }

    fn unread(&self, username: String) -> Result<ApiReply, RookeryError> {
        if self.repos.users.get(&username).is_none() {
            return Ok(ApiReply::err("user not found"));
        }
        let messages = self.repos.messages.get_unread_by_receiver(&username);
        ApiReply::ok_with(json!({
            "count": messages.len(),
            "messages": messages,
        }))
    }
}

impl ActionHandler for MessagesHandler {
    fn handles(&self) -> &'static [&'static str] {
        &[
            "SEND_MESSAGE",
            "MARK_AS_READ",
            "GET_CONVERSATION",
            "GET_UNREAD_MESSAGES",
        ]
    }

    fn dispatch(
        &self,
        request: ApiRequest,
    ) -> Result<ApiReply, RookeryError> {
        match request {
            ApiRequest::SendMessage {
                sender_username,
                receiver_username,
                content,
            } => self.send(sender_username, receiver_username, content),
            ApiRequest::MarkAsRead {
                message_id,
                username,
            } => self.mark_read(message_id, username),
            ApiRequest::GetConversation {
                username1,
                username2,
            } => self.conversation(username1, username2),
            ApiRequest::GetUnreadMessages { username } => {
                self.unread(username)
            }
            other => Ok(ApiReply::err(format!(
                "action {} not served here",
                other.action()
            ))),
        }
    }
}
