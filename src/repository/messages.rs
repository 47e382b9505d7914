//! Direct-message repository: messages keyed by UUID, queried per receiver
//! and as a two-party conversation history.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::repository::{load_snapshot, save_snapshot};
use crate::utils::RookeryError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub sender_username: String,
    pub receiver_username: String,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    pub read: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new(
        id: String,
        sender_username: String,
        receiver_username: String,
        content: String,
    ) -> Self {
        Message {
            id,
            sender_username,
            receiver_username,
            content,
            sent_at: Utc::now(),
            read: false,
            read_at: None,
        }
    }

    /// Marks the message read, stamping `read_at` on the first call only.
    pub fn mark_read(&mut self) {
        if !self.read {
            self.read = true;
            self.read_at = Some(Utc::now());
        }
    }
}

#[derive(Debug)]
pub struct MessageRepo {
    path: PathBuf,
    messages: Mutex<HashMap<String, Message>>,
}

impl MessageRepo {
    pub fn open(path: &Path) -> Result<Self, RookeryError> {
        let messages = load_snapshot(path)?;
        pf_info!(
            "loaded {} messages from '{}'",
            messages.len(),
            path.display()
        );
        Ok(MessageRepo {
            path: path.to_path_buf(),
            messages: Mutex::new(messages),
        })
    }

    /// Adds a message. Returns `Ok(false)` if the ID already exists.
    pub fn add(&self, message: Message) -> Result<bool, RookeryError> {
        let mut messages = self.messages.lock().unwrap();
        if messages.contains_key(&message.id) {
            return Ok(false);
        }
        messages.insert(message.id.clone(), message);
        save_snapshot(&self.path, &messages)?;
        Ok(true)
    }

    /// Replaces an existing message. Returns `Ok(false)` if unknown.
    pub fn update(&self, message: Message) -> Result<bool, RookeryError> {
        let mut messages = self.messages.lock().unwrap();
        if !messages.contains_key(&message.id) {
            return Ok(false);
        }
        messages.insert(message.id.clone(), message);
        save_snapshot(&self.path, &messages)?;
        Ok(true)
    }

    pub fn get_by_id(&self, id: &str) -> Option<Message> {
        self.messages.lock().unwrap().get(id).cloned()
    }

    pub fn get_by_receiver(&self, username: &str) -> Vec<Message> {
        let messages = self.messages.lock().unwrap();
        let mut found: Vec<Message> = messages
            .values()
            .filter(|m| m.receiver_username.eq_ignore_ascii_case(username))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.sent_at.cmp(&b.sent_at));
        found
    }

    pub fn get_unread_by_receiver(&self, username: &str) -> Vec<Message> {
        self.get_by_receiver(username)
            .into_iter()
            .filter(|m| !m.read)
            .collect()
    }

    /// Full history between two users, oldest first.
    pub fn conversation(&self, a: &str, b: &str) -> Vec<Message> {
        let messages = self.messages.lock().unwrap();
        let mut found: Vec<Message> = messages
            .values()
            .filter(|m| {
                (m.sender_username.eq_ignore_ascii_case(a)
                    && m.receiver_username.eq_ignore_ascii_case(b))
                    || (m.sender_username.eq_ignore_ascii_case(b)
                        && m.receiver_username.eq_ignore_ascii_case(a))
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| a.sent_at.cmp(&b.sent_at));
        found
    }
}

#[cfg(test)]
mod messages_tests {
    use super::*;
    use chrono::Duration;

    fn repo() -> (tempfile::TempDir, MessageRepo) {
        let dir = tempfile::tempdir().unwrap();
        let repo =
            MessageRepo::open(&dir.path().join("messages.snap")).unwrap();
        (dir, repo)
    }

    #[test]
    fn conversation_is_symmetric_and_ordered() -> Result<(), RookeryError> {
        let (_dir, repo) = repo();
        let base = Utc::now();
        for (i, (from, to)) in
            [("alice", "bob"), ("bob", "alice"), ("alice", "cara")]
                .iter()
                .enumerate()
        {
            let mut msg = Message::new(
                format!("m{}", i),
                (*from).into(),
                (*to).into(),
                format!("msg {}", i),
            );
            msg.sent_at = base + Duration::seconds(i as i64);
            repo.add(msg)?;
        }

        let conv = repo.conversation("bob", "alice");
        assert_eq!(conv.len(), 2);
        assert_eq!(conv[0].id, "m0");
        assert_eq!(conv[1].id, "m1");
        Ok(())
    }

    #[test]
    fn unread_filter_tracks_mark_read() -> Result<(), RookeryError> {
        let (_dir, repo) = repo();
        let msg = Message::new(
            "m1".into(),
            "alice".into(),
            "bob".into(),
            "hi".into(),
        );
        repo.add(msg)?;
        assert_eq!(repo.get_unread_by_receiver("bob").len(), 1);

        let mut msg = repo.get_by_id("m1").unwrap();
        msg.mark_read();
        let first_read_at = msg.read_at;
        repo.update(msg)?;
        assert!(repo.get_unread_by_receiver("bob").is_empty());

        // marking again must not move the read timestamp
        let mut again = repo.get_by_id("m1").unwrap();
        again.mark_read();
        assert_eq!(again.read_at, first_read_at);
        Ok(())
    }

    #[test]
    fn duplicate_id_rejected() -> Result<(), RookeryError> {
        let (_dir, repo) = repo();
        let msg = Message::new(
            "m1".into(),
            "alice".into(),
            "bob".into(),
            "hi".into(),
        );
        assert!(repo.add(msg.clone())?);
        assert!(!repo.add(msg)?);
        Ok(())
    }
}
