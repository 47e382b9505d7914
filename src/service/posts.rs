//! Post service: authoring, editing, per-user timelines, and the
//! follow-graph feed.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::replication::ReplicationHandle;
use crate::repository::{Post, Repositories};
use crate::service::{ActionHandler, ApiReply, ApiRequest};
use crate::utils::RookeryError;

pub struct PostsHandler {
    repos: Arc<Repositories>,
    replicator: ReplicationHandle,
}

impl PostsHandler {
    pub fn new(
        repos: Arc<Repositories>,
        replicator: ReplicationHandle,
    ) -> Arc<Self> {
        Arc::new(PostsHandler { repos, replicator })
    }

    fn create(
        &self,
        username: String,
        content: String,
    ) -> Result<ApiReply, RookeryError> {
        if self.repos.users.get(&username).is_none() {
            return Ok(ApiReply::err("user not found"));
        }

        let post =
            Post::new(Uuid::new_v4().to_string(), username, content);
        self.repos.posts.add(post.clone())?;
        pf_info!("post {} created by '{}'", post.id, post.username);
        self.replicator.post_created(&post);

        ApiReply::ok_with(json!({
            "postId": post.id,
            "username": post.username,
            "createdAt": post.created_at,
        }))
    }

    fn update(
        &self,
        post_id: String,
        username: String,
        content: String,
    ) -> Result<ApiReply, RookeryError> {
        let Some(mut post) = self.repos.posts.get_by_id(&post_id) else {
            return Ok(ApiReply::err("post not found"));
        };
        if !post.username.eq_ignore_ascii_case(&username) {
            return Ok(ApiReply::err("only the author may update the post"));
        }

        post.content = content;
        post.updated_at = Utc::now();
        self.repos.posts.update(post.clone())?;
        pf_info!("post {} updated", post.id);
        self.replicator.post_updated(&post);

        ApiReply::ok_with(json!({
            "postId": post.id,
            "updatedAt": post.updated_at,
        }))
    }

    fn delete(
        &self,
        post_id: String,
        username: String,
    ) -> Result<ApiReply, RookeryError> {
        let Some(post) = self.repos.posts.get_by_id(&post_id) else {
            return Ok(ApiReply::err("post not found"));
        };
        if !post.username.eq_ignore_ascii_case(&username) {
            return Ok(ApiReply::err("only the author may delete the post"));
        }

        self.repos.posts.remove(&post_id)?;
        pf_info!("post {} deleted", post_id);
        self.replicator.post_deleted(&post_id);
        Ok(ApiReply::ok())
    }

    fn user_posts(&self, username: String) -> Result<ApiReply, RookeryError> {
        if self.repos.users.get(&username).is_none() {
            return Ok(ApiReply::err("user not found"));
        }
        let posts = self.repos.posts.get_by_username(&username);
        ApiReply::ok_with(json!({
            "count": posts.len(),
            "posts": posts,
        }))
    }

    fn feed(
        &self,
        username: String,
        limit: usize,
    ) -> Result<ApiReply, RookeryError> {
        let Some(user) = self.repos.users.get(&username) else {
            return Ok(ApiReply::err("user not found"));
        };

        // the feed covers followed users plus the requester's own posts
        let mut authors: Vec<String> =
            user.following.iter().cloned().collect();
        authors.push(user.username.clone());

        let posts = self.repos.posts.recent_posts_by_users(&authors, limit);
        ApiReply::ok_with(json!({
            "count": posts.len(),
            "posts": posts,
        }))
    }
}

impl ActionHandler for PostsHandler {
    fn handles(&self) -> &'static [&'static str] {
        &[
            "CREATE_POST",
            "UPDATE_POST",
            "DELETE_POST",
            "GET_USER_POSTS",
            "GET_FEED",
        ]
    }

    fn dispatch(
        &self,
        request: ApiRequest,
    ) -> Result<ApiReply, RookeryError> {
        match request {
            ApiRequest::CreatePost { username, content } => {
                self.create(username, content)
            }
            ApiRequest::UpdatePost {
                post_id,
                username,
                content,
            } => self.update(post_id, username, content),
            ApiRequest::DeletePost { post_id, username } => {
                self.delete(post_id, username)
            }
            ApiRequest::GetUserPosts { username } => {
                self.user_posts(username)
            }
            ApiRequest::GetFeed { username, limit } => {
                self.feed(username, limit)
            }
            other => Ok(ApiReply::err(format!(
                "action {} not served here",
                other.action()
            ))),
        }
    }
}

#[cfg(test)]
mod posts_tests {
    use super::*;
    use crate::clock::ClockManager;
    use crate::context::CoordinationContext;
    use crate::replication::{EventBody, ReplicationEvent};
    use crate::repository::User;
    use tokio::sync::mpsc;

    fn handler() -> (
        tempfile::TempDir,
        Arc<PostsHandler>,
        mpsc::UnboundedReceiver<ReplicationEvent>,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let repos = Repositories::open(
            &dir.path().join("users.snap"),
            &dir.path().join("posts.snap"),
            &dir.path().join("messages.snap"),
        )
        .unwrap();
        repos
            .users
            .add(User::new("alice".into(), "pw".into()))
            .unwrap();
        repos
            .users
            .add(User::new("bob".into(), "pw".into()))
            .unwrap();

        let ctx = Arc::new(CoordinationContext::new(
            "s1".into(),
            "127.0.0.1".into(),
            5555,
            6000,
            ClockManager::new_ephemeral(),
        ));
        let (replicator, rx_event) = ReplicationHandle::new_for_test(ctx);
        let handler = PostsHandler::new(repos, replicator);
        (dir, handler, rx_event)
    }

    fn created_post_id(reply: &ApiReply) -> String {
        reply.body["postId"].as_str().unwrap().to_string()
    }

    #[test]
    fn crud_round_trip() -> Result<(), RookeryError> {
        let (_dir, handler, mut rx_event) = handler();

        let reply = handler.dispatch(ApiRequest::CreatePost {
            username: "alice".into(),
            content: "first!".into(),
        })?;
        assert!(reply.success);
        let post_id = created_post_id(&reply);
        assert!(matches!(
            rx_event.try_recv().unwrap().body,
            EventBody::PostCreated { .. }
        ));

        let reply = handler.dispatch(ApiRequest::UpdatePost {
            post_id: post_id.clone(),
            username: "alice".into(),
            content: "edited".into(),
        })?;
        assert!(reply.success);
        assert!(matches!(
            rx_event.try_recv().unwrap().body,
            EventBody::PostUpdated { .. }
        ));

        let reply = handler.dispatch(ApiRequest::GetUserPosts {
            username: "alice".into(),
        })?;
        assert_eq!(reply.body["count"], 1);
        assert_eq!(reply.body["posts"][0]["content"], "edited");

        let reply = handler.dispatch(ApiRequest::DeletePost {
            post_id: post_id.clone(),
            username: "alice".into(),
        })?;
        assert!(reply.success);
        assert!(matches!(
            rx_event.try_recv().unwrap().body,
            EventBody::PostDeleted { .. }
        ));

        let reply = handler.dispatch(ApiRequest::UpdatePost {
            post_id,
            username: "alice".into(),
            content: "too late".into(),
        })?;
        assert_eq!(reply.error.as_deref(), Some("post not found"));
        Ok(())
    }

    #[test]
    fn only_author_may_mutate() -> Result<(), RookeryError> {
        let (_dir, handler, mut rx_event) = handler();
        let reply = handler.dispatch(ApiRequest::CreatePost {
            username: "alice".into(),
            content: "mine".into(),
        })?;
        let post_id = created_post_id(&reply);
        rx_event.try_recv().unwrap();

        let reply = handler.dispatch(ApiRequest::UpdatePost {
            post_id: post_id.clone(),
            username: "bob".into(),
            content: "hijack".into(),
        })?;
        assert!(!reply.success);

        let reply = handler.dispatch(ApiRequest::DeletePost {
            post_id,
            username: "bob".into(),
        })?;
        assert!(!reply.success);

        // neither rejected mutation replicated anything
        assert!(rx_event.try_recv().is_err());
        Ok(())
    }

    #[test]
    fn feed_includes_followed_and_self() -> Result<(), RookeryError> {
        let (_dir, handler, _rx_event) = handler();
        handler.dispatch(ApiRequest::CreatePost {
            username: "alice".into(),
            content: "from alice".into(),
        })?;
        handler.dispatch(ApiRequest::CreatePost {
            username: "bob".into(),
            content: "from bob".into(),
        })?;

        // alice follows bob
        let mut alice = handler.repos.users.get("alice").unwrap();
        alice.following.insert("bob".into());
        handler.repos.users.update(alice)?;

        let reply = handler.dispatch(ApiRequest::GetFeed {
            username: "alice".into(),
            limit: 10,
        })?;
        assert_eq!(reply.body["count"], 2);

        // bob follows nobody, so only his own posts show
        let reply = handler.dispatch(ApiRequest::GetFeed {
            username: "bob".into(),
            limit: 10,
        })?;
        assert_eq!(reply.body["count"], 1);
        Ok(())
    }

    #[test]
    fn unknown_author_rejected() -> Result<(), RookeryError> {
        let (_dir, handler, mut rx_event) = handler();
        let reply = handler.dispatch(ApiRequest::CreatePost {
            username: "ghost".into(),
            content: "boo".into(),
        })?;
        assert_eq!(reply.error.as_deref(), Some("user not found"));
        assert!(rx_event.try_recv().is_err());
        Ok(())
    }
}
