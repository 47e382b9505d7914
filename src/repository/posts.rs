//! Post repository: publications keyed by UUID, queried per author and as
//! a recency-ordered feed over a set of authors.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::repository::{load_snapshot, save_snapshot};
use crate::utils::RookeryError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: String,
    pub username: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Post {
    pub fn new(id: String, username: String, content: String) -> Self {
        let now = Utc::now();
        Post {
            id,
            username,
            content,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug)]
pub struct PostRepo {
    path: PathBuf,
    posts: Mutex<HashMap<String, Post>>,
}

impl PostRepo {
    pub fn open(path: &Path) -> Result<Self, RookeryError> {
        let posts = load_snapshot(path)?;
        pf_info!("loaded {} posts from '{}'", posts.len(), path.display());
        Ok(PostRepo {
            path: path.to_path_buf(),
            posts: Mutex::new(posts),
        })
    }

    /// Adds a post. Returns `Ok(false)` if a post with the same ID exists.
    pub fn add(&self, post: Post) -> Result<bool, RookeryError> {
        let mut posts = self.posts.lock().unwrap();
        if posts.contains_key(&post.id) {
            return Ok(false);
        }
        posts.insert(post.id.clone(), post);
        save_snapshot(&self.path, &posts)?;
        Ok(true)
    }

    /// Replaces an existing post. Returns `Ok(false)` if unknown.
    pub fn update(&self, post: Post) -> Result<bool, RookeryError> {
        let mut posts = self.posts.lock().unwrap();
        if !posts.contains_key(&post.id) {
            return Ok(false);
        }
        posts.insert(post.id.clone(), post);
        save_snapshot(&self.path, &posts)?;
        Ok(true)
    }

    /// Deletes a post. Returns `Ok(false)` if it was not present.
    pub fn remove(&self, id: &str) -> Result<bool, RookeryError> {
        let mut posts = self.posts.lock().unwrap();
        if posts.remove(id).is_none() {
            return Ok(false);
        }
        save_snapshot(&self.path, &posts)?;
        Ok(true)
    }

    pub fn get_by_id(&self, id: &str) -> Option<Post> {
        self.posts.lock().unwrap().get(id).cloned()
    }

    /// All posts authored by `username`, most recent first.
    pub fn get_by_username(&self, username: &str) -> Vec<Post> {
        let posts = self.posts.lock().unwrap();
        let mut found: Vec<Post> = posts
            .values()
            .filter(|p| p.username.eq_ignore_ascii_case(username))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        found
    }

    /// The most recent posts authored by any of `usernames`, descending by
    /// creation time, capped at `limit`.
    pub fn recent_posts_by_users(
        &self,
        usernames: &[String],
        limit: usize,
    ) -> Vec<Post> {
        let posts = self.posts.lock().unwrap();
        let mut found: Vec<Post> = posts
            .values()
            .filter(|p| {
                usernames
                    .iter()
                    .any(|u| p.username.eq_ignore_ascii_case(u))
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        found.truncate(limit);
        found
    }
}

#[cfg(test)]
mod posts_tests {
    use super::*;
    use chrono::Duration;

    fn repo() -> (tempfile::TempDir, PostRepo) {
        let dir = tempfile::tempdir().unwrap();
        let repo = PostRepo::open(&dir.path().join("posts.snap")).unwrap();
        (dir, repo)
    }

    #[test]
    fn crud_round_trip() -> Result<(), RookeryError> {
        let (_dir, repo) = repo();
        let post = Post::new("p1".into(), "alice".into(), "hello".into());
        assert!(repo.add(post.clone())?);
        assert_eq!(repo.get_by_id("p1").unwrap().content, "hello");

        let mut updated = repo.get_by_id("p1").unwrap();
        updated.content = "edited".into();
        updated.updated_at = updated.created_at + Duration::seconds(5);
        assert!(repo.update(updated)?);
        let read_back = repo.get_by_id("p1").unwrap();
        assert_eq!(read_back.content, "edited");
        assert!(read_back.updated_at >= read_back.created_at);

        assert!(repo.remove("p1")?);
        assert!(repo.get_by_id("p1").is_none());
        assert!(!repo.remove("p1")?);
        Ok(())
    }

    #[test]
    fn duplicate_id_rejected() -> Result<(), RookeryError> {
        let (_dir, repo) = repo();
        let post = Post::new("p1".into(), "alice".into(), "hello".into());
        assert!(repo.add(post.clone())?);
        assert!(!repo.add(post)?);
        Ok(())
    }

    #[test]
    fn feed_orders_and_limits() -> Result<(), RookeryError> {
        let (_dir, repo) = repo();
        let base = Utc::now();
        for (i, author) in
            ["alice", "bob", "alice", "cara"].iter().enumerate()
        {
            let mut post = Post::new(
                format!("p{}", i),
                (*author).into(),
                format!("post {}", i),
            );
            post.created_at = base + Duration::seconds(i as i64);
            post.updated_at = post.created_at;
            repo.add(post)?;
        }

        let feed = repo.recent_posts_by_users(
            &["alice".into(), "bob".into()],
            2,
        );
        assert_eq!(feed.len(), 2);
        assert_eq!(feed[0].id, "p2");
        assert_eq!(feed[1].id, "p1");
        Ok(())
    }
}
