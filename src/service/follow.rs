//! Follow-graph service: follow/unfollow edges and their two read views.

use std::sync::Arc;

use serde_json::json;

use crate::replication::ReplicationHandle;
use crate::repository::Repositories;
use crate::service::{ActionHandler, ApiReply, ApiRequest};
use crate::utils::RookeryError;

pub struct FollowHandler {
    repos: Arc<Repositories>,
    replicator: ReplicationHandle,
}

impl FollowHandler {
    pub fn new(
        repos: Arc<Repositories>,
        replicator: ReplicationHandle,
    ) -> Arc<Self> {
        Arc::new(FollowHandler { repos, replicator })
    }

    fn follow(
        &self,
        follower_username: String,
        followed_username: String,
    ) -> Result<ApiReply, RookeryError> {
        let Some(mut follower) = self.repos.users.get(&follower_username)
        else {
            return Ok(ApiReply::err("follower not found"));
        };
        let Some(mut followed) = self.repos.users.get(&followed_username)
        else {
            return Ok(ApiReply::err("user to follow not found"));
        };

        if follower.username.eq_ignore_ascii_case(&followed.username) {
            return Ok(ApiReply::err("cannot follow yourself"));
        }
        if follower.following.contains(&followed.username) {
            return Ok(ApiReply::err("already following this user"));
        }

        follower.following.insert(followed.username.clone());
        followed.followers.insert(follower.username.clone());
        let follower_name = follower.username.clone();
        let followed_name = followed.username.clone();
        self.repos.users.update(follower)?;
        self.repos.users.update(followed)?;

        pf_info!("'{}' now follows '{}'", follower_name, followed_name);
        self.replicator.follow_added(&followed_name, &follower_name);
        Ok(ApiReply::ok())
    }

    fn unfollow(
        &self,
        follower_username: String,
        followed_username: String,
    ) -> Result<ApiReply, RookeryError> {
        let Some(mut follower) = self.repos.users.get(&follower_username)
        else {
            return Ok(ApiReply::err("follower not found"));
        };
        let Some(mut followed) = self.repos.users.get(&followed_username)
        else {
            return Ok(ApiReply::err("user to unfollow not found"));
        };

        if !follower.following.contains(&followed.username) {
            return Ok(ApiReply::err("not following this user"));
        }

        follower.following.remove(&followed.username);
        followed.followers.remove(&follower.username);
        let follower_name = follower.username.clone();
        let followed_name = followed.username.clone();
        self.repos.users.update(follower)?;
        self.repos.users.update(followed)?;

        pf_info!(
            "'{}' no longer follows '{}'",
            follower_name,
            followed_name
        );
        self.replicator.follow_removed(&followed_name, &follower_name);
        Ok(ApiReply::ok())
    }

    fn followers(&self, username: String) -> Result<ApiReply, RookeryError> {
        let Some(user) = self.repos.users.get(&username) else {
            return Ok(ApiReply::err("user not found"));
        };
        ApiReply::ok_with(json!({
            "count": user.followers.len(),
            "followers": user.followers,
        }))
    }

    fn following(&self, username: String) -> Result<ApiReply, RookeryError> {
        let Some(user) = self.repos.users.get(&username) else {
            return Ok(ApiReply::err("user not found"));
        };
        ApiReply::ok_with(json!({
            "count": user.following.len(),
            "following": user.following,
        }))
    }
}

impl ActionHandler for FollowHandler {
    fn handles(&self) -> &'static [&'static str] {
        &[
            "FOLLOW_USER",
            "UNFOLLOW_USER",
            "GET_FOLLOWERS",
            "GET_FOLLOWING",
        ]
    }

    fn dispatch(
        &self,
        request: ApiRequest,
    ) -> Result<ApiReply, RookeryError> {
        match request {
            ApiRequest::FollowUser {
                follower_username,
                followed_username,
            } => self.follow(follower_username, followed_username),
            ApiRequest::UnfollowUser {
                follower_username,
                followed_username,
            } => self.unfollow(follower_username, followed_username),
            ApiRequest::GetFollowers { username } => {
                self.followers(username)
            }
            ApiRequest::GetFollowing { username } => {
                self.following(username)
            }
            other => Ok(ApiReply::err(format!(
                "action {} not served here",
                other.action()
            ))),
        }
    }
}
