//! User account service: registration and login.

use std::sync::Arc;

use serde_json::json;

use crate::replication::ReplicationHandle;
use crate::repository::{Repositories, User};
use crate::service::{ActionHandler, ApiReply, ApiRequest};
use crate::utils::RookeryError;

pub struct UsersHandler {
    repos: Arc<Repositories>,
    replicator: ReplicationHandle,
}

impl UsersHandler {
    pub fn new(
        repos: Arc<Repositories>,
        replicator: ReplicationHandle,
    ) -> Arc<Self> {
        Arc::new(UsersHandler { repos, replicator })
    }

    fn register(
        &self,
        username: String,
        password: String,
    ) -> Result<ApiReply, RookeryError> {
        if self.repos.users.get(&username).is_some() {
            return Ok(ApiReply::err("username already taken"));
        }

        let user = User::new(username, password);
        if !self.repos.users.add(user.clone())? {
            // raced with a concurrent registration of the same name
            return Ok(ApiReply::err("username already taken"));
        }
        pf_info!("registered user '{}'", user.username);
        self.replicator.user_created(&user);

        ApiReply::ok_with(json!({ "username": user.username }))
    }

    fn login(
        &self,
        username: String,
        password: String,
    ) -> Result<ApiReply, RookeryError> {
        let Some(user) = self.repos.users.get(&username) else {
            return Ok(ApiReply::err("user not found"));
        };
        if user.password != password {
            return Ok(ApiReply::err("incorrect password"));
        }
        pf_debug!("user '{}' logged in", user.username);
        ApiReply::ok_with(json!({ "username": user.username }))
    }
}

impl ActionHandler for UsersHandler {
    fn handles(&self) -> &'static [&'static str] {
        &["USER_REGISTER", "USER_LOGIN"]
    }

    fn dispatch(
        &self,
        request: ApiRequest,
    ) -> Result<ApiReply, RookeryError> {
        match request {
            ApiRequest::UserRegister { username, password } => {
                self.register(username, password)
            }
            ApiRequest::UserLogin { username, password } => {
                self.login(username, password)
            }
            other => Ok(ApiReply::err(format!(
                "action {} not served here",
                other.action()
            ))),
        }
    }
}

#[cfg(test)]
mod users_tests {
    use super::*;
    use crate::clock::ClockManager;
    use crate::context::CoordinationContext;
    use crate::replication::{EventBody, ReplicationEvent};
    use tokio::sync::mpsc;

    fn handler() -> (
        tempfile::TempDir,
        Arc<UsersHandler>,
        mpsc::UnboundedReceiver<ReplicationEvent>,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let repos = Repositories::open(
            &dir.path().join("users.snap"),
            &dir.path().join("posts.snap"),
            &dir.path().join("messages.snap"),
        )
        .unwrap();
        let ctx = Arc::new(CoordinationContext::new(
            "s1".into(),
            "127.0.0.1".into(),
            5555,
            6000,
            ClockManager::new_ephemeral(),
        ));
        let (replicator, rx_event) = ReplicationHandle::new_for_test(ctx);
        let handler = UsersHandler::new(repos, replicator);
        (dir, handler, rx_event)
    }

    #[test]
    fn register_then_login() -> Result<(), RookeryError> {
        let (_dir, handler, mut rx_event) = handler();

        let reply = handler.dispatch(ApiRequest::UserRegister {
            username: "Alice".into(),
            password: "pw".into(),
        })?;
        assert!(reply.success);
        assert_eq!(reply.body["username"], "Alice");

        // exactly one replication event for the mutation
        let event = rx_event.try_recv().unwrap();
        assert!(matches!(event.body, EventBody::UserCreated { .. }));
        assert!(rx_event.try_recv().is_err());

        let reply = handler.dispatch(ApiRequest::UserLogin {
            username: "alice".into(), // case-insensitive lookup
            password: "pw".into(),
        })?;
        assert!(reply.success);
        Ok(())
    }

    #[test]
    fn duplicate_registration_rejected() -> Result<(), RookeryError> {
        let (_dir, handler, mut rx_event) = handler();
        handler.dispatch(ApiRequest::UserRegister {
            username: "alice".into(),
            password: "pw".into(),
        })?;
        rx_event.try_recv().unwrap();

        let reply = handler.dispatch(ApiRequest::UserRegister {
            username: "ALICE".into(),
            password: "other".into(),
        })?;
        assert!(!reply.success);
        // failed mutation must not replicate
        assert!(rx_event.try_recv().is_err());
        Ok(())
    }

    #[test]
    fn login_failures() -> Result<(), RookeryError> {
        let (_dir, handler, _rx_event) = handler();
        handler.dispatch(ApiRequest::UserRegister {
            username: "alice".into(),
            password: "pw".into(),
        })?;

        let reply = handler.dispatch(ApiRequest::UserLogin {
            username: "bob".into(),
            password: "pw".into(),
        })?;
        assert_eq!(reply.error.as_deref(), Some("user not found"));

        let reply = handler.dispatch(ApiRequest::UserLogin {
            username: "alice".into(),
            password: "wrong".into(),
        })?;
        assert_eq!(reply.error.as_deref(), Some("incorrect password"));
        Ok(())
    }
}
