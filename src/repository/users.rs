//! User repository: accounts keyed by case-insensitive username, carrying
//! the follower/following sets.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::repository::{load_snapshot, save_snapshot};
use crate::utils::RookeryError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub username: String,
    pub password: String,
    pub created_at: DateTime<Utc>,
    pub followers: BTreeSet<String>,
    pub following: BTreeSet<String>,
}

impl User {
    pub fn new(username: String, password: String) -> Self {
        User {
            username,
            password,
            created_at: Utc::now(),
            followers: BTreeSet::new(),
            following: BTreeSet::new(),
        }
    }

    pub fn with_created_at(
        username: String,
        password: String,
        created_at: DateTime<Utc>,
    ) -> Self {
        User {
            username,
            password,
            created_at,
            followers: BTreeSet::new(),
            following: BTreeSet::new(),
        }
    }
}

#[derive(Debug)]
pub struct UserRepo {
    path: PathBuf,
    users: Mutex<HashMap<String, User>>,
}

impl UserRepo {
    pub fn open(path: &Path) -> Result<Self, RookeryError> {
        let users = load_snapshot(path)?;
        pf_info!("loaded {} users from '{}'", users.len(), path.display());
        Ok(UserRepo {
            path: path.to_path_buf(),
            users: Mutex::new(users),
        })
    }

    /// Adds a user. Returns `Ok(false)` if the username (case-insensitive)
    /// is already taken.
    pub fn add(&self, user: User) -> Result<bool, RookeryError> {
        let key = user.username.to_lowercase();
        let mut users = self.users.lock().unwrap();
        if users.contains_key(&key) {
            return Ok(false);
        }
        users.insert(key, user);
        save_snapshot(&self.path, &users)?;
        Ok(true)
    }

    /// Looks a user up by username, case-insensitively.
    pub fn get(&self, username: &str) -> Option<User> {
        self.users
            .lock()
            .unwrap()
            .get(&username.to_lowercase())
            .cloned()
    }

    /// Replaces an existing user record. Returns `Ok(false)` if unknown.
    pub fn update(&self, user: User) -> Result<bool, RookeryError> {
        let key = user.username.to_lowercase();
        let mut users = self.users.lock().unwrap();
        if !users.contains_key(&key) {
            return Ok(false);
        }
        users.insert(key, user);
        save_snapshot(&self.path, &users)?;
        Ok(true)
    }
}

#[cfg(test)]
mod users_tests {
    use super::*;

    #[test]
    fn add_get_case_insensitive() -> Result<(), RookeryError> {
        let dir = tempfile::tempdir()?;
        let repo = UserRepo::open(&dir.path().join("users.snap"))?;
        assert!(repo.add(User::new("Alice".into(), "pw".into()))?);
        let a = repo.get("alice").unwrap();
        let b = repo.get("ALICE").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.username, "Alice");
        Ok(())
    }

    #[test]
    fn duplicate_add_rejected() -> Result<(), RookeryError> {
        let dir = tempfile::tempdir()?;
        let repo = UserRepo::open(&dir.path().join("users.snap"))?;
        assert!(repo.add(User::new("alice".into(), "pw".into()))?);
        assert!(!repo.add(User::new("Alice".into(), "other".into()))?);
        Ok(())
    }

    #[test]
    fn update_unknown_user_is_noop() -> Result<(), RookeryError> {
        let dir = tempfile::tempdir()?;
        let repo = UserRepo::open(&dir.path().join("users.snap"))?;
        assert!(!repo.update(User::new("ghost".into(), "pw".into()))?);
        Ok(())
    }

    #[test]
    fn snapshot_survives_reopen() -> Result<(), RookeryError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("users.snap");
        {
            let repo = UserRepo::open(&path)?;
            let mut user = User::new("alice".into(), "pw".into());
            user.following.insert("bob".into());
            repo.add(user)?;
        }
        let repo = UserRepo::open(&path)?;
        let alice = repo.get("alice").unwrap();
        assert!(alice.following.contains("bob"));
        Ok(())
    }
}
