//! File-backed repositories for the four entity kinds. Each repository is a
//! keyed in-memory map guarded by its own lock, with a MessagePack snapshot
//! rewritten inside the lock after every mutation so that a mutation is
//! durable before the service dispatcher responds.

mod messages;
mod posts;
mod users;

pub use messages::{Message, MessageRepo};
pub use posts::{Post, PostRepo};
pub use users::{User, UserRepo};

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::utils::RookeryError;

/// The three repositories of one backend node, shared with the service
/// dispatchers and the replication applier.
#[derive(Debug)]
pub struct Repositories {
    pub users: UserRepo,
    pub posts: PostRepo,
    pub messages: MessageRepo,
}

impl Repositories {
    pub fn open(
        users_path: &Path,
        posts_path: &Path,
        messages_path: &Path,
    ) -> Result<Arc<Self>, RookeryError> {
        Ok(Arc::new(Repositories {
            users: UserRepo::open(users_path)?,
            posts: PostRepo::open(posts_path)?,
            messages: MessageRepo::open(messages_path)?,
        }))
    }
}

/// Loads a snapshot map from `path`, or an empty map if the file does not
/// exist yet.
pub(crate) fn load_snapshot<T>(
    path: &Path,
) -> Result<HashMap<String, T>, RookeryError>
where
    T: DeserializeOwned,
{
    if !path.exists() {
        pf_debug!(
            "snapshot '{}' not found, starting empty",
            path.display()
        );
        return Ok(HashMap::new());
    }
    let bytes = std::fs::read(path)?;
    let map = rmp_serde::from_slice(&bytes)?;
    Ok(map)
}

/// Rewrites the snapshot at `path`. Called with the repository lock held.
pub(crate) fn save_snapshot<T>(
    path: &Path,
    map: &HashMap<String, T>,
) -> Result<(), RookeryError>
where
    T: Serialize,
{
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    // named-field encoding keeps snapshots readable across record
    // evolution (optional fields may be absent)
    let bytes = rmp_serde::to_vec_named(map)?;
    std::fs::write(path, bytes)?;
    Ok(())
}
