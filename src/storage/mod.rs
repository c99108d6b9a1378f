pub mod chat_db;
pub mod database;
pub mod models;

pub use chat_db::SqliteStorage;
pub use models::{Chat, User};

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::common::{Message, PeerAddressKey};

pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("message already exists: {0}")]
    DuplicateMessage(String),

    #[error("message not found: {0}")]
    MessageNotFound(String),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Persistence port consumed by the router, the validator and the handlers.
///
/// Membership and invitations are never cached by callers; every admission
/// decision goes through these reads.
pub trait Storage: Send + Sync {
    /// Top-level persistence. A second message with the same id is rejected
    /// with [`StorageError::DuplicateMessage`].
    fn store_message(&self, message: &Message) -> StorageResult<()>;

    /// Idempotent insert used when merging sync batches. Returns whether the
    /// message was new.
    fn merge_message(&self, message: &Message) -> StorageResult<bool>;

    fn retrieve_message(&self, message_id: &str) -> StorageResult<Message>;

    fn chat_messages(&self, chat_id: &str) -> StorageResult<Vec<Message>>;

    fn users_in_chat(&self, chat_id: &str) -> StorageResult<Vec<User>>;

    /// Chat ids `peer_id` currently holds an invitation for.
    fn invitations(&self, peer_id: &str) -> StorageResult<Vec<String>>;

    /// Adds the membership and consumes any pending invitation for the chat.
    fn peer_joined_chat(&self, peer_id: &str, chat_id: &str, joined_at: i64) -> StorageResult<()>;

    fn peer_left_chat(&self, peer_id: &str, chat_id: &str) -> StorageResult<()>;

    fn chat_created(&self, chat_name: &str, chat_id: &str) -> StorageResult<()>;

    fn chat(&self, chat_id: &str) -> StorageResult<Option<Chat>>;

    fn peer_got_invited_to_chat(&self, peer_id: &str, chat_id: &str) -> StorageResult<()>;

    /// Records the peers listed in the invitation carried by `message_id`.
    fn invited_to_chat(&self, message_id: &str, peers: &[PeerAddressKey]) -> StorageResult<()>;

    fn peer_set_username(&self, peer_id: &str, chat_id: &str, username: &str)
    -> StorageResult<()>;

    /// Every address known to belong to the chat: members, inviters and
    /// invited peers.
    fn chat_peer_addresses(&self, chat_id: &str) -> StorageResult<Vec<String>>;

    /// Senders of invitations received for the chat.
    fn inviters(&self, chat_id: &str) -> StorageResult<Vec<User>>;
}

/// Ensure the parent directory of a data file exists
pub fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
