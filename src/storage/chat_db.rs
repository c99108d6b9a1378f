use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Result as SqlResult, Row, params};
use std::path::Path;

use super::database::Database;
use super::models::{Chat, User};
use super::{Storage, StorageError, StorageResult, ensure_parent_dir};
use crate::common::{Message, Operation, PeerAddressKey};

const MESSAGE_COLUMNS: &str = "message_id, timestamp, content, sender_id, receiver_id, \
     sender_address, receiver_address, chat_id, operation";

/// SQLite-backed store for messages, chats, membership and invitations.
pub struct SqliteStorage {
    db: Database,
}

impl SqliteStorage {
    /// Initialize the store at a custom path
    pub fn with_path<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        ensure_parent_dir(path.as_ref())?;
        let db = Database::new(path)?;
        let storage = Self { db };
        storage.init_schema()?;
        Ok(storage)
    }

    pub fn in_memory() -> StorageResult<Self> {
        let db = Database::in_memory()?;
        let storage = Self { db };
        storage.init_schema()?;
        Ok(storage)
    }

    fn init_schema(&self) -> SqlResult<()> {
        self.db.with_connection(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS chats (
                    chat_id TEXT PRIMARY KEY,
                    name TEXT NOT NULL
                )",
                [],
            )?;

            conn.execute(
                "CREATE TABLE IF NOT EXISTS peers (
                    peer_id TEXT PRIMARY KEY,
                    address TEXT NOT NULL DEFAULT ''
                )",
                [],
            )?;

            conn.execute(
                "CREATE TABLE IF NOT EXISTS chat_members (
                    peer_id TEXT NOT NULL,
                    chat_id TEXT NOT NULL,
                    joined_at INTEGER NOT NULL,
                    username TEXT,
                    PRIMARY KEY (peer_id, chat_id)
                )",
                [],
            )?;

            conn.execute(
                "CREATE TABLE IF NOT EXISTS messages (
                    message_id TEXT PRIMARY KEY,
                    timestamp INTEGER NOT NULL,
                    content TEXT NOT NULL,
                    sender_id TEXT NOT NULL,
                    receiver_id TEXT NOT NULL,
                    sender_address TEXT NOT NULL,
                    receiver_address TEXT NOT NULL,
                    chat_id TEXT NOT NULL,
                    operation INTEGER NOT NULL
                )",
                [],
            )?;

            // Peers listed in a received invitation
            conn.execute(
                "CREATE TABLE IF NOT EXISTS invited_peers (
                    message_id TEXT NOT NULL,
                    public_key TEXT NOT NULL,
                    address TEXT NOT NULL,
                    PRIMARY KEY (message_id, public_key)
                )",
                [],
            )?;

            // Pending invitations, consumed on join
            conn.execute(
                "CREATE TABLE IF NOT EXISTS peer_invitations (
                    peer_id TEXT NOT NULL,
                    chat_id TEXT NOT NULL,
                    invited_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
                    PRIMARY KEY (peer_id, chat_id)
                )",
                [],
            )?;

            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_messages_chat_id ON messages(chat_id)",
                [],
            )?;

            Ok(())
        })
    }
}

fn upsert_peer(conn: &Connection, peer_id: &str, address: &str) -> SqlResult<()> {
    if peer_id.is_empty() {
        return Ok(());
    }
    conn.execute(
        "INSERT INTO peers (peer_id, address) VALUES (?1, ?2)
         ON CONFLICT(peer_id) DO UPDATE SET address = excluded.address
         WHERE excluded.address != ''",
        params![peer_id, address],
    )?;
    Ok(())
}

fn insert_message(conn: &Connection, message: &Message, or_ignore: bool) -> SqlResult<usize> {
    let verb = if or_ignore {
        "INSERT OR IGNORE"
    } else {
        "INSERT"
    };
    conn.execute(
        &format!(
            "{verb} INTO messages ({MESSAGE_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
        ),
        params![
            message.id,
            message.timestamp,
            message.content,
            message.sender_id,
            message.receiver_id,
            message.sender_address,
            message.receiver_address,
            message.chat_id,
            u8::from(message.operation),
        ],
    )
}

fn message_from_row(row: &Row<'_>) -> SqlResult<Message> {
    let tag: u8 = row.get(8)?;
    let operation = Operation::try_from(tag)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(8, Type::Integer, err.into()))?;

    Ok(Message {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        content: row.get(2)?,
        sender_id: row.get(3)?,
        receiver_id: row.get(4)?,
        sender_address: row.get(5)?,
        receiver_address: row.get(6)?,
        chat_id: row.get(7)?,
        operation,
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.is_empty())
}

impl Storage for SqliteStorage {
    // ========== Messages ==========

    fn store_message(&self, message: &Message) -> StorageResult<()> {
        let inserted = self.db.with_connection(|conn| {
            let tx = conn.transaction()?;
            let exists = tx
                .query_row(
                    "SELECT 1 FROM messages WHERE message_id = ?1",
                    params![message.id],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if exists {
                return Ok(false);
            }

            upsert_peer(&tx, &message.sender_id, &message.sender_address)?;
            upsert_peer(&tx, &message.receiver_id, &message.receiver_address)?;
            insert_message(&tx, message, false)?;
            tx.commit()?;
            Ok(true)
        })?;

        if inserted {
            Ok(())
        } else {
            Err(StorageError::DuplicateMessage(message.id.clone()))
        }
    }

    fn merge_message(&self, message: &Message) -> StorageResult<bool> {
        let changed = self.db.with_connection(|conn| {
            let tx = conn.transaction()?;
            upsert_peer(&tx, &message.sender_id, &message.sender_address)?;
            let changed = insert_message(&tx, message, true)?;
            tx.commit()?;
            Ok(changed)
        })?;
        Ok(changed == 1)
    }

    fn retrieve_message(&self, message_id: &str) -> StorageResult<Message> {
        let message = self.db.with_connection(|conn| {
            conn.query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE message_id = ?1"),
                params![message_id],
                message_from_row,
            )
            .optional()
        })?;

        message.ok_or_else(|| StorageError::MessageNotFound(message_id.to_string()))
    }

    fn chat_messages(&self, chat_id: &str) -> StorageResult<Vec<Message>> {
        let messages = self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE chat_id = ?1
                 ORDER BY timestamp ASC"
            ))?;
            let messages = stmt
                .query_map(params![chat_id], message_from_row)?
                .collect::<SqlResult<Vec<_>>>()?;
            Ok(messages)
        })?;
        Ok(messages)
    }

    // ========== Membership ==========

    fn users_in_chat(&self, chat_id: &str) -> StorageResult<Vec<User>> {
        let users = self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.peer_id, m.username, p.address
                 FROM chat_members m
                 LEFT JOIN peers p ON p.peer_id = m.peer_id
                 WHERE m.chat_id = ?1
                 ORDER BY m.joined_at ASC",
            )?;
            let users = stmt
                .query_map(params![chat_id], |row| {
                    Ok(User {
                        user_id: row.get(0)?,
                        username: row.get(1)?,
                        address: non_empty(row.get(2)?),
                    })
                })?
                .collect::<SqlResult<Vec<_>>>()?;
            Ok(users)
        })?;
        Ok(users)
    }

    fn peer_joined_chat(&self, peer_id: &str, chat_id: &str, joined_at: i64) -> StorageResult<()> {
        self.db.with_connection(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR IGNORE INTO chat_members (peer_id, chat_id, joined_at)
                 VALUES (?1, ?2, ?3)",
                params![peer_id, chat_id, joined_at],
            )?;
            tx.execute(
                "DELETE FROM peer_invitations WHERE peer_id = ?1 AND chat_id = ?2",
                params![peer_id, chat_id],
            )?;
            tx.commit()
        })?;
        Ok(())
    }

    fn peer_left_chat(&self, peer_id: &str, chat_id: &str) -> StorageResult<()> {
        self.db.with_connection(|conn| {
            conn.execute(
                "DELETE FROM chat_members WHERE peer_id = ?1 AND chat_id = ?2",
                params![peer_id, chat_id],
            )
        })?;
        Ok(())
    }

    fn peer_set_username(
        &self,
        peer_id: &str,
        chat_id: &str,
        username: &str,
    ) -> StorageResult<()> {
        self.db.with_connection(|conn| {
            conn.execute(
                "UPDATE chat_members SET username = ?1 WHERE peer_id = ?2 AND chat_id = ?3",
                params![username, peer_id, chat_id],
            )
        })?;
        Ok(())
    }

    // ========== Chats ==========

    fn chat_created(&self, chat_name: &str, chat_id: &str) -> StorageResult<()> {
        self.db.with_connection(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO chats (chat_id, name) VALUES (?1, ?2)",
                params![chat_id, chat_name],
            )
        })?;
        Ok(())
    }

    fn chat(&self, chat_id: &str) -> StorageResult<Option<Chat>> {
        let chat = self.db.with_connection(|conn| {
            conn.query_row(
                "SELECT chat_id, name FROM chats WHERE chat_id = ?1",
                params![chat_id],
                |row| {
                    Ok(Chat {
                        chat_id: row.get(0)?,
                        name: row.get(1)?,
                    })
                },
            )
            .optional()
        })?;
        Ok(chat)
    }

    fn chat_peer_addresses(&self, chat_id: &str) -> StorageResult<Vec<String>> {
        let addresses = self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT p.address FROM chat_members m
                 JOIN peers p ON p.peer_id = m.peer_id
                 WHERE m.chat_id = ?1
                 UNION
                 SELECT msg.sender_address FROM messages msg
                 WHERE msg.chat_id = ?1 AND msg.operation = ?2
                 UNION
                 SELECT ip.address FROM invited_peers ip
                 JOIN messages msg ON msg.message_id = ip.message_id
                 WHERE msg.chat_id = ?1",
            )?;
            let addresses = stmt
                .query_map(params![chat_id, u8::from(Operation::InviteToChat)], |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<SqlResult<Vec<_>>>()?;
            Ok(addresses)
        })?;

        Ok(addresses
            .into_iter()
            .filter(|address| !address.is_empty())
            .collect())
    }

    // ========== Invitations ==========

    fn invitations(&self, peer_id: &str) -> StorageResult<Vec<String>> {
        let chats = self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT chat_id FROM peer_invitations
                 WHERE peer_id = ?1
                 ORDER BY invited_at ASC",
            )?;
            let chats = stmt
                .query_map(params![peer_id], |row| row.get(0))?
                .collect::<SqlResult<Vec<String>>>()?;
            Ok(chats)
        })?;
        Ok(chats)
    }

    fn peer_got_invited_to_chat(&self, peer_id: &str, chat_id: &str) -> StorageResult<()> {
        self.db.with_connection(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO peer_invitations (peer_id, chat_id) VALUES (?1, ?2)",
                params![peer_id, chat_id],
            )
        })?;
        Ok(())
    }

    fn invited_to_chat(&self, message_id: &str, peers: &[PeerAddressKey]) -> StorageResult<()> {
        self.db.with_connection(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO invited_peers (message_id, public_key, address)
                     VALUES (?1, ?2, ?3)",
                )?;
                for peer in peers {
                    stmt.execute(params![message_id, peer.public_key, peer.address])?;
                    upsert_peer(&tx, &peer.public_key, &peer.address)?;
                }
            }
            tx.commit()
        })?;
        Ok(())
    }

    fn inviters(&self, chat_id: &str) -> StorageResult<Vec<User>> {
        let users = self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT sender_id, sender_address FROM messages
                 WHERE chat_id = ?1 AND operation = ?2",
            )?;
            let users = stmt
                .query_map(params![chat_id, u8::from(Operation::InviteToChat)], |row| {
                    Ok(User {
                        user_id: row.get(0)?,
                        username: None,
                        address: non_empty(row.get(1)?),
                    })
                })?
                .collect::<SqlResult<Vec<_>>>()?;
            Ok(users)
        })?;
        Ok(users)
    }
}
