//! One handler per operation tag.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use regex::Regex;
use sha2::{Digest, Sha256};

use super::registry::MessageHandler;
use crate::common::{
    ChatEvent, EventSink, FileContent, InviteContent, LocalPeer, Message, TextContent,
    UsernameContent,
};
use crate::error::{Error, Result};
use crate::storage::Storage;
use crate::sync::SyncProtocol;

static PEER_ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^wss?://[A-Za-z0-9.\-]+:[0-9]{1,5}$").expect("peer address pattern is valid")
});

pub struct SendMessageHandler {
    events: EventSink,
}

impl SendMessageHandler {
    pub fn new(events: EventSink) -> Self {
        Self { events }
    }
}

impl MessageHandler for SendMessageHandler {
    fn handle(&self, message: &Message) -> Result<Vec<Message>> {
        let content: TextContent = message.decode_content()?;
        self.events.emit(ChatEvent::MessageReceived {
            sender_id: message.sender_id.clone(),
            chat_id: message.chat_id.clone(),
            text: content.message,
        });
        Ok(Vec::new())
    }
}

pub struct JoinChatHandler {
    storage: Arc<dyn Storage>,
    events: EventSink,
}

impl JoinChatHandler {
    pub fn new(storage: Arc<dyn Storage>, events: EventSink) -> Self {
        Self { storage, events }
    }
}

impl MessageHandler for JoinChatHandler {
    fn handle(&self, message: &Message) -> Result<Vec<Message>> {
        self.storage
            .peer_joined_chat(&message.sender_id, &message.chat_id, message.timestamp)?;
        self.events.emit(ChatEvent::PeerJoined {
            peer_id: message.sender_id.clone(),
            chat_id: message.chat_id.clone(),
        });
        Ok(Vec::new())
    }
}

pub struct LeaveChatHandler {
    storage: Arc<dyn Storage>,
    events: EventSink,
}

impl LeaveChatHandler {
    pub fn new(storage: Arc<dyn Storage>, events: EventSink) -> Self {
        Self { storage, events }
    }
}

impl MessageHandler for LeaveChatHandler {
    fn handle(&self, message: &Message) -> Result<Vec<Message>> {
        self.storage
            .peer_left_chat(&message.sender_id, &message.chat_id)?;
        self.events.emit(ChatEvent::PeerLeft {
            peer_id: message.sender_id.clone(),
            chat_id: message.chat_id.clone(),
        });
        Ok(Vec::new())
    }
}

/// Records the chat, the invitation itself and one pending invitation per
/// listed peer.
pub struct InviteToChatHandler {
    storage: Arc<dyn Storage>,
    events: EventSink,
}

impl InviteToChatHandler {
    pub fn new(storage: Arc<dyn Storage>, events: EventSink) -> Self {
        Self { storage, events }
    }
}

impl MessageHandler for InviteToChatHandler {
    fn handle(&self, message: &Message) -> Result<Vec<Message>> {
        let content: InviteContent = message.decode_content()?;
        if content.chat_id != message.chat_id {
            return Err(Error::Decode(format!(
                "invitation {} names chat {} but is addressed to chat {}",
                message.id, content.chat_id, message.chat_id
            )));
        }

        self.storage
            .chat_created(&content.chat_name, &content.chat_id)?;
        self.storage.invited_to_chat(&message.id, &content.peers)?;
        for peer in &content.peers {
            self.storage
                .peer_got_invited_to_chat(&peer.public_key, &content.chat_id)?;
        }

        self.events.emit(ChatEvent::Invited {
            inviter_id: message.sender_id.clone(),
            chat_id: content.chat_id,
            chat_name: content.chat_name,
            peer_addresses: content.peers.into_iter().map(|peer| peer.address).collect(),
        });
        Ok(Vec::new())
    }
}

pub struct SetUsernameHandler {
    storage: Arc<dyn Storage>,
    events: EventSink,
}

impl SetUsernameHandler {
    pub fn new(storage: Arc<dyn Storage>, events: EventSink) -> Self {
        Self { storage, events }
    }
}

impl MessageHandler for SetUsernameHandler {
    fn handle(&self, message: &Message) -> Result<Vec<Message>> {
        let content: UsernameContent = message.decode_content()?;
        self.storage
            .peer_set_username(&message.sender_id, &message.chat_id, &content.username)?;
        self.events.emit(ChatEvent::UsernameChanged {
            peer_id: message.sender_id.clone(),
            chat_id: message.chat_id.clone(),
            username: content.username,
        });
        Ok(Vec::new())
    }
}

/// Writes received files under `file_dir`. Identical content already stored
/// under the same name is reused.
pub struct SendFileHandler {
    file_dir: PathBuf,
    events: EventSink,
}

impl SendFileHandler {
    pub fn new(file_dir: PathBuf, events: EventSink) -> Self {
        Self { file_dir, events }
    }

    fn store(&self, content: &FileContent, data: &[u8]) -> Result<PathBuf> {
        // Only the final path component of a remote name is used.
        let base_name = Path::new(&content.file_name)
            .file_name()
            .and_then(|name| name.to_str())
            .filter(|name| !name.is_empty() && *name != "..")
            .unwrap_or("file");
        let extension = content.file_extension.trim_start_matches('.');

        fs::create_dir_all(&self.file_dir)?;
        let path = self.file_dir.join(file_name(base_name, extension, None));

        if path.exists() {
            if sha256_hex(&fs::read(&path)?) == sha256_hex(data) {
                return Ok(path);
            }
            let path = self.unique_path(base_name, extension);
            fs::write(&path, data)?;
            return Ok(path);
        }

        fs::write(&path, data)?;
        Ok(path)
    }

    fn unique_path(&self, base_name: &str, extension: &str) -> PathBuf {
        (1..)
            .map(|counter| self.file_dir.join(file_name(base_name, extension, Some(counter))))
            .find(|candidate| !candidate.exists())
            .unwrap_or_else(|| self.file_dir.join(base_name))
    }
}

fn file_name(base_name: &str, extension: &str, counter: Option<u32>) -> String {
    let stem = match counter {
        Some(counter) => format!("{base_name}_{counter}"),
        None => base_name.to_string(),
    };
    if extension.is_empty() {
        stem
    } else {
        format!("{stem}.{extension}")
    }
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

impl MessageHandler for SendFileHandler {
    fn handle(&self, message: &Message) -> Result<Vec<Message>> {
        let content: FileContent = message.decode_content()?;
        let data = BASE64.decode(content.file_content.as_bytes())?;
        let path = self.store(&content, &data)?;
        log::info!(
            "Stored file from {} in chat {} at {}",
            message.sender_id,
            message.chat_id,
            path.display()
        );

        self.events.emit(ChatEvent::FileReceived {
            sender_id: message.sender_id.clone(),
            chat_id: message.chat_id.clone(),
            path,
        });
        Ok(Vec::new())
    }
}

pub struct SyncRequestHandler {
    sync: Arc<SyncProtocol>,
}

impl SyncRequestHandler {
    pub fn new(sync: Arc<SyncProtocol>) -> Self {
        Self { sync }
    }
}

impl MessageHandler for SyncRequestHandler {
    fn handle(&self, message: &Message) -> Result<Vec<Message>> {
        self.sync.respond(message)
    }
}

pub struct SyncResponseHandler {
    sync: Arc<SyncProtocol>,
    events: EventSink,
}

impl SyncResponseHandler {
    pub fn new(sync: Arc<SyncProtocol>, events: EventSink) -> Self {
        Self { sync, events }
    }
}

impl MessageHandler for SyncResponseHandler {
    fn handle(&self, message: &Message) -> Result<Vec<Message>> {
        let merged = self.sync.merge_response(message)?;
        log::debug!(
            "Merged {merged} messages into chat {} from {}",
            message.chat_id,
            message.sender_address
        );
        self.events.emit(ChatEvent::HistorySynced {
            chat_id: message.chat_id.clone(),
            merged,
        });
        Ok(Vec::new())
    }
}

pub struct UserOfflineHandler {
    events: EventSink,
}

impl UserOfflineHandler {
    pub fn new(events: EventSink) -> Self {
        Self { events }
    }
}

impl MessageHandler for UserOfflineHandler {
    fn handle(&self, message: &Message) -> Result<Vec<Message>> {
        let address: String = message.decode_content()?;
        self.events.emit(ChatEvent::PeerOffline(address));
        Ok(Vec::new())
    }
}

/// Learns this process's own reachable address.
pub struct NetworkOnlineHandler {
    local: Arc<LocalPeer>,
    events: EventSink,
}

impl NetworkOnlineHandler {
    pub fn new(local: Arc<LocalPeer>, events: EventSink) -> Self {
        Self { local, events }
    }
}

impl MessageHandler for NetworkOnlineHandler {
    fn handle(&self, message: &Message) -> Result<Vec<Message>> {
        let address: String = message.decode_content()?;
        if !PEER_ADDRESS.is_match(&address) {
            return Err(Error::InvalidAddress(address));
        }

        self.local.set_address(address.clone());
        self.events.emit(ChatEvent::NetworkOnline(address));
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Operation, PeerAddressKey};
    use crate::storage::SqliteStorage;
    use tokio::sync::mpsc;

    fn sink() -> (EventSink, mpsc::Receiver<ChatEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (EventSink::new(tx), rx)
    }

    fn file_message(name: &str, data: &[u8]) -> Message {
        let content = FileContent {
            file_name: name.to_string(),
            file_extension: "txt".to_string(),
            file_content: BASE64.encode(data),
        };
        Message::new(
            Operation::SendFile,
            "chat1",
            serde_json::to_string(&content).unwrap(),
        )
        .from_peer("userA", "ws://userA.onion:2222")
    }

    #[test]
    fn invite_records_pending_invitations() {
        let storage = Arc::new(SqliteStorage::in_memory().unwrap());
        let (events, mut rx) = sink();
        let handler = InviteToChatHandler::new(storage.clone(), events);

        let content = InviteContent {
            chat_id: "chat1".into(),
            chat_name: "Cool Chat".into(),
            peers: vec![PeerAddressKey {
                address: "ws://userB.onion:2222".into(),
                public_key: "userB".into(),
            }],
        };
        let message = Message::new(
            Operation::InviteToChat,
            "chat1",
            serde_json::to_string(&content).unwrap(),
        )
        .from_peer("userA", "ws://userA.onion:2222");

        assert!(handler.handle(&message).unwrap().is_empty());
        assert_eq!(storage.invitations("userB").unwrap(), vec!["chat1"]);
        assert_eq!(storage.chat("chat1").unwrap().unwrap().name, "Cool Chat");
        assert!(matches!(
            rx.try_recv().unwrap(),
            ChatEvent::Invited { inviter_id, .. } if inviter_id == "userA"
        ));
    }

    #[test]
    fn invite_for_a_different_chat_is_malformed() {
        let storage = Arc::new(SqliteStorage::in_memory().unwrap());
        let (events, _rx) = sink();
        let handler = InviteToChatHandler::new(storage, events);
        let content = InviteContent {
            chat_id: "chat2".into(),
            chat_name: "Other".into(),
            peers: Vec::new(),
        };
        let message = Message::new(
            Operation::InviteToChat,
            "chat1",
            serde_json::to_string(&content).unwrap(),
        );
        assert!(matches!(handler.handle(&message), Err(Error::Decode(_))));
    }

    #[test]
    fn files_are_deduplicated_by_hash() {
        let dir = tempfile::tempdir().unwrap();
        let (events, mut rx) = sink();
        let handler = SendFileHandler::new(dir.path().to_path_buf(), events);

        handler.handle(&file_message("notes", b"first")).unwrap();
        handler.handle(&file_message("notes", b"first")).unwrap();
        handler.handle(&file_message("notes", b"second")).unwrap();

        assert_eq!(fs::read(dir.path().join("notes.txt")).unwrap(), b"first");
        assert_eq!(fs::read(dir.path().join("notes_1.txt")).unwrap(), b"second");
        assert!(!dir.path().join("notes_2.txt").exists());

        let mut paths = Vec::new();
        while let Ok(ChatEvent::FileReceived { path, .. }) = rx.try_recv() {
            paths.push(path);
        }
        assert_eq!(paths.len(), 3);
        assert_eq!(paths[0], paths[1]);
    }

    #[test]
    fn remote_file_names_cannot_escape_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let (events, _rx) = sink();
        let handler = SendFileHandler::new(dir.path().join("files"), events);

        handler.handle(&file_message("../../evil", b"x")).unwrap();
        assert!(dir.path().join("files").join("evil.txt").exists());
    }

    #[test]
    fn invalid_base64_is_a_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let (events, _rx) = sink();
        let handler = SendFileHandler::new(dir.path().to_path_buf(), events);
        let mut message = file_message("notes", b"x");
        message.content = r#"{"fileName":"a","fileExtension":"txt","fileContent":"***"}"#.into();
        assert!(matches!(handler.handle(&message), Err(Error::Decode(_))));
    }

    #[test]
    fn network_online_sets_local_address() {
        let local = Arc::new(LocalPeer::new("me"));
        let (events, mut rx) = sink();
        let handler = NetworkOnlineHandler::new(local.clone(), events);

        let online = Message::new(Operation::NetworkOnline, "", "\"ws://abc.onion:2222\"");
        handler.handle(&online).unwrap();
        assert_eq!(local.address().as_deref(), Some("ws://abc.onion:2222"));
        assert_eq!(
            rx.try_recv().unwrap(),
            ChatEvent::NetworkOnline("ws://abc.onion:2222".into())
        );

        let bogus = Message::new(Operation::NetworkOnline, "", "\"not an address\"");
        assert!(matches!(handler.handle(&bogus), Err(Error::InvalidAddress(_))));
    }
}
