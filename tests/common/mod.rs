#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::BoxFuture;
use onion_chat::common::{
    ChatEvent, EventSink, InviteContent, LocalPeer, Message, Operation, PeerAddressKey,
    TextContent,
};
use onion_chat::network::{NetworkConnection, NetworkObserver};
use onion_chat::router::MessageRouter;
use onion_chat::storage::{Chat, SqliteStorage, Storage, StorageResult, User};
use onion_chat::Result;
use tokio::sync::mpsc;

/// Connection that records outbound messages instead of sending them.
#[derive(Default)]
pub struct Outbox {
    pub sent: Mutex<Vec<Message>>,
}

impl Outbox {
    pub fn take(&self) -> Vec<Message> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

impl NetworkConnection for Outbox {
    fn subscribe(&self, _observer: Arc<dyn NetworkObserver>) -> BoxFuture<'_, Result<()>> {
        async { Ok(()) }.boxed()
    }

    fn unsubscribe<'a>(
        &'a self,
        _observer: &'a Arc<dyn NetworkObserver>,
    ) -> BoxFuture<'a, Result<()>> {
        async { Ok(()) }.boxed()
    }

    fn send_to_peer<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Result<()>> {
        self.sent.lock().unwrap().push(message.clone());
        async { Ok(()) }.boxed()
    }
}

/// SQLite store that remembers which ids reached `store_message`.
pub struct RecordingStorage {
    inner: SqliteStorage,
    pub stored: Mutex<Vec<String>>,
}

impl RecordingStorage {
    pub fn new() -> Self {
        Self {
            inner: SqliteStorage::in_memory().unwrap(),
            stored: Mutex::new(Vec::new()),
        }
    }

    pub fn stored_ids(&self) -> Vec<String> {
        self.stored.lock().unwrap().clone()
    }

    pub fn invitations_of(&self, peer_id: &str) -> Vec<String> {
        self.inner.invitations(peer_id).unwrap()
    }

    pub fn member_ids(&self, chat_id: &str) -> Vec<String> {
        self.inner
            .users_in_chat(chat_id)
            .unwrap()
            .into_iter()
            .map(|user| user.user_id)
            .collect()
    }
}

impl Storage for RecordingStorage {
    fn store_message(&self, message: &Message) -> StorageResult<()> {
        self.stored.lock().unwrap().push(message.id.clone());
        self.inner.store_message(message)
    }

    fn merge_message(&self, message: &Message) -> StorageResult<bool> {
        self.inner.merge_message(message)
    }

    fn retrieve_message(&self, message_id: &str) -> StorageResult<Message> {
        self.inner.retrieve_message(message_id)
    }

    fn chat_messages(&self, chat_id: &str) -> StorageResult<Vec<Message>> {
        self.inner.chat_messages(chat_id)
    }

    fn users_in_chat(&self, chat_id: &str) -> StorageResult<Vec<User>> {
        self.inner.users_in_chat(chat_id)
    }

    fn invitations(&self, peer_id: &str) -> StorageResult<Vec<String>> {
        self.inner.invitations(peer_id)
    }

    fn peer_joined_chat(&self, peer_id: &str, chat_id: &str, joined_at: i64) -> StorageResult<()> {
        self.inner.peer_joined_chat(peer_id, chat_id, joined_at)
    }

    fn peer_left_chat(&self, peer_id: &str, chat_id: &str) -> StorageResult<()> {
        self.inner.peer_left_chat(peer_id, chat_id)
    }

    fn chat_created(&self, chat_name: &str, chat_id: &str) -> StorageResult<()> {
        self.inner.chat_created(chat_name, chat_id)
    }

    fn chat(&self, chat_id: &str) -> StorageResult<Option<Chat>> {
        self.inner.chat(chat_id)
    }

    fn peer_got_invited_to_chat(&self, peer_id: &str, chat_id: &str) -> StorageResult<()> {
        self.inner.peer_got_invited_to_chat(peer_id, chat_id)
    }

    fn invited_to_chat(&self, message_id: &str, peers: &[PeerAddressKey]) -> StorageResult<()> {
        self.inner.invited_to_chat(message_id, peers)
    }

    fn peer_set_username(
        &self,
        peer_id: &str,
        chat_id: &str,
        username: &str,
    ) -> StorageResult<()> {
        self.inner.peer_set_username(peer_id, chat_id, username)
    }

    fn chat_peer_addresses(&self, chat_id: &str) -> StorageResult<Vec<String>> {
        self.inner.chat_peer_addresses(chat_id)
    }

    fn inviters(&self, chat_id: &str) -> StorageResult<Vec<User>> {
        self.inner.inviters(chat_id)
    }
}

pub struct Node {
    pub storage: Arc<RecordingStorage>,
    pub local: Arc<LocalPeer>,
    pub router: Arc<MessageRouter>,
    pub outbox: Arc<Outbox>,
    pub events: mpsc::Receiver<ChatEvent>,
}

pub async fn node(peer_id: &str) -> Node {
    let storage = Arc::new(RecordingStorage::new());
    let local = Arc::new(LocalPeer::new(peer_id));
    local.set_address(address_of(peer_id));
    let (tx, events) = mpsc::channel(64);
    let router = Arc::new(MessageRouter::standard(
        storage.clone(),
        local.clone(),
        EventSink::new(tx),
        std::env::temp_dir(),
    ));
    let outbox = Arc::new(Outbox::default());
    router.add_connection(outbox.clone()).await.unwrap();

    Node {
        storage,
        local,
        router,
        outbox,
        events,
    }
}

pub fn address_of(peer_id: &str) -> String {
    format!("ws://{peer_id}.onion:2222")
}

pub fn message(sender: &str, operation: Operation, chat_id: &str, content: String) -> Message {
    Message::new(operation, chat_id, content).from_peer(sender, address_of(sender))
}

pub fn text(sender: &str, chat_id: &str, body: &str) -> Message {
    let content = serde_json::to_string(&TextContent {
        message: body.to_string(),
    })
    .unwrap();
    message(sender, Operation::SendMessage, chat_id, content)
}

pub fn invite(sender: &str, chat_id: &str, invitee: &str) -> Message {
    let content = serde_json::to_string(&InviteContent {
        chat_id: chat_id.to_string(),
        chat_name: "Cool Chat".to_string(),
        peers: vec![PeerAddressKey {
            address: address_of(invitee),
            public_key: invitee.to_string(),
        }],
    })
    .unwrap();
    message(sender, Operation::InviteToChat, chat_id, content)
}
