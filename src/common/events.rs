use std::path::PathBuf;

use tokio::sync::mpsc;

/// Sự kiện từ tầng mạng gửi lên tầng chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    MessageReceived {
        sender_id: String,
        chat_id: String,
        text: String,
    },
    PeerJoined {
        peer_id: String,
        chat_id: String,
    },
    PeerLeft {
        peer_id: String,
        chat_id: String,
    },
    Invited {
        inviter_id: String,
        chat_id: String,
        chat_name: String,
        peer_addresses: Vec<String>,
    },
    UsernameChanged {
        peer_id: String,
        chat_id: String,
        username: String,
    },
    FileReceived {
        sender_id: String,
        chat_id: String,
        path: PathBuf,
    },
    HistorySynced {
        chat_id: String,
        merged: usize,
    },
    NetworkOnline(String),
    PeerOffline(String),
}

/// Non-blocking sender used from inside message handlers.
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: mpsc::Sender<ChatEvent>,
}

impl EventSink {
    pub fn new(sender: mpsc::Sender<ChatEvent>) -> Self {
        Self { sender }
    }

    pub fn emit(&self, event: ChatEvent) {
        if let Err(err) = self.sender.try_send(event) {
            log::warn!("Failed to notify chat layer: {err}");
        }
    }
}
