use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::common::{
    ChatEvent, EventSink, FileContent, InviteContent, LocalPeer, Message, NetworkCommand,
    Operation, PeerAddressKey, TextContent, UsernameContent,
};
use crate::config;
use crate::error::{Error, Result};
use crate::network::ConnectionPool;
use crate::router::MessageRouter;
use crate::storage::Storage;
use crate::sync::SyncProtocol;

/// Turns chat-layer commands into outbound messages.
///
/// Every outbound chat message is stored locally first, then sent to each
/// known address of the chat.
pub struct ChatClient {
    router: Arc<MessageRouter>,
    pool: Arc<ConnectionPool>,
    local: Arc<LocalPeer>,
    sync: SyncProtocol,
    events: EventSink,
    command_receiver: mpsc::Receiver<NetworkCommand>,
    // Config file that successful connects are recorded in.
    config_path: Option<String>,
}

impl ChatClient {
    pub fn new(
        router: Arc<MessageRouter>,
        pool: Arc<ConnectionPool>,
        local: Arc<LocalPeer>,
        events: EventSink,
        command_receiver: mpsc::Receiver<NetworkCommand>,
    ) -> Self {
        let sync = SyncProtocol::new(router.storage().clone(), local.clone());
        Self {
            router,
            pool,
            local,
            sync,
            events,
            command_receiver,
            config_path: None,
        }
    }

    /// Records every peer reached through `ConnectToPeer` in the config
    /// file at `path`, so it is dialed again on the next start.
    pub fn persist_peers_to(mut self, path: impl Into<String>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub async fn run(mut self) {
        log::info!("Command loop started for peer {}", self.local.peer_id());
        while let Some(command) = self.command_receiver.recv().await {
            if let Err(err) = self.handle_command(command).await {
                log::warn!("Command failed: {err}");
            }
        }
        log::info!("Command loop stopped");
    }

    fn storage(&self) -> &Arc<dyn Storage> {
        self.router.storage()
    }

    pub async fn handle_command(&mut self, command: NetworkCommand) -> Result<()> {
        match command {
            NetworkCommand::CreateChat { chat_id, chat_name } => {
                let chat_id = chat_id.unwrap_or_else(|| Uuid::new_v4().to_string());
                self.storage().chat_created(&chat_name, &chat_id)?;
                self.storage()
                    .peer_joined_chat(self.local.peer_id(), &chat_id, now())?;
                log::info!("Created chat {chat_name} ({chat_id})");
                Ok(())
            }
            NetworkCommand::JoinChat { chat_id } => {
                let inviters = self.storage().inviters(&chat_id)?;
                if inviters.is_empty() {
                    return Err(Error::Inadmissible(format!(
                        "no invitation received for chat {chat_id}"
                    )));
                }

                let joined_at = now();
                for inviter in &inviters {
                    self.storage()
                        .peer_joined_chat(&inviter.user_id, &chat_id, joined_at)?;
                }
                self.storage()
                    .peer_joined_chat(self.local.peer_id(), &chat_id, joined_at)?;

                let message = self.outbound(Operation::JoinChat, &chat_id, String::new());
                self.publish(message, Vec::new()).await
            }
            NetworkCommand::LeaveChat { chat_id } => {
                let message = self.outbound(Operation::LeaveChat, &chat_id, String::new());
                self.publish(message, Vec::new()).await?;
                self.storage()
                    .peer_left_chat(self.local.peer_id(), &chat_id)?;
                Ok(())
            }
            NetworkCommand::InviteToChat { chat_id, invitee } => {
                self.invite(&chat_id, invitee).await
            }
            NetworkCommand::SendMessage { chat_id, text } => {
                let content = serde_json::to_string(&TextContent {
                    message: text.clone(),
                })?;
                let message = self.outbound(Operation::SendMessage, &chat_id, content);
                self.publish(message, Vec::new()).await?;
                self.events.emit(ChatEvent::MessageReceived {
                    sender_id: self.local.peer_id().to_string(),
                    chat_id,
                    text,
                });
                Ok(())
            }
            NetworkCommand::SetUsername { chat_id, username } => {
                let content = serde_json::to_string(&UsernameContent {
                    username: username.clone(),
                })?;
                self.storage()
                    .peer_set_username(self.local.peer_id(), &chat_id, &username)?;
                let message = self.outbound(Operation::SetUsername, &chat_id, content);
                self.publish(message, Vec::new()).await
            }
            NetworkCommand::SendFile { chat_id, path } => {
                let content = file_content(&path).await?;
                let message =
                    self.outbound(Operation::SendFile, &chat_id, serde_json::to_string(&content)?);
                self.publish(message, Vec::new()).await
            }
            NetworkCommand::SyncChat {
                chat_id,
                peer_address,
            } => {
                let request = self.sync.request(&chat_id, &peer_address)?;
                self.router.send(&request).await
            }
            NetworkCommand::ConnectToPeer { address } => {
                match self.pool.connect(&address).await {
                    Ok(()) => {}
                    Err(Error::AlreadyConnected(_)) => return Ok(()),
                    Err(err) => return Err(err),
                }
                if let Some(path) = &self.config_path {
                    config::persist_known_peer(path, &address)?;
                }
                Ok(())
            }
        }
    }

    /// The invitation goes to the invitee and to every current member, so
    /// that each of them admits the invitee's later JOIN_CHAT.
    async fn invite(&self, chat_id: &str, invitee: PeerAddressKey) -> Result<()> {
        let chat_name = self
            .storage()
            .chat(chat_id)?
            .map(|chat| chat.name)
            .unwrap_or_else(|| chat_id.to_string());
        let peers = vec![invitee.clone()];
        let content = serde_json::to_string(&InviteContent {
            chat_id: chat_id.to_string(),
            chat_name,
            peers: peers.clone(),
        })?;

        let message = self.outbound(Operation::InviteToChat, chat_id, content);
        self.storage().invited_to_chat(&message.id, &peers)?;
        self.storage()
            .peer_got_invited_to_chat(&invitee.public_key, chat_id)?;
        self.publish(message, vec![invitee.address]).await
    }

    fn outbound(&self, operation: Operation, chat_id: &str, content: String) -> Message {
        Message::new(operation, chat_id, content).from_peer(
            self.local.peer_id(),
            self.local.address().unwrap_or_default(),
        )
    }

    /// Stores `message` locally, then sends one copy per recipient address.
    /// Per-recipient failures are logged, not returned.
    async fn publish(&self, message: Message, extra_addresses: Vec<String>) -> Result<()> {
        self.storage().store_message(&message)?;

        let own_address = self.local.address().unwrap_or_default();
        let recipients: BTreeSet<String> = self
            .storage()
            .chat_peer_addresses(&message.chat_id)?
            .into_iter()
            .chain(extra_addresses)
            .filter(|address| !address.is_empty() && *address != own_address)
            .collect();

        if recipients.is_empty() {
            log::info!(
                "No peers to deliver {:?} for chat {}",
                message.operation,
                message.chat_id
            );
        }

        for address in recipients {
            let copy = message.clone().to_peer("", address.clone());
            if let Err(err) = self.router.send(&copy).await {
                log::warn!("Failed to deliver {:?} to {address}: {err}", copy.operation);
            }
        }
        Ok(())
    }
}

fn now() -> i64 {
    Utc::now().timestamp_millis()
}

async fn file_content(path: &Path) -> Result<FileContent> {
    let data = tokio::fs::read(path).await?;
    let file_name = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("file")
        .to_string();
    let file_extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_string();

    Ok(FileContent {
        file_name,
        file_extension,
        file_content: BASE64.encode(data),
    })
}
