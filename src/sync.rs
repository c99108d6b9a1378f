//! History reconciliation between two peers.
//!
//! A peer sends the ids it holds for a chat; the responder ships back the
//! messages the requester lacks and, if it is itself missing something, asks
//! for those ids in a follow-up request.

use std::collections::HashSet;
use std::sync::Arc;

use crate::common::{LocalPeer, Message, Operation, SyncRequestContent};
use crate::error::Result;
use crate::storage::Storage;

/// Per-chat view over the message store.
pub struct ChatMessageStore<'a> {
    storage: &'a dyn Storage,
    chat_id: &'a str,
}

impl<'a> ChatMessageStore<'a> {
    pub fn new(storage: &'a dyn Storage, chat_id: &'a str) -> Self {
        Self { storage, chat_id }
    }

    /// Top-level insertion: a duplicate id is an error.
    pub fn insert(&self, message: &Message) -> Result<()> {
        Ok(self.storage.store_message(message)?)
    }

    /// Batch merge: a duplicate id is absorbed. Returns whether the message
    /// was new.
    pub fn merge(&self, message: &Message) -> Result<bool> {
        Ok(self.storage.merge_message(message)?)
    }

    /// Chat history, without sync envelopes.
    pub fn history(&self) -> Result<Vec<Message>> {
        let mut messages = self.storage.chat_messages(self.chat_id)?;
        messages.retain(|message| message.operation.is_history());
        Ok(messages)
    }

    pub fn message_ids(&self) -> Result<Vec<String>> {
        Ok(self
            .history()?
            .into_iter()
            .map(|message| message.id)
            .collect())
    }

    /// Local messages whose id is not in `known`.
    pub fn missing_external(&self, known: &[String]) -> Result<Vec<Message>> {
        let known: HashSet<&str> = known.iter().map(String::as_str).collect();
        Ok(self
            .history()?
            .into_iter()
            .filter(|message| !known.contains(message.id.as_str()))
            .collect())
    }

    /// Ids in `claimed` that are not stored locally.
    pub fn missing_internal(&self, claimed: &[String]) -> Result<Vec<String>> {
        let local: HashSet<String> = self
            .storage
            .chat_messages(self.chat_id)?
            .into_iter()
            .map(|message| message.id)
            .collect();

        let mut seen = HashSet::new();
        Ok(claimed
            .iter()
            .filter(|id| !local.contains(id.as_str()) && seen.insert(id.as_str()))
            .cloned()
            .collect())
    }
}

/// Where replies to a sync request are sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTarget {
    pub peer_id: String,
    pub address: String,
}

pub trait SyncTargeting: Send + Sync {
    fn reply_target(&self, request: &Message) -> SyncTarget;
}

/// Replies go back to whoever sent the request.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplyToSender;

impl SyncTargeting for ReplyToSender {
    fn reply_target(&self, request: &Message) -> SyncTarget {
        SyncTarget {
            peer_id: request.sender_id.clone(),
            address: request.sender_address.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncDiff {
    pub missing_external: Vec<Message>,
    pub missing_internal: Vec<String>,
}

pub struct SyncProtocol {
    storage: Arc<dyn Storage>,
    local: Arc<LocalPeer>,
    targeting: Arc<dyn SyncTargeting>,
}

impl SyncProtocol {
    pub fn new(storage: Arc<dyn Storage>, local: Arc<LocalPeer>) -> Self {
        Self::with_targeting(storage, local, Arc::new(ReplyToSender))
    }

    pub fn with_targeting(
        storage: Arc<dyn Storage>,
        local: Arc<LocalPeer>,
        targeting: Arc<dyn SyncTargeting>,
    ) -> Self {
        Self {
            storage,
            local,
            targeting,
        }
    }

    fn store<'a>(&'a self, chat_id: &'a str) -> ChatMessageStore<'a> {
        ChatMessageStore::new(self.storage.as_ref(), chat_id)
    }

    pub fn diff(&self, chat_id: &str, request: &SyncRequestContent) -> Result<SyncDiff> {
        let store = self.store(chat_id);
        let mut missing_external = store.missing_external(&request.existing_message_ids)?;
        if !request.requested_message_ids.is_empty() {
            let requested: HashSet<&str> = request
                .requested_message_ids
                .iter()
                .map(String::as_str)
                .collect();
            missing_external.retain(|message| requested.contains(message.id.as_str()));
        }

        Ok(SyncDiff {
            missing_external,
            missing_internal: store.missing_internal(&request.existing_message_ids)?,
        })
    }

    /// Initial request for `chat_id`, addressed to `peer_address`.
    pub fn request(&self, chat_id: &str, peer_address: &str) -> Result<Message> {
        let content = SyncRequestContent {
            existing_message_ids: self.store(chat_id).message_ids()?,
            requested_message_ids: Vec::new(),
        };
        Ok(self
            .outbound(Operation::SyncRequest, chat_id, serde_json::to_string(&content)?)
            .to_peer("", peer_address))
    }

    /// Answers a SYNC_REQUEST with a SYNC_RESPONSE and, when this peer lacks
    /// some of the requester's ids, a follow-up SYNC_REQUEST.
    ///
    /// Admission on the receiving side only accepts batches whose messages
    /// are all authored by the envelope's sender, so messages by third
    /// parties are left out of the response.
    pub fn respond(&self, request: &Message) -> Result<Vec<Message>> {
        let content: SyncRequestContent = request.decode_content()?;
        let diff = self.diff(&request.chat_id, &content)?;
        let target = self.targeting.reply_target(request);

        let (own, foreign): (Vec<_>, Vec<_>) = diff
            .missing_external
            .into_iter()
            .partition(|message| message.sender_id == self.local.peer_id());
        if !foreign.is_empty() {
            log::debug!(
                "Withholding {} third-party messages of chat {} from {}",
                foreign.len(),
                request.chat_id,
                target.address
            );
        }

        let mut replies = vec![
            self.outbound(
                Operation::SyncResponse,
                &request.chat_id,
                serde_json::to_string(&own)?,
            )
            .to_peer(target.peer_id.clone(), target.address.clone()),
        ];

        if content.requested_message_ids.is_empty() && !diff.missing_internal.is_empty() {
            let follow_up = SyncRequestContent {
                existing_message_ids: self.store(&request.chat_id).message_ids()?,
                requested_message_ids: diff.missing_internal,
            };
            replies.push(
                self.outbound(
                    Operation::SyncRequest,
                    &request.chat_id,
                    serde_json::to_string(&follow_up)?,
                )
                .to_peer(target.peer_id, target.address),
            );
        }

        Ok(replies)
    }

    /// Merges a SYNC_RESPONSE batch. Returns how many messages were new.
    pub fn merge_response(&self, response: &Message) -> Result<usize> {
        let batch: Vec<Message> = response.decode_content()?;
        let store = self.store(&response.chat_id);

        let mut merged = 0;
        for message in &batch {
            if message.chat_id != response.chat_id || !message.operation.is_history() {
                log::warn!(
                    "Skipping message {} in sync batch for chat {}",
                    message.id,
                    response.chat_id
                );
                continue;
            }
            if store.merge(message)? {
                merged += 1;
            }
        }
        Ok(merged)
    }

    fn outbound(&self, operation: Operation, chat_id: &str, content: String) -> Message {
        Message::new(operation, chat_id, content).from_peer(
            self.local.peer_id(),
            self.local.address().unwrap_or_default(),
        )
    }
}
