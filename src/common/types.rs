use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Tag carried by every frame. The integer value is the wire representation,
/// so variants must never be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum Operation {
    SendMessage = 0,
    SyncRequest = 1,
    SyncResponse = 2,
    CreateChat = 3,
    JoinChat = 4,
    LeaveChat = 5,
    InviteToChat = 6,
    SendFile = 7,
    SetUsername = 8,
    TestMessage = 9,
    TestMessage2 = 10,
    /// Synthesized by the transport adapter when a session fails.
    UserOffline = 11,
    /// Synthesized by the transport adapter on bring-up.
    NetworkOnline = 12,
}

impl Operation {
    pub const ALL: [Operation; 13] = [
        Operation::SendMessage,
        Operation::SyncRequest,
        Operation::SyncResponse,
        Operation::CreateChat,
        Operation::JoinChat,
        Operation::LeaveChat,
        Operation::InviteToChat,
        Operation::SendFile,
        Operation::SetUsername,
        Operation::TestMessage,
        Operation::TestMessage2,
        Operation::UserOffline,
        Operation::NetworkOnline,
    ];

    /// Events that only the local transport may produce.
    pub fn is_local_event(self) -> bool {
        matches!(self, Operation::UserOffline | Operation::NetworkOnline)
    }

    /// Whether a message with this tag belongs to a chat's history and
    /// therefore takes part in sync set differences.
    pub fn is_history(self) -> bool {
        !matches!(self, Operation::SyncRequest | Operation::SyncResponse) && !self.is_local_event()
    }
}

impl From<Operation> for u8 {
    fn from(operation: Operation) -> Self {
        operation as u8
    }
}

impl TryFrom<u8> for Operation {
    type Error = String;

    fn try_from(tag: u8) -> std::result::Result<Self, Self::Error> {
        Operation::ALL
            .get(usize::from(tag))
            .copied()
            .ok_or_else(|| format!("unknown operation tag {tag}"))
    }
}

/// Domain model đại diện một message trên mạng.
///
/// Field names on the wire follow the frame layout shared with other peers,
/// hence the explicit renames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Message {
    pub id: String,
    pub timestamp: i64,
    pub content: String,
    #[serde(rename = "SenderID")]
    pub sender_id: String,
    #[serde(rename = "ReceiverID")]
    pub receiver_id: String,
    pub sender_address: String,
    pub receiver_address: String,
    #[serde(rename = "ChatID")]
    pub chat_id: String,
    pub operation: Operation,
}

impl Message {
    pub fn new(operation: Operation, chat_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now().timestamp_millis(),
            content: content.into(),
            sender_id: String::new(),
            receiver_id: String::new(),
            sender_address: String::new(),
            receiver_address: String::new(),
            chat_id: chat_id.into(),
            operation,
        }
    }

    pub fn from_peer(mut self, peer_id: impl Into<String>, address: impl Into<String>) -> Self {
        self.sender_id = peer_id.into();
        self.sender_address = address.into();
        self
    }

    pub fn to_peer(mut self, peer_id: impl Into<String>, address: impl Into<String>) -> Self {
        self.receiver_id = peer_id.into();
        self.receiver_address = address.into();
        self
    }

    pub fn to_wire(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes an inbound frame. Local event tags are refused so a remote
    /// peer cannot impersonate the transport.
    pub fn from_wire(frame: &str) -> Result<Self> {
        let message: Message = serde_json::from_str(frame)?;
        if message.operation.is_local_event() {
            return Err(Error::Decode(format!(
                "operation {:?} cannot arrive from the network",
                message.operation
            )));
        }
        Ok(message)
    }

    pub fn decode_content<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.content).map_err(|err| {
            Error::Decode(format!(
                "invalid {:?} content in message {}: {err}",
                self.operation, self.id
            ))
        })
    }
}

/// A peer listed in an invitation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerAddressKey {
    pub address: String,
    pub public_key: String,
}

/// Identity of this process on the network.
#[derive(Debug)]
pub struct LocalPeer {
    peer_id: String,
    address: Mutex<Option<String>>,
}

impl LocalPeer {
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            address: Mutex::new(None),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Externally reachable address, known once the network is online.
    pub fn address(&self) -> Option<String> {
        self.address
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_address(&self, address: impl Into<String>) {
        *self.address.lock().unwrap_or_else(PoisonError::into_inner) = Some(address.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_tags_follow_wire_order() {
        for (index, operation) in Operation::ALL.iter().enumerate() {
            assert_eq!(u8::from(*operation) as usize, index);
            assert_eq!(Operation::try_from(index as u8), Ok(*operation));
        }
        assert!(Operation::try_from(13).is_err());
    }

    #[test]
    fn frame_uses_expected_field_names() {
        let message = Message::new(Operation::JoinChat, "chat1", "")
            .from_peer("user1", "ws://user1.onion:2222")
            .to_peer("user2", "ws://user2.onion:2222");
        let value: serde_json::Value = serde_json::from_str(&message.to_wire().unwrap()).unwrap();

        for key in [
            "Id",
            "Timestamp",
            "Content",
            "SenderID",
            "ReceiverID",
            "SenderAddress",
            "ReceiverAddress",
            "ChatID",
            "Operation",
        ] {
            assert!(value.get(key).is_some(), "missing field {key}");
        }
        assert_eq!(value["Operation"], 4);
        assert_eq!(value["ChatID"], "chat1");
    }

    #[test]
    fn wire_decoding_refuses_local_events() {
        let mut message = Message::new(Operation::NetworkOnline, "", "\"ws://x.onion:1\"");
        let frame = message.to_wire().unwrap();
        assert!(matches!(Message::from_wire(&frame), Err(Error::Decode(_))));

        message.operation = Operation::SendMessage;
        let frame = message.to_wire().unwrap();
        assert_eq!(Message::from_wire(&frame).unwrap(), message);
    }

    #[test]
    fn malformed_frames_are_decode_errors() {
        assert!(matches!(Message::from_wire("not json"), Err(Error::Decode(_))));
        assert!(matches!(
            Message::from_wire(r#"{"Id":"1","Operation":99}"#),
            Err(Error::Decode(_))
        ));
    }

    #[test]
    fn sync_envelopes_are_not_history() {
        assert!(Operation::SendMessage.is_history());
        assert!(Operation::JoinChat.is_history());
        assert!(!Operation::SyncRequest.is_history());
        assert!(!Operation::SyncResponse.is_history());
        assert!(!Operation::UserOffline.is_history());
    }
}
