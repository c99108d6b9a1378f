//! Content payloads, one schema per operation tag.

use serde::{Deserialize, Serialize};

use super::types::PeerAddressKey;

/// SEND_MESSAGE
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextContent {
    pub message: String,
}

/// INVITE_TO_CHAT
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteContent {
    pub chat_id: String,
    pub chat_name: String,
    pub peers: Vec<PeerAddressKey>,
}

/// SET_USERNAME
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsernameContent {
    pub username: String,
}

/// SEND_FILE. `file_content` is base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileContent {
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub file_extension: String,
    pub file_content: String,
}

/// SYNC_REQUEST
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequestContent {
    pub existing_message_ids: Vec<String>,
    /// Set on follow-up requests: only these ids are wanted back.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requested_message_ids: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invite_content_uses_camel_case() {
        let json = r#"{"chatId":"chat1","chatName":"Cool Chat","peers":[{"address":"ws://b.onion:2222","publicKey":"userB"}]}"#;
        let content: InviteContent = serde_json::from_str(json).unwrap();
        assert_eq!(content.chat_id, "chat1");
        assert_eq!(content.peers[0].public_key, "userB");
    }

    #[test]
    fn plain_sync_request_omits_requested_ids() {
        let content = SyncRequestContent {
            existing_message_ids: vec!["m1".into()],
            requested_message_ids: Vec::new(),
        };
        assert_eq!(
            serde_json::to_string(&content).unwrap(),
            r#"{"existingMessageIds":["m1"]}"#
        );
    }
}
