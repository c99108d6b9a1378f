use std::path::PathBuf;

use super::types::PeerAddressKey;

/// Lệnh tầng chat gửi xuống tầng mạng.
#[derive(Debug, Clone)]
pub enum NetworkCommand {
    /// Create a chat locally; this peer becomes its first member.
    CreateChat {
        chat_id: Option<String>,
        chat_name: String,
    },
    /// Accept a received invitation.
    JoinChat { chat_id: String },
    LeaveChat { chat_id: String },
    InviteToChat {
        chat_id: String,
        invitee: PeerAddressKey,
    },
    SendMessage { chat_id: String, text: String },
    SetUsername { chat_id: String, username: String },
    SendFile { chat_id: String, path: PathBuf },
    /// Ask a peer for the history this peer is missing.
    SyncChat {
        chat_id: String,
        peer_address: String,
    },
    /// Connect to a peer manually by address
    /// - address: ví dụ ws://xxxxxxxx.onion:2222
    ConnectToPeer { address: String },
}
