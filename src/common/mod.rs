pub mod commands;
pub mod content;
pub mod events;
pub mod types;

pub use commands::NetworkCommand;
pub use content::{FileContent, InviteContent, SyncRequestContent, TextContent, UsernameContent};
pub use events::{ChatEvent, EventSink};
pub use types::{LocalPeer, Message, Operation, PeerAddressKey};
