use std::sync::Arc;

use crate::common::{Message, Operation};
use crate::error::{Error, Result};
use crate::storage::Storage;

/// Admission control for inbound messages.
///
/// Reads membership and invitations from storage on every call and never
/// writes.
pub struct SecurityValidator {
    storage: Arc<dyn Storage>,
}

impl SecurityValidator {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub fn validate_incoming(&self, message: &Message) -> Result<()> {
        match message.operation {
            Operation::SendMessage
            | Operation::SyncRequest
            | Operation::LeaveChat
            | Operation::SendFile
            | Operation::SetUsername => self.require_member(message),
            Operation::JoinChat => self.require_invitation(message),
            // Inviter membership is not checked.
            Operation::InviteToChat => Ok(()),
            Operation::SyncResponse => require_single_author(message),
            other => Err(Error::Inadmissible(format!(
                "operation {other:?} is not accepted from peers"
            ))),
        }
    }

    pub fn validate_outgoing(&self, _message: &Message) -> Result<()> {
        Ok(())
    }

    fn require_member(&self, message: &Message) -> Result<()> {
        let is_member = self
            .storage
            .users_in_chat(&message.chat_id)?
            .iter()
            .any(|user| user.user_id == message.sender_id);

        if is_member {
            Ok(())
        } else {
            Err(Error::Inadmissible(format!(
                "{} is not a member of chat {}",
                message.sender_id, message.chat_id
            )))
        }
    }

    fn require_invitation(&self, message: &Message) -> Result<()> {
        let invited = self
            .storage
            .invitations(&message.sender_id)?
            .iter()
            .any(|chat_id| *chat_id == message.chat_id);

        if invited {
            Ok(())
        } else {
            Err(Error::Inadmissible(format!(
                "{} holds no invitation to chat {}",
                message.sender_id, message.chat_id
            )))
        }
    }
}

/// Every message relayed in a sync batch must be authored by the envelope's
/// sender.
fn require_single_author(message: &Message) -> Result<()> {
    let batch: Vec<Message> = message.decode_content()?;
    match batch
        .iter()
        .find(|embedded| embedded.sender_id != message.sender_id)
    {
        Some(forged) => Err(Error::Inadmissible(format!(
            "sync batch from {} carries message {} by {}",
            message.sender_id, forged.id, forged.sender_id
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;

    fn validator() -> (Arc<SqliteStorage>, SecurityValidator) {
        let storage = Arc::new(SqliteStorage::in_memory().unwrap());
        let validator = SecurityValidator::new(storage.clone());
        (storage, validator)
    }

    fn from(sender: &str, operation: Operation) -> Message {
        Message::new(operation, "chat1", "{}").from_peer(sender, format!("ws://{sender}.onion:2222"))
    }

    #[test]
    fn member_only_operations() {
        let (storage, validator) = validator();
        for operation in [
            Operation::SendMessage,
            Operation::SyncRequest,
            Operation::LeaveChat,
            Operation::SendFile,
            Operation::SetUsername,
        ] {
            assert!(
                matches!(
                    validator.validate_incoming(&from("userB", operation)),
                    Err(Error::Inadmissible(_))
                ),
                "{operation:?} admitted from a non-member"
            );
        }

        storage.peer_joined_chat("userB", "chat1", 1).unwrap();
        assert!(validator.validate_incoming(&from("userB", Operation::SendMessage)).is_ok());
        assert!(validator.validate_incoming(&from("userC", Operation::SendMessage)).is_err());
    }

    #[test]
    fn join_needs_an_invitation() {
        let (storage, validator) = validator();
        assert!(validator.validate_incoming(&from("userB", Operation::JoinChat)).is_err());

        storage.peer_got_invited_to_chat("userB", "chat2").unwrap();
        assert!(validator.validate_incoming(&from("userB", Operation::JoinChat)).is_err());

        storage.peer_got_invited_to_chat("userB", "chat1").unwrap();
        assert!(validator.validate_incoming(&from("userB", Operation::JoinChat)).is_ok());
    }

    #[test]
    fn invitations_are_always_admitted() {
        let (_, validator) = validator();
        assert!(validator.validate_incoming(&from("stranger", Operation::InviteToChat)).is_ok());
    }

    #[test]
    fn sync_response_must_not_relay_foreign_messages() {
        let (_, validator) = validator();
        let own = from("userA", Operation::SendMessage);
        let foreign = from("userC", Operation::SendMessage);

        let mut response = from("userA", Operation::SyncResponse);
        response.content = serde_json::to_string(&vec![own.clone()]).unwrap();
        assert!(validator.validate_incoming(&response).is_ok());

        response.content = serde_json::to_string(&vec![own, foreign]).unwrap();
        assert!(matches!(
            validator.validate_incoming(&response),
            Err(Error::Inadmissible(_))
        ));

        response.content = "not a batch".to_string();
        assert!(matches!(
            validator.validate_incoming(&response),
            Err(Error::Decode(_))
        ));
    }

    #[test]
    fn unknown_operations_are_rejected() {
        let (storage, validator) = validator();
        storage.peer_joined_chat("userB", "chat1", 1).unwrap();
        for operation in [
            Operation::CreateChat,
            Operation::TestMessage,
            Operation::TestMessage2,
            Operation::UserOffline,
            Operation::NetworkOnline,
        ] {
            assert!(matches!(
                validator.validate_incoming(&from("userB", operation)),
                Err(Error::Inadmissible(_))
            ));
        }
    }

    #[test]
    fn outgoing_is_permissive() {
        let (_, validator) = validator();
        assert!(validator.validate_outgoing(&from("me", Operation::TestMessage)).is_ok());
    }
}
