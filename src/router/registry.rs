use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::common::{EventSink, LocalPeer, Message, Operation};
use crate::error::Result;
use crate::storage::Storage;
use crate::sync::SyncProtocol;

use super::handlers::{
    InviteToChatHandler, JoinChatHandler, LeaveChatHandler, NetworkOnlineHandler,
    SendFileHandler, SendMessageHandler, SetUsernameHandler, SyncRequestHandler,
    SyncResponseHandler, UserOfflineHandler,
};

/// Handles one operation tag. Returns the messages to send in reply.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: &Message) -> Result<Vec<Message>>;
}

/// Collaborators shared by the standard handlers.
#[derive(Clone)]
pub struct HandlerContext {
    pub storage: Arc<dyn Storage>,
    pub local: Arc<LocalPeer>,
    pub events: EventSink,
    pub file_dir: PathBuf,
    pub sync: Arc<SyncProtocol>,
}

/// Operation tag to handler table. Built once, read-only afterwards.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<Operation, Box<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every operation with chat semantics. CREATE_CHAT and the test tags
    /// are left unregistered.
    pub fn standard(ctx: &HandlerContext) -> Self {
        let mut registry = Self::new();
        registry
            .register(
                Operation::SendMessage,
                SendMessageHandler::new(ctx.events.clone()),
            )
            .register(
                Operation::JoinChat,
                JoinChatHandler::new(ctx.storage.clone(), ctx.events.clone()),
            )
            .register(
                Operation::LeaveChat,
                LeaveChatHandler::new(ctx.storage.clone(), ctx.events.clone()),
            )
            .register(
                Operation::InviteToChat,
                InviteToChatHandler::new(ctx.storage.clone(), ctx.events.clone()),
            )
            .register(
                Operation::SetUsername,
                SetUsernameHandler::new(ctx.storage.clone(), ctx.events.clone()),
            )
            .register(
                Operation::SendFile,
                SendFileHandler::new(ctx.file_dir.clone(), ctx.events.clone()),
            )
            .register(
                Operation::SyncRequest,
                SyncRequestHandler::new(ctx.sync.clone()),
            )
            .register(
                Operation::SyncResponse,
                SyncResponseHandler::new(ctx.sync.clone(), ctx.events.clone()),
            )
            .register(
                Operation::UserOffline,
                UserOfflineHandler::new(ctx.events.clone()),
            )
            .register(
                Operation::NetworkOnline,
                NetworkOnlineHandler::new(ctx.local.clone(), ctx.events.clone()),
            );
        registry
    }

    pub fn register(
        &mut self,
        operation: Operation,
        handler: impl MessageHandler + 'static,
    ) -> &mut Self {
        self.handlers.insert(operation, Box::new(handler));
        self
    }

    pub fn get(&self, operation: Operation) -> Option<&dyn MessageHandler> {
        self.handlers.get(&operation).map(|handler| &**handler)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
