//! Inbound entry point: admission, persistence, then dispatch.

pub mod handlers;
pub mod registry;
pub mod security;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::common::{EventSink, LocalPeer, Message};
use crate::error::{Error, Result};
use crate::network::{NetworkConnection, NetworkObserver};
use crate::storage::Storage;
use crate::sync::SyncProtocol;

pub use registry::{HandlerContext, HandlerRegistry, MessageHandler};
pub use security::SecurityValidator;

pub struct MessageRouter {
    registry: HandlerRegistry,
    validator: SecurityValidator,
    storage: Arc<dyn Storage>,
    connection: Mutex<Option<Arc<dyn NetworkConnection>>>,
}

impl MessageRouter {
    pub fn new(registry: HandlerRegistry, storage: Arc<dyn Storage>) -> Self {
        Self {
            registry,
            validator: SecurityValidator::new(storage.clone()),
            storage,
            connection: Mutex::new(None),
        }
    }

    /// Router with the full handler table.
    pub fn standard(
        storage: Arc<dyn Storage>,
        local: Arc<LocalPeer>,
        events: EventSink,
        file_dir: PathBuf,
    ) -> Self {
        let sync = Arc::new(SyncProtocol::new(storage.clone(), local.clone()));
        let ctx = HandlerContext {
            storage: storage.clone(),
            local,
            events,
            file_dir,
            sync,
        };
        Self::new(HandlerRegistry::standard(&ctx), storage)
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Attaches the process's one transport and subscribes to it.
    pub async fn add_connection(self: &Arc<Self>, connection: Arc<dyn NetworkConnection>) -> Result<()> {
        {
            let mut slot = self.connection.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                return Err(Error::AlreadyConnected(
                    "router already has a network connection".to_string(),
                ));
            }
            *slot = Some(connection.clone());
        }

        let observer: Arc<dyn NetworkObserver> = self.clone();
        if let Err(err) = connection.subscribe(observer).await {
            self.connection
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            return Err(err);
        }
        Ok(())
    }

    pub async fn remove_connection(self: &Arc<Self>) -> Result<()> {
        let connection = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| Error::NotConnected("router has no network connection".to_string()))?;

        let observer: Arc<dyn NetworkObserver> = self.clone();
        connection.unsubscribe(&observer).await
    }

    /// Processes one inbound message.
    ///
    /// Rejected messages are neither stored nor dispatched. A handler error
    /// is returned after the message has already been stored.
    pub async fn route(&self, message: Message) -> Result<()> {
        let operation = message.operation;
        let handler = self
            .registry
            .get(operation)
            .ok_or(Error::UnsupportedOperation(operation))?;

        if !operation.is_local_event() {
            if let Err(err) = self.validator.validate_incoming(&message) {
                log::debug!(
                    "Rejected {operation:?} {} from {}: {err}",
                    message.id,
                    message.sender_id
                );
                return Err(err);
            }
            self.storage.store_message(&message)?;
        }

        let replies = handler.handle(&message)?;
        self.send_all(replies).await
    }

    /// Validates and hands `message` to the transport.
    pub async fn send(&self, message: &Message) -> Result<()> {
        self.validator.validate_outgoing(message)?;
        let connection = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| Error::NotConnected("router has no network connection".to_string()))?;
        connection.send_to_peer(message).await
    }

    async fn send_all(&self, messages: Vec<Message>) -> Result<()> {
        let mut first_error = None;
        for message in messages {
            if let Err(err) = self.send(&message).await {
                log::warn!(
                    "Failed to send {:?} to {}: {err}",
                    message.operation,
                    message.receiver_address
                );
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl NetworkObserver for MessageRouter {
    fn notify(&self, message: Message) -> BoxFuture<'_, Result<()>> {
        self.route(message).boxed()
    }
}
