pub mod adapter;
pub mod pool;
pub mod session;
pub mod transport;

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::common::Message;
use crate::error::Result;

pub use adapter::TransportAdapter;
pub use pool::{ConnectionPool, InboundFrame, PoolConfig, SessionFailure};
pub use session::{BoxedIo, PEER_ADDRESS_HEADER, Session, SessionIo};
pub use transport::{Dialer, TcpDialer, spawn_listener};

/// Receives every decoded inbound message and every synthesized local event.
pub trait NetworkObserver: Send + Sync {
    fn notify(&self, message: Message) -> BoxFuture<'_, Result<()>>;
}

/// The process's single outbound transport.
pub trait NetworkConnection: Send + Sync {
    /// Registers the one observer. A second subscription fails with
    /// `AlreadyConnected`.
    fn subscribe(&self, observer: Arc<dyn NetworkObserver>) -> BoxFuture<'_, Result<()>>;

    fn unsubscribe<'a>(&'a self, observer: &'a Arc<dyn NetworkObserver>) -> BoxFuture<'a, Result<()>>;

    /// Delivers `message` to its `receiver_address`, connecting first if
    /// needed.
    fn send_to_peer<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Result<()>>;
}
