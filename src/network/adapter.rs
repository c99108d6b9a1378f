use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;

use super::pool::{ConnectionPool, InboundFrame, SessionFailure};
use super::{NetworkConnection, NetworkObserver};
use crate::common::{Message, Operation};
use crate::error::{Error, Result};

const CHANNEL_CAPACITY: usize = 256;

/// Bridges the connection pool and the single subscribed observer.
///
/// Inbound frames are decoded into [`Message`]s; session failures are
/// reported as `USER_OFFLINE` through the same `notify` path.
pub struct TransportAdapter {
    pool: Arc<ConnectionPool>,
    observer: Mutex<Option<Arc<dyn NetworkObserver>>>,
    failure_tx: Mutex<Option<mpsc::Sender<SessionFailure>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    // Connect, select and send run as one step.
    publish_lock: AsyncMutex<()>,
    announced: AtomicBool,
}

impl TransportAdapter {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self {
            pool,
            observer: Mutex::new(None),
            failure_tx: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            publish_lock: AsyncMutex::new(()),
            announced: AtomicBool::new(false),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    async fn start(&self, observer: Arc<dyn NetworkObserver>) -> Result<()> {
        {
            let mut slot = self.observer.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                return Err(Error::AlreadyConnected(
                    "an observer is already subscribed".to_string(),
                ));
            }
            *slot = Some(observer.clone());
        }

        self.pool.reopen();
        let (frame_tx, frame_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (failure_tx, failure_rx) = mpsc::channel(CHANNEL_CAPACITY);
        *self.failure_tx.lock().unwrap_or_else(PoisonError::into_inner) = Some(failure_tx.clone());

        let handles = vec![
            self.pool.read_all(frame_tx, failure_tx.clone()),
            self.pool.heartbeat(failure_tx),
            tokio::spawn(dispatch(observer.clone(), frame_rx, failure_rx)),
        ];
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(handles);

        if !self.announced.swap(true, Ordering::SeqCst) {
            let address = self.pool.local_address();
            log::info!("Network online at {address}");
            let online = Message::new(Operation::NetworkOnline, "", serde_json::to_string(address)?)
                .from_peer("", address);
            if let Err(err) = observer.notify(online).await {
                log::warn!("Observer rejected network-online event: {err}");
            }
        }
        Ok(())
    }

    async fn stop(&self, observer: &Arc<dyn NetworkObserver>) -> Result<()> {
        {
            let mut slot = self.observer.lock().unwrap_or_else(PoisonError::into_inner);
            let is_current = slot
                .as_ref()
                .is_some_and(|current| same_observer(current, observer));
            if !is_current {
                return Err(Error::NotConnected(
                    "observer is not subscribed".to_string(),
                ));
            }
            *slot = None;
        }

        self.failure_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let handles: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            handle.abort();
        }

        self.pool.shutdown().await;
        Ok(())
    }

    async fn publish(&self, message: &Message) -> Result<()> {
        let _publishing = self.publish_lock.lock().await;
        let address = message.receiver_address.as_str();

        if !self.pool.contains(address).await {
            match self.pool.connect(address).await {
                Ok(()) | Err(Error::AlreadyConnected(_)) => {}
                Err(err @ Error::InvalidAddress(_)) => return Err(err),
                Err(err) => {
                    self.report_unreachable(address, &err);
                    return Err(err);
                }
            }
        }

        self.pool.set_write_target(address).await?;
        let frame = message.to_wire()?;
        self.pool.send(&frame).await
    }

    /// Queues a USER_OFFLINE for `address` without waiting: the dispatch
    /// task that drains the queue may be the caller.
    fn report_unreachable(&self, address: &str, err: &Error) {
        let failure_tx = self
            .failure_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(failure_tx) = failure_tx else {
            log::warn!("Peer {address} unreachable: {err}");
            return;
        };

        let failure = SessionFailure {
            address: address.to_string(),
            error: Error::ConnectionClosed(format!("connect to {address} failed: {err}")),
            evicted: false,
        };
        match failure_tx.try_send(failure) {
            Ok(()) => {}
            Err(TrySendError::Full(failure)) => {
                log::warn!(
                    "Failure queue full; dropping offline report for {}",
                    failure.address
                );
            }
            Err(TrySendError::Closed(_)) => {
                log::warn!("Peer {address} unreachable and no dispatcher is running");
            }
        }
    }
}

impl NetworkConnection for TransportAdapter {
    fn subscribe(&self, observer: Arc<dyn NetworkObserver>) -> BoxFuture<'_, Result<()>> {
        self.start(observer).boxed()
    }

    fn unsubscribe<'a>(&'a self, observer: &'a Arc<dyn NetworkObserver>) -> BoxFuture<'a, Result<()>> {
        self.stop(observer).boxed()
    }

    fn send_to_peer<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Result<()>> {
        self.publish(message).boxed()
    }
}

fn same_observer(a: &Arc<dyn NetworkObserver>, b: &Arc<dyn NetworkObserver>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

async fn dispatch(
    observer: Arc<dyn NetworkObserver>,
    mut frames: mpsc::Receiver<InboundFrame>,
    mut failures: mpsc::Receiver<SessionFailure>,
) {
    loop {
        tokio::select! {
            Some(frame) = frames.recv() => deliver_frame(observer.as_ref(), frame).await,
            Some(failure) = failures.recv() => deliver_failure(observer.as_ref(), failure).await,
            else => break,
        }
    }
    log::debug!("Dispatch loop stopped");
}

async fn deliver_frame(observer: &dyn NetworkObserver, frame: InboundFrame) {
    let message = match Message::from_wire(&frame.payload) {
        Ok(message) => message,
        Err(err) => {
            log::warn!("Dropping frame from {}: {err}", frame.address);
            return;
        }
    };

    let id = message.id.clone();
    if let Err(err) = observer.notify(message).await {
        log::warn!("Message {id} from {} not accepted: {err}", frame.address);
    }
}

/// Every failure reaches the observer as USER_OFFLINE; a transient one
/// leaves the session in the pool.
async fn deliver_failure(observer: &dyn NetworkObserver, failure: SessionFailure) {
    if failure.evicted || failure.error.is_connection_closed() {
        log::info!("Peer {} went offline: {}", failure.address, failure.error);
    } else {
        log::warn!(
            "Transient error on {} (session kept): {}",
            failure.address,
            failure.error
        );
    }

    let content = match serde_json::to_string(&failure.address) {
        Ok(content) => content,
        Err(err) => {
            log::error!("Failed to encode offline event: {err}");
            return;
        }
    };
    let offline = Message::new(Operation::UserOffline, "", content).from_peer("", &failure.address);
    if let Err(err) = observer.notify(offline).await {
        log::warn!("Observer rejected offline event for {}: {err}", failure.address);
    }
}
