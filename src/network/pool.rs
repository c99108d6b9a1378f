//! Pooled peer sessions.
//!
//! The pool owns every live session, keyed by peer address. Structural
//! changes go through a read/write lock; sends go through the single write
//! target, one at a time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, interval_at};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

use super::session::Session;
use super::transport::Dialer;
use crate::error::{Error, Result};

/// Timings and limits of a [`ConnectionPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    /// Period of the read tick. Each read gets 90% of it as its deadline.
    pub read_interval: Duration,
    pub heartbeat_interval: Duration,
    pub max_frame_bytes: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 64,
            connect_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(20),
            read_interval: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(10),
            max_frame_bytes: 64 * 1024,
        }
    }
}

impl PoolConfig {
    pub fn read_timeout(&self) -> Duration {
        self.read_interval * 9 / 10
    }

    pub fn websocket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_frame_size = Some(self.max_frame_bytes);
        config.max_message_size = Some(self.max_frame_bytes);
        config
    }
}

/// A text frame read from a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    pub address: String,
    pub payload: String,
}

/// A read, write or probe failure on a session.
#[derive(Debug)]
pub struct SessionFailure {
    pub address: String,
    pub error: Error,
    /// Whether the pool dropped the session because of it.
    pub evicted: bool,
}

pub struct ConnectionPool {
    local_address: String,
    config: PoolConfig,
    dialer: Arc<dyn Dialer>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    // Held for the whole write. Lock order: write_target, then sessions.
    write_target: Mutex<Option<String>>,
    shutdown_tx: watch::Sender<bool>,
}

impl ConnectionPool {
    pub fn new(local_address: impl Into<String>, config: PoolConfig, dialer: Arc<dyn Dialer>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            local_address: local_address.into(),
            config,
            dialer,
            sessions: RwLock::new(HashMap::new()),
            write_target: Mutex::new(None),
            shutdown_tx,
        }
    }

    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn contains(&self, address: &str) -> bool {
        self.sessions.read().await.contains_key(address)
    }

    pub async fn addresses(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Opens an outbound session to `address`.
    pub async fn connect(&self, address: &str) -> Result<()> {
        if address.is_empty() || address == self.local_address {
            return Err(Error::InvalidAddress(address.to_string()));
        }
        if self.contains(address).await {
            return Err(Error::AlreadyConnected(address.to_string()));
        }

        let handshake = Session::connect(
            self.dialer.as_ref(),
            address,
            &self.local_address,
            self.config.websocket_config(),
        );
        let session = match tokio::time::timeout(self.config.connect_timeout, handshake).await {
            Ok(result) => Arc::new(result?),
            Err(_) => {
                return Err(Error::TransientIo(format!("connect to {address} timed out")));
            }
        };

        if let Err(err) = self.insert(address, session.clone()).await {
            session.close(self.config.write_timeout).await;
            return Err(err);
        }
        log::info!("Connected to {address}");
        Ok(())
    }

    /// Adds an inbound session that completed its handshake. On error the
    /// caller owns the session and must close it.
    pub async fn accept(&self, address: &str, session: Arc<Session>) -> Result<()> {
        self.insert(address, session).await?;
        log::info!("Accepted session from {address}");
        Ok(())
    }

    async fn insert(&self, address: &str, session: Arc<Session>) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(address) {
            return Err(Error::AlreadyConnected(address.to_string()));
        }
        if sessions.len() >= self.config.max_connections {
            return Err(Error::CapacityExceeded(self.config.max_connections));
        }
        sessions.insert(address.to_string(), session);
        Ok(())
    }

    /// Selects the session used by [`send`](Self::send).
    pub async fn set_write_target(&self, address: &str) -> Result<()> {
        let mut target = self.write_target.lock().await;
        let sessions = self.sessions.read().await;
        if sessions.is_empty() {
            return Err(Error::NotConnected("pool is empty".to_string()));
        }
        if !sessions.contains_key(address) {
            return Err(Error::NotConnected(address.to_string()));
        }
        *target = Some(address.to_string());
        Ok(())
    }

    /// Writes `payload` to the current write target. A close-type failure
    /// evicts the target session.
    pub async fn send(&self, payload: &str) -> Result<()> {
        let target = self.write_target.lock().await;
        let address = target
            .clone()
            .ok_or_else(|| Error::NotConnected("no write target selected".to_string()))?;

        let session = self
            .sessions
            .read()
            .await
            .get(&address)
            .cloned()
            .ok_or_else(|| Error::NotConnected(address.clone()))?;

        let result = session.send_text(payload, self.config.write_timeout).await;
        drop(target);

        if let Err(err) = &result {
            if err.is_connection_closed() {
                self.evict_session(&address, &session).await;
            }
        }
        result
    }

    /// Removes `session` if it is still the one registered under `address`.
    async fn evict_session(&self, address: &str, session: &Arc<Session>) -> bool {
        let removed = {
            let mut sessions = self.sessions.write().await;
            let is_current = sessions
                .get(address)
                .is_some_and(|current| Arc::ptr_eq(current, session));
            if is_current {
                sessions.remove(address)
            } else {
                None
            }
        };

        match removed {
            Some(session) => {
                log::info!("Evicted session {address}");
                session.close(self.config.write_timeout).await;
                true
            }
            None => false,
        }
    }

    /// Starts the read loop. Every tick tries one read per session; frames
    /// and failures go out on separate channels.
    pub fn read_all(
        self: &Arc<Self>,
        frames: mpsc::Sender<InboundFrame>,
        failures: mpsc::Sender<SessionFailure>,
    ) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            if *shutdown.borrow_and_update() {
                return;
            }
            let mut ticker = interval(pool.config.read_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => pool.read_tick(&frames, &failures).await,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            log::debug!("Read loop stopped");
        })
    }

    async fn read_tick(
        self: &Arc<Self>,
        frames: &mpsc::Sender<InboundFrame>,
        failures: &mpsc::Sender<SessionFailure>,
    ) {
        let snapshot: Vec<_> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(address, session)| (address.clone(), session.clone()))
            .collect();

        for (address, session) in snapshot {
            let pool = Arc::clone(self);
            let frames = frames.clone();
            let failures = failures.clone();

            tokio::spawn(async move {
                match session.try_read(pool.config.read_timeout()).await {
                    Ok(Some(payload)) => {
                        let _ = frames.send(InboundFrame { address, payload }).await;
                    }
                    Ok(None) => {}
                    Err(error) => {
                        let evicted = error.is_connection_closed()
                            && pool.evict_session(&address, &session).await;
                        let _ = failures
                            .send(SessionFailure {
                                address,
                                error,
                                evicted,
                            })
                            .await;
                    }
                }
            });
        }
    }

    /// Starts the heartbeat loop.
    pub fn heartbeat(self: &Arc<Self>, failures: mpsc::Sender<SessionFailure>) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            if *shutdown.borrow_and_update() {
                return;
            }
            let period = pool.config.heartbeat_interval;
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        pool.heartbeat_once(&failures).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            log::debug!("Heartbeat loop stopped");
        })
    }

    /// Probes every session once. Any probe failure evicts the session.
    /// Returns the number of evicted sessions.
    pub async fn heartbeat_once(&self, failures: &mpsc::Sender<SessionFailure>) -> usize {
        let snapshot: Vec<_> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(address, session)| (address.clone(), session.clone()))
            .collect();

        let deadline = self.config.write_timeout;
        let probes = snapshot.into_iter().map(|(address, session)| async move {
            let result = session.ping(deadline).await;
            (address, session, result)
        });

        let mut evicted_count = 0;
        for (address, session, result) in join_all(probes).await {
            let Err(error) = result else {
                continue;
            };
            log::warn!("Heartbeat to {address} failed: {error}");
            let evicted = self.evict_session(&address, &session).await;
            if evicted {
                evicted_count += 1;
            }
            let _ = failures
                .send(SessionFailure {
                    address,
                    error,
                    evicted,
                })
                .await;
        }
        evicted_count
    }

    /// Closes every session and stops the read and heartbeat loops.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);

        let drained: Vec<_> = {
            let mut target = self.write_target.lock().await;
            *target = None;
            self.sessions.write().await.drain().collect()
        };

        for (address, session) in drained {
            log::debug!("Closing session {address}");
            session.close(self.config.write_timeout).await;
        }
        log::info!("Connection pool shut down");
    }

    /// Allows the loops to run again after [`shutdown`](Self::shutdown).
    pub fn reopen(&self) {
        self.shutdown_tx.send_replace(false);
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}
