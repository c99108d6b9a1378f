use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::client::ChatClient;
use crate::common::{ChatEvent, EventSink, LocalPeer, NetworkCommand};
use crate::config::AppConfig;
use crate::error::Result;
use crate::network::{ConnectionPool, PoolConfig, TcpDialer, TransportAdapter, spawn_listener};
use crate::router::MessageRouter;
use crate::storage::{SqliteStorage, ensure_parent_dir};

/// Everything one peer process runs on, built once at startup.
pub struct AppContext {
    pub config: AppConfig,
    pub storage: Arc<SqliteStorage>,
    pub local: Arc<LocalPeer>,
    pub pool: Arc<ConnectionPool>,
    pub adapter: Arc<TransportAdapter>,
    pub router: Arc<MessageRouter>,
    events: EventSink,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl AppContext {
    /// Opens storage, binds the listener and brings the network up.
    pub async fn start(config: AppConfig, events: mpsc::Sender<ChatEvent>) -> Result<Arc<Self>> {
        let storage = Arc::new(SqliteStorage::with_path(&config.database_path)?);
        let peer_id = load_or_generate_peer_id(&config.peer_id_path)?;
        log::info!("Local peer id: {peer_id}");
        let local = Arc::new(LocalPeer::new(peer_id));

        let listener = TcpListener::bind(("0.0.0.0", config.listen_port)).await?;
        let bound_port = listener.local_addr()?.port();
        let advertised = config.advertised_address(bound_port);

        let pool = Arc::new(ConnectionPool::new(
            advertised,
            PoolConfig::from(&config.pool),
            Arc::new(TcpDialer),
        ));
        let adapter = Arc::new(TransportAdapter::new(pool.clone()));
        let events = EventSink::new(events);
        let router = Arc::new(MessageRouter::standard(
            storage.clone(),
            local.clone(),
            events.clone(),
            config.file_dir.clone(),
        ));

        router.add_connection(adapter.clone()).await?;
        let listener = spawn_listener(listener, pool.clone());

        for address in &config.known_peers {
            if let Err(err) = pool.connect(address).await {
                log::warn!("Failed to connect to known peer {address}: {err}");
            }
        }

        Ok(Arc::new(Self {
            config,
            storage,
            local,
            pool,
            adapter,
            router,
            events,
            listener: Mutex::new(Some(listener)),
        }))
    }

    pub fn client(&self, commands: mpsc::Receiver<NetworkCommand>) -> ChatClient {
        ChatClient::new(
            self.router.clone(),
            self.pool.clone(),
            self.local.clone(),
            self.events.clone(),
            commands,
        )
    }

    /// Detaches the transport (which closes every session) and stops
    /// accepting new ones.
    pub async fn shutdown(&self) {
        if let Some(listener) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            listener.abort();
        }
        if let Err(err) = self.router.remove_connection().await {
            log::warn!("Failed to detach network connection: {err}");
        }
        log::info!("Peer {} shut down", self.local.peer_id());
    }
}

/// Loads the persisted peer id, generating and saving one on first start.
pub fn load_or_generate_peer_id(path: &Path) -> io::Result<String> {
    if path.exists() {
        let peer_id = fs::read_to_string(path)?.trim().to_string();
        if !peer_id.is_empty() {
            log::info!("Loaded persisted peer id from {}", path.display());
            return Ok(peer_id);
        }
        log::warn!("Peer id file {} is empty; generating a new id", path.display());
    }

    ensure_parent_dir(path)?;
    let peer_id = Uuid::new_v4().to_string();
    fs::write(path, &peer_id)?;
    log::info!("Generated new peer id and saved to {}", path.display());
    Ok(peer_id)
}
