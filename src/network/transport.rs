use std::io;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::pool::ConnectionPool;
use super::session::{BoxedIo, Session};

/// Opens the raw byte stream a session runs over.
///
/// The anonymizing provider plugs its own implementation in here (for
/// example a SOCKS tunnel to a hidden service).
pub trait Dialer: Send + Sync {
    fn dial<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, io::Result<BoxedIo>>;
}

/// Plain TCP, no proxy.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDialer;

impl Dialer for TcpDialer {
    fn dial<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, io::Result<BoxedIo>> {
        async move {
            let stream = TcpStream::connect((host, port)).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxedIo)
        }
        .boxed()
    }
}

/// Accepts inbound sessions and hands them to the pool.
///
/// Each session is keyed by the address its peer announced during the
/// handshake, or by the socket address when none was sent.
pub fn spawn_listener(listener: TcpListener, pool: Arc<ConnectionPool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        match listener.local_addr() {
            Ok(addr) => log::info!("Listening on {addr}"),
            Err(err) => log::warn!("Listener has no local address: {err}"),
        }

        loop {
            let (stream, remote) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    log::warn!("Accept failed: {err}");
                    continue;
                }
            };
            if let Err(err) = stream.set_nodelay(true) {
                log::debug!("Failed to set nodelay for {remote}: {err}");
            }

            let pool = pool.clone();
            tokio::spawn(async move {
                let fallback = format!("ws://{remote}");
                let config = pool.config();
                let handshake = Session::accept(
                    Box::new(stream),
                    &fallback,
                    config.websocket_config(),
                );

                let session = match timeout(config.connect_timeout, handshake).await {
                    Ok(Ok((session, announced))) => {
                        if announced.is_none() {
                            log::debug!("Peer {remote} did not announce an address");
                        }
                        Arc::new(session)
                    }
                    Ok(Err(err)) => {
                        log::warn!("Handshake with {remote} failed: {err}");
                        return;
                    }
                    Err(_) => {
                        log::warn!("Handshake with {remote} timed out");
                        return;
                    }
                };

                let address = session.address().to_string();
                if let Err(err) = pool.accept(&address, session.clone()).await {
                    log::warn!("Rejected inbound session from {address}: {err}");
                    session.close(config.write_timeout).await;
                }
            });
        }
    })
}
