use std::io;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::{Role, WebSocketConfig};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{WebSocketStream, accept_hdr_async_with_config, client_async_with_config};

use super::transport::Dialer;
use crate::error::{Error, Result};

/// Handshake header carrying the dialing peer's own address.
pub const PEER_ADDRESS_HEADER: &str = "x-peer-address";

/// Byte stream a session can run over: plain TCP, a proxy tunnel, or an
/// in-memory pipe.
pub trait SessionIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SessionIo for T {}

pub type BoxedIo = Box<dyn SessionIo>;

type WsStream = WebSocketStream<BoxedIo>;

/// One framed text channel to a remote peer.
///
/// Reads and writes are guarded separately so a pending read never blocks
/// the write path.
pub struct Session {
    address: String,
    sink: Mutex<SplitSink<WsStream, WsMessage>>,
    stream: Mutex<SplitStream<WsStream>>,
}

impl Session {
    fn from_stream(address: String, ws: WsStream) -> Self {
        let (sink, stream) = ws.split();
        Self {
            address,
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        }
    }

    /// Wraps a stream on which the WebSocket handshake already happened.
    pub async fn from_raw(
        address: impl Into<String>,
        io: BoxedIo,
        role: Role,
        config: Option<WebSocketConfig>,
    ) -> Self {
        let ws = WebSocketStream::from_raw_socket(io, role, config).await;
        Self::from_stream(address.into(), ws)
    }

    /// Dials `address` (`ws://host:port`) and performs the client handshake,
    /// announcing `local_address`.
    pub async fn connect(
        dialer: &dyn Dialer,
        address: &str,
        local_address: &str,
        config: WebSocketConfig,
    ) -> Result<Self> {
        let mut request = address
            .into_client_request()
            .map_err(|err| Error::InvalidAddress(format!("{address}: {err}")))?;
        let announced = HeaderValue::from_str(local_address)
            .map_err(|err| Error::InvalidAddress(format!("{local_address}: {err}")))?;
        request.headers_mut().insert(PEER_ADDRESS_HEADER, announced);

        let host = request
            .uri()
            .host()
            .ok_or_else(|| Error::InvalidAddress(format!("{address}: missing host")))?
            .to_string();
        let port = request.uri().port_u16().unwrap_or(80);

        let io = dialer.dial(&host, port).await?;
        let (ws, _response) = client_async_with_config(request, io, Some(config))
            .await
            .map_err(|err| classify(address, err))?;

        Ok(Self::from_stream(address.to_string(), ws))
    }

    /// Runs the server handshake. Returns the session together with the
    /// address the remote peer announced, if any.
    pub async fn accept(
        io: BoxedIo,
        fallback_address: &str,
        config: WebSocketConfig,
    ) -> Result<(Self, Option<String>)> {
        let mut announced = None;
        let callback = |request: &Request, response: Response| -> std::result::Result<
            Response,
            ErrorResponse,
        > {
            announced = request
                .headers()
                .get(PEER_ADDRESS_HEADER)
                .and_then(|value| value.to_str().ok())
                .filter(|value| !value.is_empty())
                .map(str::to_owned);
            Ok(response)
        };

        let ws = accept_hdr_async_with_config(io, callback, Some(config))
            .await
            .map_err(|err| classify(fallback_address, err))?;

        let address = announced
            .clone()
            .unwrap_or_else(|| fallback_address.to_string());
        Ok((Self::from_stream(address, ws), announced))
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn send_text(&self, payload: &str, deadline: Duration) -> Result<()> {
        self.write(WsMessage::text(payload.to_owned()), deadline)
            .await
    }

    /// Zero-length liveness probe.
    pub async fn ping(&self, deadline: Duration) -> Result<()> {
        self.write(WsMessage::Ping(Default::default()), deadline)
            .await
    }

    async fn write(&self, frame: WsMessage, deadline: Duration) -> Result<()> {
        let mut sink = self.sink.lock().await;
        match timeout(deadline, sink.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(classify(&self.address, err)),
            Err(_) => Err(Error::TransientIo(format!(
                "write to {} timed out",
                self.address
            ))),
        }
    }

    /// Attempts to read one frame within `deadline`.
    ///
    /// Returns `Ok(None)` when nothing arrived in time, when only control
    /// frames arrived, or when another read on this session is still
    /// pending.
    pub async fn try_read(&self, deadline: Duration) -> Result<Option<String>> {
        let Ok(mut stream) = self.stream.try_lock() else {
            return Ok(None);
        };

        let next = match timeout(deadline, stream.next()).await {
            Ok(next) => next,
            Err(_) => return Ok(None),
        };

        match next {
            Some(Ok(WsMessage::Text(text))) if text.is_empty() => Ok(None),
            Some(Ok(WsMessage::Text(text))) => Ok(Some(text.as_str().to_owned())),
            Some(Ok(WsMessage::Binary(bytes))) => String::from_utf8(bytes.to_vec())
                .map(Some)
                .map_err(|err| Error::Decode(format!("binary frame from {}: {err}", self.address))),
            Some(Ok(WsMessage::Close(_))) | None => Err(Error::ConnectionClosed(format!(
                "{} closed the session",
                self.address
            ))),
            Some(Ok(_)) => Ok(None),
            Some(Err(err)) => Err(classify(&self.address, err)),
        }
    }

    /// Sends a close frame; errors are ignored since the session is being
    /// dropped anyway.
    pub async fn close(&self, deadline: Duration) {
        let mut sink = self.sink.lock().await;
        if let Ok(Err(err)) = timeout(deadline, sink.close()).await {
            log::debug!("Close of session {} failed: {err}", self.address);
        }
    }
}

/// Maps a WebSocket error onto the closed/transient split the pool acts on.
pub(crate) fn classify(address: &str, err: WsError) -> Error {
    match err {
        WsError::ConnectionClosed
        | WsError::AlreadyClosed
        | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
            Error::ConnectionClosed(format!("{address}: {err}"))
        }
        WsError::Io(io_err) if is_closed_io(&io_err) => {
            Error::ConnectionClosed(format!("{address}: {io_err}"))
        }
        other => Error::TransientIo(format!("{address}: {other}")),
    }
}

fn is_closed_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}
