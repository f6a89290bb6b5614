//! Wire connections to the sandbox service.
//!
//! This module provides the `Connection` trait and two implementations: a
//! WebSocket connection via `tokio-tungstenite` for talking to a real
//! service, and an in-memory pair for tests. Frames are JSON text messages;
//! multiplexing by request id happens one layer up, in the transport.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use secrecy::ExposeSecret;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use minibox_core::protocol::{
    ClientFrame, OutputChunk, RemoteError, RequestId, ResponseBody, ResponseFrame, ServerFrame,
    StreamKind,
};
use minibox_core::{ClientConfig, Error, Result, TransportError};

// =============================================================================
// Connection Trait
// =============================================================================

/// A raw duplex frame pipe to the sandbox service.
///
/// Implementations carry no correlation logic; they move single frames.
/// `recv` returning `None` means the connection is gone for good.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Send one frame to the service.
    async fn send(&self, frame: ClientFrame) -> Result<()>;

    /// Receive the next frame. `None` once the connection is closed or lost.
    async fn recv(&self) -> Option<ServerFrame>;

    /// Close the connection. Idempotent.
    async fn close(&self);
}

// =============================================================================
// WebSocket Connection
// =============================================================================

type WsSink = futures::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = futures::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Production connection over a WebSocket, one JSON frame per text message.
pub struct WsConnection {
    writer: Mutex<WsSink>,
    reader: Mutex<WsSource>,
}

impl WsConnection {
    /// Connect to the configured service endpoint, attaching the API key as
    /// a bearer token when one is configured.
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let mut request = config
            .server_url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        if let Some(key) = &config.api_key {
            let value = format!("Bearer {}", key.expose_secret());
            let header = HeaderValue::from_str(&value)
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, header);
        }

        let stream = match tokio::time::timeout(config.connect_timeout(), connect_async(request))
            .await
        {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => return Err(TransportError::Connect(e.to_string()).into()),
            Err(_) => return Err(Error::timeout("connect", config.connect_timeout())),
        };

        tracing::info!(url = %config.server_url, "connected to sandbox service");

        let (writer, reader) = stream.split();
        Ok(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
        })
    }
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&self, frame: ClientFrame) -> Result<()> {
        let text = serde_json::to_string(&frame)?;
        self.writer
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|_| TransportError::Disconnected.into())
    }

    async fn recv(&self) -> Option<ServerFrame> {
        let mut reader = self.reader.lock().await;
        loop {
            match reader.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str(&text) {
                    Ok(frame) => return Some(frame),
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping malformed frame");
                    }
                },
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Binary(_))) | Some(Ok(Message::Frame(_))) => {
                    tracing::warn!("dropping unexpected non-text frame");
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
            }
        }
    }

    async fn close(&self) {
        let _ = self.writer.lock().await.close().await;
    }
}

// =============================================================================
// Mock Connection (for testing without a service)
// =============================================================================

/// In-memory connection for unit testing; paired with a [`MockRemote`]
/// that plays the server side.
pub struct MockConnection {
    outbound: std::sync::Mutex<Option<mpsc::UnboundedSender<ClientFrame>>>,
    inbound: Mutex<mpsc::UnboundedReceiver<ServerFrame>>,
    closed: AtomicBool,
}

/// The server end of a [`MockConnection`] pair. Dropping it simulates a
/// lost connection.
pub struct MockRemote {
    requests: mpsc::UnboundedReceiver<ClientFrame>,
    frames: mpsc::UnboundedSender<ServerFrame>,
}

impl MockConnection {
    /// Create a connected client/server pair.
    pub fn pair() -> (Self, MockRemote) {
        let (outbound, requests) = mpsc::unbounded_channel();
        let (frames, inbound) = mpsc::unbounded_channel();
        (
            Self {
                outbound: std::sync::Mutex::new(Some(outbound)),
                inbound: Mutex::new(inbound),
                closed: AtomicBool::new(false),
            },
            MockRemote { requests, frames },
        )
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn send(&self, frame: ClientFrame) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected.into());
        }
        let sender = self.outbound.lock().unwrap().clone();
        match sender {
            Some(tx) => tx.send(frame).map_err(|_| TransportError::Disconnected.into()),
            None => Err(TransportError::Disconnected.into()),
        }
    }

    async fn recv(&self) -> Option<ServerFrame> {
        self.inbound.lock().await.recv().await
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the sender lets the remote observe the close.
        self.outbound.lock().unwrap().take();
        self.inbound.lock().await.close();
    }
}

impl MockRemote {
    /// Receive the next request sent by the client.
    pub async fn next_request(&mut self) -> Option<ClientFrame> {
        self.requests.recv().await
    }

    /// Push a raw frame to the client.
    pub fn push(&self, frame: ServerFrame) {
        let _ = self.frames.send(frame);
    }

    /// Answer a request successfully.
    pub fn respond(&self, id: RequestId, body: ResponseBody) {
        self.push(ServerFrame::Response(ResponseFrame::success(id, body)));
    }

    /// Answer a request with a remote error.
    pub fn fail(&self, id: RequestId, code: &str, message: &str) {
        self.push(ServerFrame::Response(ResponseFrame::failure(
            id,
            RemoteError {
                code: code.to_string(),
                message: message.to_string(),
            },
        )));
    }

    /// Push one output chunk for an execution.
    pub fn chunk(&self, id: RequestId, stream: StreamKind, seq: u64, data: &str) {
        self.push(ServerFrame::Chunk(OutputChunk {
            request_id: id,
            stream,
            seq,
            data: data.to_string(),
        }));
    }
}
