//! Request multiplexing over a single connection.
//!
//! The transport owns a [`Connection`], hands out unique request ids, and
//! runs a demux task that routes incoming frames to whoever is waiting:
//! responses resolve a oneshot per request, output chunks flow into an
//! unbounded channel registered for streaming requests. Frames arriving out
//! of request order are routed purely by id.
//!
//! The transport never reconnects. When the connection drops, every pending
//! call resolves with `Disconnected` and the policy decision is the
//! caller's.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use minibox_core::protocol::{
    ClientFrame, OutputChunk, RequestBody, RequestId, ResponseBody, ServerFrame, StreamKind,
};
use minibox_core::{ClientConfig, Error, Result, TransportError};

use crate::connection::{Connection, WsConnection};

// =============================================================================
// Pending Requests
// =============================================================================

struct Pending {
    responder: oneshot::Sender<Result<ResponseBody>>,
    chunks: Option<mpsc::UnboundedSender<OutputChunk>>,
    /// Next expected sequence number per stream (stdout, stderr).
    next_seq: [u64; 2],
}

/// Handle to one in-flight request; resolves with the terminal response.
pub struct PendingCall {
    id: RequestId,
    pub(crate) rx: oneshot::Receiver<Result<ResponseBody>>,
}

impl PendingCall {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Suspend until the response arrives or the request is cancelled.
    pub async fn wait(self) -> Result<ResponseBody> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(TransportError::Cancelled.into()))
    }
}

impl fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall").field("id", &self.id).finish()
    }
}

// =============================================================================
// Transport
// =============================================================================

/// Multiplexed request/response/stream channel to the sandbox service.
///
/// May be shared by any number of sandboxes; requests are correlated by id,
/// so no ordering exists across sandboxes or requests.
pub struct Transport {
    conn: Arc<dyn Connection>,
    pending: Arc<DashMap<RequestId, Pending>>,
    next_id: AtomicU64,
    /// `Some` once the transport is unusable; holds why.
    shutdown: Arc<Mutex<Option<TransportError>>>,
    demux: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    /// Connect to the configured service over a WebSocket.
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let conn = WsConnection::connect(config).await?;
        Ok(Self::from_connection(Arc::new(conn)))
    }

    /// Build a transport over an existing connection (used by tests).
    pub fn from_connection(conn: Arc<dyn Connection>) -> Self {
        let pending: Arc<DashMap<RequestId, Pending>> = Arc::new(DashMap::new());
        let shutdown: Arc<Mutex<Option<TransportError>>> = Arc::new(Mutex::new(None));

        let demux = tokio::spawn(demux_loop(conn.clone(), pending.clone(), shutdown.clone()));

        Self {
            conn,
            pending,
            next_id: AtomicU64::new(1),
            shutdown,
            demux: Mutex::new(Some(demux)),
        }
    }

    /// Allocate a request id, unique for this transport.
    pub fn next_id(&self) -> RequestId {
        RequestId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Whether the transport was closed or lost its connection.
    pub fn is_closed(&self) -> bool {
        self.shutdown.lock().unwrap().is_some()
    }

    fn ensure_open(&self) -> Result<()> {
        match self.shutdown.lock().unwrap().clone() {
            Some(reason) => Err(reason.into()),
            None => Ok(()),
        }
    }

    /// Dispatch a plain request/response call.
    pub async fn request(&self, sandbox: Option<&str>, body: RequestBody) -> Result<PendingCall> {
        let id = self.next_id();
        let (call, _) = self.submit(id, sandbox, body, false).await?;
        Ok(call)
    }

    /// Dispatch an execution whose output is streamed; the caller supplies
    /// the id so it can correlate chunks and abort requests.
    pub async fn request_streaming(
        &self,
        id: RequestId,
        sandbox: Option<&str>,
        body: RequestBody,
    ) -> Result<(PendingCall, mpsc::UnboundedReceiver<OutputChunk>)> {
        let (call, chunks) = self.submit(id, sandbox, body, true).await?;
        Ok((call, chunks.expect("streaming submit registers a chunk channel")))
    }

    async fn submit(
        &self,
        id: RequestId,
        sandbox: Option<&str>,
        body: RequestBody,
        stream: bool,
    ) -> Result<(PendingCall, Option<mpsc::UnboundedReceiver<OutputChunk>>)> {
        self.ensure_open()?;

        let (responder, rx) = oneshot::channel();
        let (chunk_tx, chunk_rx) = if stream {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        // Register before sending so a fast response cannot race the entry.
        self.pending.insert(
            id,
            Pending {
                responder,
                chunks: chunk_tx,
                next_seq: [0, 0],
            },
        );

        let frame = ClientFrame {
            id,
            sandbox: sandbox.map(str::to_string),
            body,
        };
        if let Err(e) = self.conn.send(frame).await {
            self.pending.remove(&id);
            return Err(e);
        }

        Ok((PendingCall { id, rx }, chunk_rx))
    }

    /// Drop the pending entry for a request; a late response is discarded.
    pub fn forget(&self, id: RequestId) {
        self.pending.remove(&id);
    }

    /// Fire-and-forget abort for an in-flight request.
    pub async fn abort(&self, sandbox: Option<&str>, target: RequestId) {
        let frame = ClientFrame {
            id: self.next_id(),
            sandbox: sandbox.map(str::to_string),
            body: RequestBody::Abort { target },
        };
        if self.conn.send(frame).await.is_err() {
            tracing::debug!(request = %target, "abort not delivered, connection gone");
        }
    }

    /// Close the transport: every pending call resolves `Cancelled` and the
    /// connection is released. Idempotent.
    pub async fn close(&self) {
        {
            let mut guard = self.shutdown.lock().unwrap();
            if guard.is_some() {
                return;
            }
            *guard = Some(TransportError::Cancelled);
        }

        fail_all(&self.pending, TransportError::Cancelled);

        // The demux task may be parked inside `conn.recv()`; stop it and
        // wait for it to unwind before touching the connection, so close
        // never contends with a receive in progress.
        let demux = self.demux.lock().unwrap().take();
        if let Some(handle) = demux {
            handle.abort();
            let _ = handle.await;
        }
        self.conn.close().await;
        tracing::debug!("transport closed");
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some(handle) = self.demux.lock().unwrap().take() {
            handle.abort();
        }
    }
}

// =============================================================================
// Demultiplexing
// =============================================================================

async fn demux_loop(
    conn: Arc<dyn Connection>,
    pending: Arc<DashMap<RequestId, Pending>>,
    shutdown: Arc<Mutex<Option<TransportError>>>,
) {
    while let Some(frame) = conn.recv().await {
        match frame {
            ServerFrame::Response(response) => {
                match pending.remove(&response.id) {
                    Some((_, entry)) => {
                        // Dropping the chunk sender ends the output stream.
                        let _ = entry.responder.send(response.into_result());
                    }
                    None => {
                        tracing::debug!(request = %response.id, "response for unknown request dropped");
                    }
                }
            }
            ServerFrame::Chunk(chunk) => route_chunk(&pending, chunk),
        }
    }

    let reason = shutdown
        .lock()
        .unwrap()
        .get_or_insert(TransportError::Disconnected)
        .clone();
    if matches!(reason, TransportError::Disconnected) {
        tracing::warn!("connection to sandbox service lost");
    }
    fail_all(&pending, reason);
}

fn route_chunk(pending: &DashMap<RequestId, Pending>, chunk: OutputChunk) {
    let id = chunk.request_id;

    let gap = match pending.get_mut(&id) {
        Some(mut entry) => {
            let lane = match chunk.stream {
                StreamKind::Stdout => 0,
                StreamKind::Stderr => 1,
            };
            let expected = entry.next_seq[lane];
            if chunk.seq != expected {
                Some((expected, chunk.seq))
            } else {
                entry.next_seq[lane] += 1;
                if let Some(tx) = &entry.chunks {
                    // A dropped receiver just discards output.
                    let _ = tx.send(chunk);
                } else {
                    tracing::warn!(request = %id, "chunk for non-streaming request dropped");
                }
                None
            }
        }
        None => {
            tracing::trace!(request = %id, "chunk for unknown request dropped");
            None
        }
    };

    // Gap-free delivery is an invariant; a hole means the request can never
    // complete coherently, so it fails with a protocol error.
    if let Some((expected, got)) = gap {
        if let Some((_, entry)) = pending.remove(&id) {
            let _ = entry.responder.send(Err(Error::protocol(format!(
                "chunk sequence gap on request {}: expected {}, got {}",
                id, expected, got
            ))));
        }
    }
}

fn fail_all(pending: &DashMap<RequestId, Pending>, reason: TransportError) {
    let ids: Vec<RequestId> = pending.iter().map(|entry| *entry.key()).collect();
    for id in ids {
        if let Some((_, entry)) = pending.remove(&id) {
            let _ = entry.responder.send(Err(reason.clone().into()));
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
