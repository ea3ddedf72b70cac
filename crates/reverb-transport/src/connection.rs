//! Connection handles: a clonable write side and a single-owner read side.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tokio::time::timeout;

use crate::{ConnectionId, Role, TransportError};

/// Counter for generating unique connection IDs.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// How long a peer may lag behind before its connection is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionLimits {
    /// Frames queued but not yet written. A send that finds the queue
    /// full fails the connection. Default: 1024.
    pub max_queued_frames: usize,
    /// Longest a single frame may take to write. Default: 10 s.
    pub write_timeout: Duration,
    /// Longest [`ConnectionHandle::close_and_flush`] waits for queued
    /// frames before dropping them. Default: 5 s.
    pub flush_timeout: Duration,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_queued_frames: 1024,
            write_timeout: Duration::from_secs(10),
            flush_timeout: Duration::from_secs(5),
        }
    }
}

/// Liveness of a connection, shared by the handle, the writer task and
/// the reader.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LinkState {
    Open,
    /// Closed on purpose, locally or by the peer.
    Closed,
    /// Dropped because a write failed or the peer fell too far behind.
    Failed(String),
}

/// Moves `Open` to `next`. Returns `false` if the connection was already
/// down, leaving the first reason in place.
fn shut(state: &watch::Sender<LinkState>, next: LinkState) -> bool {
    state.send_if_modified(|current| {
        if *current == LinkState::Open {
            *current = next;
            true
        } else {
            false
        }
    })
}

/// Commands consumed by a connection's writer task.
enum Outbound {
    Frame(Vec<u8>),
    /// Flush everything queued before this, shut the socket down, then
    /// signal the optional ack.
    Close(Option<oneshot::Sender<()>>),
}

struct Inner {
    id: ConnectionId,
    peer_addr: SocketAddr,
    role: Role,
    limits: ConnectionLimits,
    outbound: mpsc::Sender<Outbound>,
    state: Arc<watch::Sender<LinkState>>,
    writer: AbortHandle,
}

/// The write side of a connection, plus its liveness flag.
///
/// Cloning is cheap (an `Arc`), and every clone talks to the same
/// writer task, so any task may send on or close the connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<Inner>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("peer_addr", &self.inner.peer_addr)
            .field("role", &self.inner.role)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Address of the remote end.
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// `false` once [`close`](Self::close) ran or the connection failed.
    pub fn is_alive(&self) -> bool {
        *self.inner.state.borrow() == LinkState::Open
    }

    /// Why the connection was dropped, if it failed rather than being
    /// closed.
    pub fn failure(&self) -> Option<String> {
        match &*self.inner.state.borrow() {
            LinkState::Failed(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    /// Queues one already-encoded frame for writing.
    ///
    /// Returns as soon as the frame is queued. The writer task writes it
    /// in full (retrying partial writes) or fails the connection.
    ///
    /// # Errors
    /// [`TransportError::SendFailed`] if the queue is full (the
    /// connection is failed on the spot) or an earlier write failed;
    /// [`TransportError::ConnectionClosed`] if it was closed.
    pub fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_alive() {
            return Err(self.down_error());
        }
        match self.inner.outbound.try_send(Outbound::Frame(frame)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let reason = format!(
                    "outbound queue full ({} frames)",
                    self.inner.limits.max_queued_frames
                );
                self.fail(reason);
                Err(self.down_error())
            }
            Err(TrySendError::Closed(_)) => Err(self.down_error()),
        }
    }

    /// Closes the connection without waiting for the socket shutdown.
    ///
    /// Frames already queued are still written, unless the queue is full,
    /// in which case they are dropped with the writer. Idempotent: returns
    /// `true` only for the call that actually closed it.
    pub fn close(&self) -> bool {
        if !shut(&self.inner.state, LinkState::Closed) {
            return false;
        }
        if self.inner.outbound.try_send(Outbound::Close(None)).is_err() {
            self.inner.writer.abort();
        }
        tracing::debug!(id = %self.inner.id, peer = %self.inner.peer_addr, "connection closed");
        true
    }

    /// Like [`close`](Self::close), but waits until every queued frame has
    /// been written and the write half is shut down.
    ///
    /// Gives up after [`ConnectionLimits::flush_timeout`]: the writer is
    /// dropped along with whatever it had not written yet.
    pub async fn close_and_flush(&self) -> bool {
        if !shut(&self.inner.state, LinkState::Closed) {
            return false;
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        let outbound = self.inner.outbound.clone();
        let flush = async move {
            if outbound.send(Outbound::Close(Some(ack_tx))).await.is_ok() {
                // An Err here means the writer died first; nothing left to flush.
                let _ = ack_rx.await;
            }
        };

        if timeout(self.inner.limits.flush_timeout, flush).await.is_err() {
            tracing::warn!(
                id = %self.inner.id,
                peer = %self.inner.peer_addr,
                timeout = ?self.inner.limits.flush_timeout,
                "flush timed out, dropping unsent frames"
            );
            self.inner.writer.abort();
        } else {
            tracing::debug!(id = %self.inner.id, peer = %self.inner.peer_addr, "connection flushed and closed");
        }
        true
    }

    /// Resolves once the connection is closed, for whatever reason.
    pub async fn closed(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|state| *state != LinkState::Open).await;
    }

    fn fail(&self, reason: String) {
        if shut(&self.inner.state, LinkState::Failed(reason.clone())) {
            tracing::warn!(id = %self.inner.id, peer = %self.inner.peer_addr, %reason, "connection failed");
            self.inner.writer.abort();
        }
    }

    fn down_error(&self) -> TransportError {
        match self.failure() {
            Some(reason) => TransportError::SendFailed(format!(
                "{} ({}): {reason}",
                self.inner.id, self.inner.peer_addr
            )),
            None => TransportError::ConnectionClosed(format!(
                "{} ({}) is closed",
                self.inner.id, self.inner.peer_addr
            )),
        }
    }
}

/// The read side of a connection. Owned by a single read loop.
#[derive(Debug)]
pub struct ConnectionReader {
    id: ConnectionId,
    peer_addr: SocketAddr,
    read_half: OwnedReadHalf,
    state: watch::Receiver<LinkState>,
}

impl ConnectionReader {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Reads whatever bytes are available into `buf`.
    ///
    /// Returns `Ok(0)` when the peer closed the stream *or* when the
    /// connection was closed (or failed) locally, so a read loop never
    /// stays parked on a connection somebody else already tore down.
    ///
    /// # Errors
    /// Returns [`TransportError::ReceiveFailed`] on I/O failure (reset,
    /// broken pipe...).
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if *self.state.borrow() != LinkState::Open {
            return Ok(0);
        }
        tokio::select! {
            result = self.read_half.read(buf) => {
                result.map_err(TransportError::ReceiveFailed)
            }
            _ = self.state.wait_for(|state| *state != LinkState::Open) => Ok(0),
        }
    }
}

/// Splits a connected stream into its handle and reader, and spawns the
/// writer task. Must be called from within a Tokio runtime.
pub(crate) fn split(
    stream: TcpStream,
    peer_addr: SocketAddr,
    role: Role,
    limits: ConnectionLimits,
) -> (ConnectionHandle, ConnectionReader) {
    let id = ConnectionId::new(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed));

    // Snapshots are small and latency-sensitive; don't let Nagle batch them.
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(%id, error = %e, "failed to set TCP_NODELAY");
    }

    let (read_half, write_half) = stream.into_split();
    let (outbound_tx, outbound_rx) = mpsc::channel(limits.max_queued_frames.max(1));
    let (state_tx, state_rx) = watch::channel(LinkState::Open);
    let state = Arc::new(state_tx);

    let writer = tokio::spawn(write_loop(
        id,
        write_half,
        outbound_rx,
        Arc::clone(&state),
        limits.write_timeout,
    ))
    .abort_handle();

    let handle = ConnectionHandle {
        inner: Arc::new(Inner {
            id,
            peer_addr,
            role,
            limits,
            outbound: outbound_tx,
            state,
            writer,
        }),
    };
    let reader = ConnectionReader {
        id,
        peer_addr,
        read_half,
        state: state_rx,
    };
    (handle, reader)
}

/// Drains the outbound queue into the socket until closed or broken.
async fn write_loop(
    id: ConnectionId,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Outbound>,
    state: Arc<watch::Sender<LinkState>>,
    write_timeout: Duration,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Outbound::Frame(bytes) => {
                let reason = match timeout(write_timeout, writer.write_all(&bytes)).await {
                    Ok(Ok(())) => {
                        tracing::trace!(%id, len = bytes.len(), "frame written");
                        continue;
                    }
                    Ok(Err(e)) => format!("write failed: {e}"),
                    Err(_) => format!("write timed out after {write_timeout:?}"),
                };
                if shut(&state, LinkState::Failed(reason.clone())) {
                    tracing::warn!(%id, %reason, "dropping connection");
                }
                // Dropping the write half shuts the socket down.
                return;
            }
            Outbound::Close(ack) => {
                let _ = writer.shutdown().await;
                shut(&state, LinkState::Closed);
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
                return;
            }
        }
    }

    // Every handle was dropped.
    let _ = writer.shutdown().await;
    shut(&state, LinkState::Closed);
}
