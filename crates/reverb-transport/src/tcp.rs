//! TCP listener and outbound connect.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};

use crate::connection::split;
use crate::{ConnectionHandle, ConnectionLimits, ConnectionReader, Role, TransportError};

/// A listening TCP socket that hands out split connections.
pub struct TcpTransport {
    listener: TcpListener,
    limits: ConnectionLimits,
}

impl TcpTransport {
    /// Binds a new transport to the given address (`"0.0.0.0:4444"`,
    /// `"127.0.0.1:0"` for an OS-assigned port...).
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(TransportError::AcceptFailed)?;
        tracing::info!(addr, "TCP transport listening");
        Ok(Self {
            listener,
            limits: ConnectionLimits::default(),
        })
    }

    /// Limits applied to every connection accepted from now on.
    pub fn with_limits(mut self, limits: ConnectionLimits) -> Self {
        self.limits = limits;
        self
    }

    /// The address actually bound, useful after binding port 0.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.listener
            .local_addr()
            .map_err(TransportError::AcceptFailed)
    }

    /// Waits for and accepts the next incoming connection.
    pub async fn accept(
        &self,
    ) -> Result<(ConnectionHandle, ConnectionReader), TransportError> {
        let (stream, addr) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::AcceptFailed)?;

        let (handle, reader) = split(stream, addr, Role::Accepted, self.limits);
        tracing::debug!(id = %handle.id(), %addr, "accepted TCP connection");
        Ok((handle, reader))
    }
}

/// Opens an outbound connection to `addr` with default limits.
pub async fn connect(
    addr: &str,
) -> Result<(ConnectionHandle, ConnectionReader), TransportError> {
    connect_with_limits(addr, ConnectionLimits::default()).await
}

/// Opens an outbound connection to `addr`.
pub async fn connect_with_limits(
    addr: &str,
    limits: ConnectionLimits,
) -> Result<(ConnectionHandle, ConnectionReader), TransportError> {
    let connect_failed = |source| TransportError::ConnectFailed {
        addr: addr.to_string(),
        source,
    };
    let stream = TcpStream::connect(addr).await.map_err(connect_failed)?;
    let peer_addr = stream.peer_addr().map_err(connect_failed)?;

    let (handle, reader) = split(stream, peer_addr, Role::Outbound, limits);
    tracing::debug!(id = %handle.id(), %peer_addr, "outbound TCP connection established");
    Ok((handle, reader))
}
