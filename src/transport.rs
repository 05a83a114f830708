use std::io;
use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use tokio::net::UdpSocket;

use crate::error::NetError;

/// Largest possible UDP datagram; receive buffers grow to this before a
/// read so datagrams are never truncated.
pub const MAX_DATAGRAM: usize = 65535;

/// Abstract datagram transport.
///
/// The node is generic over this seam so tests can drive it over an
/// in-memory network while production uses [`UdpTransport`]. Datagrams are
/// atomic: one `recv` returns exactly one datagram. Timeouts are applied
/// per read call by the caller.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Best-effort send of one datagram.
    async fn send(&self, data: &[u8], dest: SocketAddr) -> Result<(), NetError>;

    /// Receives one datagram, growing `buf` to fit; returns the byte count
    /// and source endpoint.
    async fn recv(&self, buf: &mut Vec<u8>) -> Result<(usize, SocketAddr), NetError>;

    fn local_addr(&self) -> Result<SocketAddr, NetError>;
}

/// Production transport over a bound UDP socket.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Binds `addr:port`; failures map to [`NetError::Bind`] so callers
    /// can retry on an incremented port.
    pub async fn bind(addr: IpAddr, port: u16) -> Result<Self, NetError> {
        let socket = UdpSocket::bind((addr, port))
            .await
            .map_err(|source| NetError::Bind { port, source })?;
        Ok(Self { socket })
    }
}

fn map_io(err: io::Error) -> NetError {
    match err.kind() {
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused => NetError::Disconnect,
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => NetError::Timeout,
        _ => NetError::Io(err),
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, data: &[u8], dest: SocketAddr) -> Result<(), NetError> {
        self.socket.send_to(data, dest).await.map_err(map_io)?;
        Ok(())
    }

    async fn recv(&self, buf: &mut Vec<u8>) -> Result<(usize, SocketAddr), NetError> {
        if buf.len() < MAX_DATAGRAM {
            buf.resize(MAX_DATAGRAM, 0);
        }
        self.socket.recv_from(buf).await.map_err(map_io)
    }

    fn local_addr(&self) -> Result<SocketAddr, NetError> {
        Ok(self.socket.local_addr()?)
    }
}
