//! Tokio UDP transport.

use core::net::{IpAddr, Ipv4Addr, SocketAddr};

use tokio::net::UdpSocket;

use crate::error::{KnxError, Result};
use crate::net::transport::AsyncTransport;

/// [`AsyncTransport`] over a `tokio::net::UdpSocket`.
#[derive(Debug)]
pub struct TokioUdpTransport {
    socket: UdpSocket,
}

impl TokioUdpTransport {
    /// Wrap an already bound socket
    pub fn from_socket(socket: UdpSocket) -> Self {
        Self { socket }
    }

    /// Underlying socket
    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }
}

impl AsyncTransport for TokioUdpTransport {
    async fn bind(local: SocketAddr) -> Result<Self> {
        match UdpSocket::bind(local).await {
            Ok(socket) => Ok(Self { socket }),
            Err(_) => {
                knx_log!(error, "Failed to bind UDP socket on port {}", local.port());
                Err(KnxError::bind_failed())
            }
        }
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(|_| KnxError::bind_failed())
    }

    async fn send_to(&self, data: &[u8], destination: SocketAddr) -> Result<()> {
        match self.socket.send_to(data, destination).await {
            Ok(sent) if sent == data.len() => Ok(()),
            Ok(_) | Err(_) => {
                knx_log!(warn, "Failed to send {} bytes to port {}", data.len(), destination.port());
                Err(KnxError::send_failed())
            }
        }
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await.map_err(|_| KnxError::receive_failed())
    }

    async fn local_address_for(remote: SocketAddr) -> Result<IpAddr> {
        // Connecting a UDP socket sends nothing; it only selects the route.
        let probe = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
            .await
            .map_err(|_| KnxError::bind_failed())?;
        probe.connect(remote).await.map_err(|_| KnxError::bind_failed())?;
        probe
            .local_addr()
            .map(|addr| addr.ip())
            .map_err(|_| KnxError::bind_failed())
    }
}
