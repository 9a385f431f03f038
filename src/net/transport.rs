//! Datagram transport abstraction.
//!
//! The connection driver owns two sockets per session and only needs to bind
//! them, send datagrams and receive datagrams. [`AsyncTransport`] captures
//! exactly that, so the driver can run over tokio sockets or any other
//! datagram socket with the same shape.
//!
//! All futures are `Send`, which lets the driver run as a spawned task.

use core::future::Future;
use core::net::{IpAddr, SocketAddr};

use crate::error::Result;

/// Asynchronous UDP-like datagram socket.
///
/// # Examples
///
/// ```rust,ignore
/// use knx_tunnel::net::transport::AsyncTransport;
///
/// struct MyTransport { /* ... */ }
///
/// impl AsyncTransport for MyTransport {
///     async fn bind(local: SocketAddr) -> Result<Self> { /* ... */ }
///     fn local_addr(&self) -> Result<SocketAddr> { /* ... */ }
///     async fn send_to(&self, data: &[u8], destination: SocketAddr) -> Result<()> { /* ... */ }
///     async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> { /* ... */ }
///     async fn local_address_for(remote: SocketAddr) -> Result<IpAddr> { /* ... */ }
/// }
/// ```
pub trait AsyncTransport: Sized + Send + Sync + 'static {
    /// Bind a socket to `local` (port 0 = any available port).
    ///
    /// # Errors
    ///
    /// Returns `BindFailed` if the address is unavailable.
    fn bind(local: SocketAddr) -> impl Future<Output = Result<Self>> + Send;

    /// Address the socket is bound to.
    ///
    /// # Errors
    ///
    /// Returns `BindFailed` if the socket cannot report its address.
    fn local_addr(&self) -> Result<SocketAddr>;

    /// Send one datagram to `destination`.
    ///
    /// # Errors
    ///
    /// Returns `SendFailed` if the datagram could not be sent.
    fn send_to(&self, data: &[u8], destination: SocketAddr) -> impl Future<Output = Result<()>> + Send;

    /// Wait for one datagram.
    ///
    /// Returns the datagram length and the sender address.
    ///
    /// # Errors
    ///
    /// Returns `ReceiveFailed` if the socket reports an error.
    fn recv_from(&self, buf: &mut [u8]) -> impl Future<Output = Result<(usize, SocketAddr)>> + Send;

    /// Local interface address used to reach `remote`.
    ///
    /// Needed when sockets are bound to the unspecified address but the
    /// server must be told a routable one.
    ///
    /// # Errors
    ///
    /// Returns `BindFailed` if no route to `remote` exists.
    fn local_address_for(remote: SocketAddr) -> impl Future<Output = Result<IpAddr>> + Send;
}
