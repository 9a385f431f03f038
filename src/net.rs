//! Network endpoint helpers and transport seams.
//!
//! KNXnet/IP tunneling only runs over UDP/IPv4, so endpoints are plain
//! [`SocketAddrV4`] values. The helpers here convert caller-supplied
//! addresses and implement the NAT placeholder rules.

use core::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::error::{KnxError, Result};

pub mod transport;

#[cfg(feature = "tokio")]
pub mod tokio_adapter;

/// A UDP/IPv4 endpoint.
pub type Endpoint = SocketAddrV4;

/// `0.0.0.0:0`, advertised in NAT mode so the server answers to the
/// datagram's source address.
pub const NAT_PLACEHOLDER: Endpoint = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);

/// Convert a socket address into an IPv4 endpoint.
///
/// # Errors
///
/// Returns a `NotIpv4` connection error for IPv6 addresses.
pub fn to_endpoint(addr: SocketAddr) -> Result<Endpoint> {
    match addr {
        SocketAddr::V4(v4) => Ok(v4),
        SocketAddr::V6(_) => Err(KnxError::not_ipv4()),
    }
}

/// Convert an IP address into an IPv4 address.
///
/// # Errors
///
/// Returns a `NotIpv4` connection error for IPv6 addresses.
pub fn to_ipv4(addr: IpAddr) -> Result<Ipv4Addr> {
    match addr {
        IpAddr::V4(v4) => Ok(v4),
        IpAddr::V6(_) => Err(KnxError::not_ipv4()),
    }
}

/// Whether an advertised endpoint carries no usable address.
///
/// Servers behind NAT (or talking to a NAT client) answer with `0.0.0.0`,
/// a loopback address, or port 0. The receiver then has to use the address
/// the datagram actually came from.
pub fn is_unroutable(endpoint: Endpoint) -> bool {
    endpoint.ip().is_unspecified() || endpoint.ip().is_loopback() || endpoint.port() == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::net::Ipv6Addr;

    #[test]
    fn test_to_endpoint() {
        let v4 = SocketAddr::from(([192, 168, 1, 10], 3671));
        assert_eq!(
            to_endpoint(v4).unwrap(),
            SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 10), 3671)
        );

        let v6 = SocketAddr::from((Ipv6Addr::LOCALHOST, 3671));
        let err = to_endpoint(v6).unwrap_err();
        assert!(matches!(err, KnxError::Connection(ref e) if e.is_not_ipv4()));
    }

    #[test]
    fn test_to_ipv4() {
        assert_eq!(to_ipv4(IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap(), Ipv4Addr::LOCALHOST);
        assert!(to_ipv4(IpAddr::V6(Ipv6Addr::UNSPECIFIED)).is_err());
    }

    #[test]
    fn test_is_unroutable() {
        assert!(is_unroutable(NAT_PLACEHOLDER));
        assert!(is_unroutable(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 3671)));
        assert!(is_unroutable(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 0)));
        assert!(!is_unroutable(SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 5), 3671)));
    }
}
