//! Tunneling connections.
//!
//! A tunnel connection (`TUNNEL_CONNECTION`, 0x04) carries cEMI frames in
//! `TUNNELLING_REQUEST` / `TUNNELLING_ACK` pairs. The CRI selects the KNX
//! layer the server should tunnel; the CRD returned on success holds the
//! individual address the server assigned to this tunnel.
//!
//! ```text
//! CRI:  ┌────────┬───────────┬───────────┬──────────┐
//!       │ len=04 │ type=0x04 │ KNX layer │ reserved │
//!       └────────┴───────────┴───────────┴──────────┘
//! CRD:  ┌────────┬───────────┬───────────────────────┐
//!       │ len=04 │ type=0x04 │  individual address   │
//!       └────────┴───────────┴───────────────────────┘
//! ```

use crate::addressing::IndividualAddress;
use crate::configuration::ConnectionKind;
use crate::protocol::constants::{
    MAX_ACKNOWLEDGE_ATTEMPTS, TUNNELING_REQUEST_TIMEOUT, TUNNEL_BUSMONITOR, TUNNEL_CONNECTION,
    TUNNEL_LINKLAYER, TUNNEL_RAW,
};
use crate::protocol::services::{ConnectionInfo, DataService};

/// KNX layer requested for a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TunnelLayer {
    /// Data link layer tunnel (`TUNNEL_LINKLAYER`)
    #[default]
    LinkLayer,
    /// Raw tunnel (`TUNNEL_RAW`)
    Raw,
    /// Bus monitor tunnel (`TUNNEL_BUSMONITOR`)
    BusMonitor,
}

impl TunnelLayer {
    /// Layer code carried in the CRI
    pub const fn code(self) -> u8 {
        match self {
            Self::LinkLayer => TUNNEL_LINKLAYER,
            Self::Raw => TUNNEL_RAW,
            Self::BusMonitor => TUNNEL_BUSMONITOR,
        }
    }
}

impl ConnectionKind {
    /// Tunnel connection on `layer` with a 1 s acknowledge timeout and
    /// three transmissions per frame.
    pub fn tunneling(layer: TunnelLayer) -> Self {
        let mut cri = ConnectionInfo::new();
        // Four bytes always fit.
        let _ = cri.extend_from_slice(&[4, TUNNEL_CONNECTION, layer.code(), 0x00]);

        Self {
            connection_type: TUNNEL_CONNECTION,
            cri,
            data_service: DataService::Tunnelling,
            acknowledge_timeout: TUNNELING_REQUEST_TIMEOUT,
            max_acknowledge_attempts: MAX_ACKNOWLEDGE_ATTEMPTS,
        }
    }
}

/// Individual address assigned to the tunnel, read from a tunneling CRD.
///
/// Returns `None` for CRDs of other connection types or of unexpected size.
pub fn assigned_address(crd: &[u8]) -> Option<IndividualAddress> {
    match *crd {
        [4, TUNNEL_CONNECTION, ..] => IndividualAddress::decode(crd, 2).ok().map(|(addr, _)| addr),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;

    #[test]
    fn test_tunneling_cri() {
        let kind = ConnectionKind::tunneling(TunnelLayer::LinkLayer);
        assert_eq!(kind.cri.as_slice(), &[0x04, 0x04, 0x02, 0x00]);
        assert_eq!(kind.data_service, DataService::Tunnelling);
        assert_eq!(kind.acknowledge_timeout, Duration::from_secs(1));
        assert_eq!(kind.max_acknowledge_attempts, 3);

        let monitor = ConnectionKind::tunneling(TunnelLayer::BusMonitor);
        assert_eq!(monitor.cri[2], 0x80);
        assert_eq!(ConnectionKind::tunneling(TunnelLayer::Raw).cri[2], 0x04);
    }

    #[test]
    fn test_assigned_address() {
        let addr = assigned_address(&[0x04, 0x04, 0x11, 0xFA]).unwrap();
        assert_eq!(addr.to_string(), "1.1.250");

        assert_eq!(assigned_address(&[0x02, 0x03]), None);
        assert_eq!(assigned_address(&[0x04, 0x03, 0x11, 0xFA]), None);
        assert_eq!(assigned_address(&[0x04, 0x04, 0x11]), None);
        assert_eq!(assigned_address(&[]), None);
    }
}
