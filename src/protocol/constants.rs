//! KNXnet/IP protocol constants, service type identifiers and status codes.

use core::time::Duration;

/// KNXnet/IP protocol version 1.0
pub const KNXNETIP_VERSION_10: u8 = 0x10;

/// Standard KNXnet/IP header length (6 bytes)
pub const HEADER_SIZE_10: u8 = 0x06;

/// Standard UDP port for KNXnet/IP communication
pub const KNXNETIP_DEFAULT_PORT: u16 = 3671;

/// Maximum size of a KNXnet/IP frame handled by this crate
pub const MAX_FRAME_SIZE: usize = 256;

/// Maximum size of a cEMI frame carried in a tunneling/device-management request
pub const MAX_CEMI_SIZE: usize = MAX_FRAME_SIZE - 10;

/// Maximum size of a CRI or CRD structure
pub const MAX_CONNECTION_INFO_SIZE: usize = 16;

// =============================================================================
// Timeouts (KNXnet/IP core and tunneling sections)
// =============================================================================

/// Time to wait for a `CONNECT_RESPONSE`
pub const CONNECT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Time to wait for a `CONNECTIONSTATE_RESPONSE`
pub const CONNECTIONSTATE_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Time to wait for a `DISCONNECT_RESPONSE`
pub const DISCONNECT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between heartbeats
pub const HEARTBEAT_REQUEST_TIME: Duration = Duration::from_secs(60);

/// Time to wait for a `TUNNELING_ACK`
pub const TUNNELING_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// Time to wait for a `DEVICE_CONFIGURATION_ACK`
pub const DEVICE_CONFIGURATION_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection-state requests sent without answer before the peer is declared dead
pub const MAX_CONNECTIONSTATE_REQUESTS: u8 = 3;

/// Transmissions of a data frame before the acknowledge is declared lost
pub const MAX_ACKNOWLEDGE_ATTEMPTS: u8 = 3;

// =============================================================================
// Service Type Identifiers
// =============================================================================

/// KNXnet/IP service type identifiers used by connection-oriented sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u16)]
pub enum ServiceType {
    /// `CONNECT_REQUEST`
    ConnectRequest = 0x0205,
    /// `CONNECT_RESPONSE`
    ConnectResponse = 0x0206,
    /// `CONNECTIONSTATE_REQUEST` (heartbeat)
    ConnectionStateRequest = 0x0207,
    /// `CONNECTIONSTATE_RESPONSE`
    ConnectionStateResponse = 0x0208,
    /// `DISCONNECT_REQUEST`
    DisconnectRequest = 0x0209,
    /// `DISCONNECT_RESPONSE`
    DisconnectResponse = 0x020A,
    /// `DEVICE_CONFIGURATION_REQUEST`
    DeviceConfigurationRequest = 0x0310,
    /// `DEVICE_CONFIGURATION_ACK`
    DeviceConfigurationAck = 0x0311,
    /// `TUNNELLING_REQUEST`
    TunnellingRequest = 0x0420,
    /// `TUNNELLING_ACK`
    TunnellingAck = 0x0421,
}

impl ServiceType {
    /// Convert a u16 to `ServiceType`
    pub const fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0205 => Some(Self::ConnectRequest),
            0x0206 => Some(Self::ConnectResponse),
            0x0207 => Some(Self::ConnectionStateRequest),
            0x0208 => Some(Self::ConnectionStateResponse),
            0x0209 => Some(Self::DisconnectRequest),
            0x020A => Some(Self::DisconnectResponse),
            0x0310 => Some(Self::DeviceConfigurationRequest),
            0x0311 => Some(Self::DeviceConfigurationAck),
            0x0420 => Some(Self::TunnellingRequest),
            0x0421 => Some(Self::TunnellingAck),
            _ => None,
        }
    }

    /// Convert `ServiceType` to u16
    pub const fn to_u16(self) -> u16 {
        self as u16
    }
}

// =============================================================================
// Connection Type Codes
// =============================================================================

/// Connection type for `DEVICE_MGMT_CONNECTION`
pub const DEVICE_MGMT_CONNECTION: u8 = 0x03;

/// Connection type for `TUNNEL_CONNECTION`
pub const TUNNEL_CONNECTION: u8 = 0x04;

/// Tunneling on the data link layer
pub const TUNNEL_LINKLAYER: u8 = 0x02;

/// Raw tunneling
pub const TUNNEL_RAW: u8 = 0x04;

/// Bus monitor tunneling
pub const TUNNEL_BUSMONITOR: u8 = 0x80;

// =============================================================================
// Host Protocol Codes
// =============================================================================

/// IPv4 UDP protocol
pub const IPV4_UDP: u8 = 0x01;

/// IPv4 TCP protocol
pub const IPV4_TCP: u8 = 0x02;

// =============================================================================
// Status Codes
// =============================================================================

/// Status byte carried by responses and acknowledges.
///
/// Every byte value decodes; unrecognised ones become `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Status {
    /// `E_NO_ERROR`
    #[default]
    NoError,
    /// `E_HOST_PROTOCOL_TYPE`
    HostProtocolType,
    /// `E_VERSION_NOT_SUPPORTED`
    VersionNotSupported,
    /// `E_SEQUENCE_NUMBER`
    SequenceNumber,
    /// `E_CONNECTION_ID`
    ConnectionId,
    /// `E_CONNECTION_TYPE`
    ConnectionType,
    /// `E_CONNECTION_OPTION`
    ConnectionOption,
    /// `E_NO_MORE_CONNECTIONS`
    NoMoreConnections,
    /// `E_DATA_CONNECTION`
    DataConnection,
    /// `E_KNX_CONNECTION`
    KnxConnection,
    /// `E_TUNNELLING_LAYER`
    TunnellingLayer,
    /// Any other value
    Unknown(u8),
}

impl Status {
    /// Decode a status byte
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0x00 => Self::NoError,
            0x01 => Self::HostProtocolType,
            0x02 => Self::VersionNotSupported,
            0x04 => Self::SequenceNumber,
            0x21 => Self::ConnectionId,
            0x22 => Self::ConnectionType,
            0x23 => Self::ConnectionOption,
            0x24 => Self::NoMoreConnections,
            0x26 => Self::DataConnection,
            0x27 => Self::KnxConnection,
            0x29 => Self::TunnellingLayer,
            other => Self::Unknown(other),
        }
    }

    /// Encode to the wire byte
    pub const fn to_u8(self) -> u8 {
        match self {
            Self::NoError => 0x00,
            Self::HostProtocolType => 0x01,
            Self::VersionNotSupported => 0x02,
            Self::SequenceNumber => 0x04,
            Self::ConnectionId => 0x21,
            Self::ConnectionType => 0x22,
            Self::ConnectionOption => 0x23,
            Self::NoMoreConnections => 0x24,
            Self::DataConnection => 0x26,
            Self::KnxConnection => 0x27,
            Self::TunnellingLayer => 0x29,
            Self::Unknown(other) => other,
        }
    }

    /// `true` for `E_NO_ERROR`
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::NoError)
    }

    /// Human-readable description
    pub const fn description(self) -> &'static str {
        match self {
            Self::NoError => "no error",
            Self::HostProtocolType => "host protocol type not supported",
            Self::VersionNotSupported => "protocol version not supported",
            Self::SequenceNumber => "sequence number out of order",
            Self::ConnectionId => "no active connection with the given channel id",
            Self::ConnectionType => "connection type not supported",
            Self::ConnectionOption => "connection options not supported",
            Self::NoMoreConnections => "server cannot accept more connections",
            Self::DataConnection => "error in the data connection",
            Self::KnxConnection => "error in the KNX connection",
            Self::TunnellingLayer => "tunneling layer not supported",
            Self::Unknown(_) => "unknown error",
        }
    }
}

impl From<u8> for Status {
    fn from(value: u8) -> Self {
        Self::from_u8(value)
    }
}

impl From<Status> for u8 {
    fn from(status: Status) -> u8 {
        status.to_u8()
    }
}
