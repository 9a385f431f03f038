//! KNXnet/IP frame parsing and encoding.
//!
//! This module holds the structures every service frame is built from:
//! the common header, the owned generic [`Frame`], the HPAI endpoint
//! structure and the connection header of data-carrying frames.
//!
//! ## Frame Structure
//!
//! ```text
//! ┌─────────────────────────────┐
//! │  Header (6 bytes)           │
//! │  - Header Length: 0x06      │
//! │  - Protocol Version: 0x10   │
//! │  - Service Type: 2 bytes    │
//! │  - Total Length: 2 bytes    │
//! ├─────────────────────────────┤
//! │  Body (variable)            │
//! │  - Service-specific data    │
//! └─────────────────────────────┘
//! ```
//!
//! All decoders follow the same contract: `decode(data, offset)` returns the
//! value plus the number of bytes consumed, or an error when too few bytes
//! remain or a structural field is out of range. Encoders are infallible for
//! well-formed values.

use core::net::Ipv4Addr;

use crate::error::{KnxError, Result};
use crate::net::Endpoint;
use crate::protocol::constants::{
    ServiceType, HEADER_SIZE_10, IPV4_TCP, IPV4_UDP, KNXNETIP_VERSION_10, MAX_FRAME_SIZE,
};

/// Owned buffer holding one encoded frame.
pub type FrameBuffer = heapless::Vec<u8, MAX_FRAME_SIZE>;

/// Largest body a [`Frame`] can carry.
pub const MAX_BODY_SIZE: usize = MAX_FRAME_SIZE - KnxnetIpHeader::SIZE;

/// Returns `data[offset..offset + len]` or a buffer-too-small error.
fn window(data: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    offset
        .checked_add(len)
        .and_then(|end| data.get(offset..end))
        .ok_or_else(KnxError::buffer_too_small)
}

/// KNXnet/IP frame header (6 bytes)
///
/// ```text
/// ┌──────────────┬──────────────┬─────────────────────┐
/// │ Header Len   │ Protocol Ver │  Service Type ID    │
/// │   (1 byte)   │   (1 byte)   │     (2 bytes)       │
/// ├──────────────┴──────────────┴─────────────────────┤
/// │           Total Length (2 bytes)                   │
/// └────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct KnxnetIpHeader {
    /// Protocol version (0x10 for v1.0)
    pub protocol_version: u8,
    /// Service type identifier
    pub service_type: ServiceType,
    /// Total length of frame (header + body)
    pub total_length: u16,
}

impl KnxnetIpHeader {
    /// Size of the header in bytes
    pub const SIZE: usize = 6;

    /// Create a version 1.0 header for a body of `body_length` bytes
    pub const fn new(service_type: ServiceType, body_length: u16) -> Self {
        Self {
            protocol_version: KNXNETIP_VERSION_10,
            service_type,
            total_length: Self::SIZE as u16 + body_length,
        }
    }

    /// Decode a header at `offset`.
    ///
    /// The protocol version is not checked here; the connection engine
    /// filters versions against its configuration.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Buffer is too small
    /// - Header length is not 6
    /// - Service type is unknown
    /// - Total length is shorter than the header itself
    pub fn decode(data: &[u8], offset: usize) -> Result<(Self, usize)> {
        let bytes = window(data, offset, Self::SIZE)?;

        if bytes[0] != HEADER_SIZE_10 {
            return Err(KnxError::invalid_frame());
        }

        let service_type = ServiceType::from_u16(u16::from_be_bytes([bytes[2], bytes[3]]))
            .ok_or_else(KnxError::unsupported_service_type)?;
        let total_length = u16::from_be_bytes([bytes[4], bytes[5]]);

        if usize::from(total_length) < Self::SIZE {
            return Err(KnxError::invalid_frame());
        }

        let header = Self {
            protocol_version: bytes[1],
            service_type,
            total_length,
        };
        Ok((header, Self::SIZE))
    }

    /// Encode the header
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let service = self.service_type.to_u16().to_be_bytes();
        let total = self.total_length.to_be_bytes();
        [
            HEADER_SIZE_10,
            self.protocol_version,
            service[0],
            service[1],
            total[0],
            total[1],
        ]
    }

    /// Get the expected body length from the header
    pub const fn body_length(&self) -> u16 {
        self.total_length.saturating_sub(Self::SIZE as u16)
    }
}

/// Generic KNXnet/IP frame with an owned body.
///
/// Builders append to the body without failing; a body that overflows the
/// frame capacity marks the frame invalid instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    protocol_version: u8,
    service_type: ServiceType,
    body: heapless::Vec<u8, MAX_BODY_SIZE>,
    overflow: bool,
}

impl Frame {
    /// Create an empty version 1.0 frame
    pub fn new(service_type: ServiceType) -> Self {
        Self {
            protocol_version: KNXNETIP_VERSION_10,
            service_type,
            body: heapless::Vec::new(),
            overflow: false,
        }
    }

    /// Append bytes to the body
    pub fn push(&mut self, bytes: &[u8]) -> &mut Self {
        if self.body.extend_from_slice(bytes).is_err() {
            self.overflow = true;
        }
        self
    }

    /// Builder-style [`push`](Self::push)
    #[must_use]
    pub fn with(mut self, bytes: &[u8]) -> Self {
        self.push(bytes);
        self
    }

    /// Decode a complete frame.
    ///
    /// Trailing bytes beyond the header's total length are ignored.
    ///
    /// # Errors
    ///
    /// Returns error if the header is invalid, the datagram is shorter than
    /// the advertised total length, or the body does not fit.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let (header, offset) = KnxnetIpHeader::decode(data, 0)?;
        let body = window(data, offset, usize::from(header.body_length()))
            .map_err(|_| KnxError::invalid_frame())?;

        Ok(Self {
            protocol_version: header.protocol_version,
            service_type: header.service_type,
            body: heapless::Vec::from_slice(body).map_err(|_| KnxError::payload_too_large())?,
            overflow: false,
        })
    }

    /// Encode header and body.
    ///
    /// # Errors
    ///
    /// Returns `PayloadTooLarge` if the body overflowed while building.
    pub fn encode(&self) -> Result<FrameBuffer> {
        if self.overflow {
            return Err(KnxError::payload_too_large());
        }

        let mut buf = FrameBuffer::new();
        buf.extend_from_slice(&self.header().to_bytes())
            .and_then(|()| buf.extend_from_slice(&self.body))
            .map_err(|_| KnxError::payload_too_large())?;
        Ok(buf)
    }

    /// Header describing this frame
    pub fn header(&self) -> KnxnetIpHeader {
        KnxnetIpHeader {
            protocol_version: self.protocol_version,
            service_type: self.service_type,
            total_length: self.total_length(),
        }
    }

    /// Service type of this frame
    #[inline]
    pub const fn service_type(&self) -> ServiceType {
        self.service_type
    }

    /// Protocol version of this frame
    #[inline]
    pub const fn protocol_version(&self) -> u8 {
        self.protocol_version
    }

    /// Frame body (everything after the header)
    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Header plus body length
    pub fn total_length(&self) -> u16 {
        (KnxnetIpHeader::SIZE + self.body.len()) as u16
    }

    /// `false` when a builder overflowed the body
    pub const fn is_valid(&self) -> bool {
        !self.overflow
    }
}

/// Host Protocol Address Information (HPAI)
///
/// Structure containing endpoint information (IP address and port).
///
/// ```text
/// ┌──────────────┬──────────────┬─────────────────────┐
/// │ Structure Len│ Host Protocol│   IP Address        │
/// │   (1 byte)   │   (1 byte)   │   (4 bytes IPv4)    │
/// ├──────────────┴──────────────┴─────────────────────┤
/// │                Port (2 bytes)                      │
/// └────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hpai {
    /// Host protocol code (`IPV4_UDP` or `IPV4_TCP`)
    pub host_protocol: u8,
    /// IPv4 address
    pub address: Ipv4Addr,
    /// Port
    pub port: u16,
}

impl Hpai {
    /// Size of HPAI structure for IPv4
    pub const SIZE: usize = 8;

    /// Create a UDP/IPv4 HPAI for `endpoint`
    pub const fn udp(endpoint: Endpoint) -> Self {
        Self {
            host_protocol: IPV4_UDP,
            address: *endpoint.ip(),
            port: endpoint.port(),
        }
    }

    /// Decode an HPAI at `offset`.
    ///
    /// # Errors
    ///
    /// Returns error if fewer than 8 bytes remain, the structure length is
    /// not 8, or the host protocol code is neither UDP nor TCP.
    pub fn decode(data: &[u8], offset: usize) -> Result<(Self, usize)> {
        let bytes = window(data, offset, Self::SIZE)?;

        if bytes[0] != Self::SIZE as u8 {
            return Err(KnxError::invalid_frame());
        }

        let host_protocol = bytes[1];
        if host_protocol != IPV4_UDP && host_protocol != IPV4_TCP {
            return Err(KnxError::unsupported_host_protocol());
        }

        let hpai = Self {
            host_protocol,
            address: Ipv4Addr::new(bytes[2], bytes[3], bytes[4], bytes[5]),
            port: u16::from_be_bytes([bytes[6], bytes[7]]),
        };
        Ok((hpai, Self::SIZE))
    }

    /// Encode the HPAI
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let ip = self.address.octets();
        let port = self.port.to_be_bytes();
        [
            Self::SIZE as u8,
            self.host_protocol,
            ip[0],
            ip[1],
            ip[2],
            ip[3],
            port[0],
            port[1],
        ]
    }

    /// Endpoint named by this HPAI
    pub const fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.address, self.port)
    }

    /// Whether the host protocol is UDP/IPv4
    pub const fn is_udp(&self) -> bool {
        self.host_protocol == IPV4_UDP
    }
}

/// Connection header of tunneling and device-management frames
///
/// ```text
/// ┌──────────────┬──────────────┬──────────────┬──────────────┐
/// │ Structure Len│  Channel ID  │ Sequence Ctr │ Status/Rsvd  │
/// │   (0x04)     │   (1 byte)   │   (1 byte)   │   (1 byte)   │
/// └──────────────┴──────────────┴──────────────┴──────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnectionHeader {
    /// Communication channel ID
    pub channel_id: u8,
    /// Sequence counter
    pub sequence_counter: u8,
    /// Service-specific byte (status in acknowledges, reserved in requests)
    pub service_type_specific: u8,
}

impl ConnectionHeader {
    /// Size of the connection header
    pub const SIZE: usize = 4;

    /// Create a connection header with a zero service-specific byte
    pub const fn new(channel_id: u8, sequence_counter: u8) -> Self {
        Self {
            channel_id,
            sequence_counter,
            service_type_specific: 0,
        }
    }

    /// Decode a connection header at `offset`.
    ///
    /// # Errors
    ///
    /// Returns error if fewer than 4 bytes remain or the structure length
    /// is not 4.
    pub fn decode(data: &[u8], offset: usize) -> Result<(Self, usize)> {
        let bytes = window(data, offset, Self::SIZE)?;

        if bytes[0] != Self::SIZE as u8 {
            return Err(KnxError::invalid_frame());
        }

        let header = Self {
            channel_id: bytes[1],
            sequence_counter: bytes[2],
            service_type_specific: bytes[3],
        };
        Ok((header, Self::SIZE))
    }

    /// Encode the connection header
    pub const fn to_bytes(&self) -> [u8; Self::SIZE] {
        [
            Self::SIZE as u8,
            self.channel_id,
            self.sequence_counter,
            self.service_type_specific,
        ]
    }
}
