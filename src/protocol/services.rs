//! KNXnet/IP service frame builders and readers.
//!
//! Every service used by a connection-oriented session has a typed struct
//! here. Each struct offers:
//!
//! - `to_frame()`: an infallible builder producing a generic [`Frame`],
//! - `parse(&Frame)`: a reader checking the service tag and the exact or
//!   minimum body size before exposing typed fields,
//! - `is_valid(&Frame)`: the validity predicate behind `parse`.
//!
//! [`ServiceFrame`] closes the set: a single decode entry point matches the
//! header's service type and returns the typed frame.
//!
//! ## Protocol Flow
//!
//! ```text
//! Client                          Server
//!   |                                |
//!   |------- CONNECT_REQUEST ------->|   control endpoint
//!   |<------ CONNECT_RESPONSE -------|
//!   |                                |
//!   |--- CONNECTIONSTATE_REQUEST --->|   control endpoint (every 60s)
//!   |<-- CONNECTIONSTATE_RESPONSE ---|
//!   |                                |
//!   |------ TUNNELLING_REQUEST ----->|   data endpoint
//!   |<------ TUNNELLING_ACK ---------|
//!   |                                |
//!   |------ DISCONNECT_REQUEST ----->|   control endpoint
//!   |<----- DISCONNECT_RESPONSE -----|
//! ```

use crate::error::{KnxError, Result};
use crate::net::NAT_PLACEHOLDER;
use crate::protocol::constants::{ServiceType, Status, MAX_CEMI_SIZE, MAX_CONNECTION_INFO_SIZE};
use crate::protocol::frame::{ConnectionHeader, Frame, Hpai};

/// CRI or CRD bytes, including the leading structure length.
pub type ConnectionInfo = heapless::Vec<u8, MAX_CONNECTION_INFO_SIZE>;

/// Owned cEMI frame bytes.
pub type Cemi = heapless::Vec<u8, MAX_CEMI_SIZE>;

fn expect_service(frame: &Frame, service_type: ServiceType) -> Result<()> {
    if frame.service_type() == service_type {
        Ok(())
    } else {
        Err(KnxError::invalid_frame())
    }
}

/// Validate a CRI/CRD block: its first byte is its own length.
fn connection_info(bytes: &[u8]) -> Result<ConnectionInfo> {
    match bytes.first() {
        Some(&len) if len >= 2 && usize::from(len) == bytes.len() => {
            ConnectionInfo::from_slice(bytes).map_err(|_| KnxError::invalid_frame())
        }
        _ => Err(KnxError::invalid_frame()),
    }
}

/// Channel id, status/reserved byte and optional HPAI shared by several bodies.
fn channel_and_hpai(body: &[u8]) -> Result<(u8, u8, Hpai)> {
    if body.len() != 2 + Hpai::SIZE {
        return Err(KnxError::invalid_frame());
    }
    let (hpai, _) = Hpai::decode(body, 2)?;
    Ok((body[0], body[1], hpai))
}

fn channel_and_status(body: &[u8]) -> Result<(u8, Status)> {
    match *body {
        [channel_id, status] => Ok((channel_id, Status::from_u8(status))),
        _ => Err(KnxError::invalid_frame()),
    }
}

// =============================================================================
// Connect
// =============================================================================

/// `CONNECT_REQUEST` service (0x0205)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Control endpoint (for connection management)
    pub control_endpoint: Hpai,
    /// Data endpoint (for tunneling data)
    pub data_endpoint: Hpai,
    /// Connection request information
    pub cri: ConnectionInfo,
}

impl ConnectRequest {
    /// Create a new `CONNECT_REQUEST`
    pub const fn new(control_endpoint: Hpai, data_endpoint: Hpai, cri: ConnectionInfo) -> Self {
        Self {
            control_endpoint,
            data_endpoint,
            cri,
        }
    }

    /// Build the generic frame
    pub fn to_frame(&self) -> Frame {
        Frame::new(ServiceType::ConnectRequest)
            .with(&self.control_endpoint.to_bytes())
            .with(&self.data_endpoint.to_bytes())
            .with(&self.cri)
    }

    /// Read a `CONNECT_REQUEST` frame
    pub fn parse(frame: &Frame) -> Result<Self> {
        expect_service(frame, ServiceType::ConnectRequest)?;
        let body = frame.body();
        let (control_endpoint, used) = Hpai::decode(body, 0)?;
        let (data_endpoint, more) = Hpai::decode(body, used)?;
        let cri = connection_info(&body[used + more..])?;
        Ok(Self::new(control_endpoint, data_endpoint, cri))
    }

    /// Validity predicate for [`parse`](Self::parse)
    pub fn is_valid(frame: &Frame) -> bool {
        Self::parse(frame).is_ok()
    }
}

/// `CONNECT_RESPONSE` service (0x0206)
///
/// A rejecting server may omit or truncate the data endpoint and CRD; the
/// missing parts read as `0.0.0.0:0` and an empty CRD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResponse {
    /// Communication channel ID
    pub channel_id: u8,
    /// Status reported by the server
    pub status: Status,
    /// Data endpoint assigned by server
    pub data_endpoint: Hpai,
    /// Connection response data
    pub crd: ConnectionInfo,
}

impl ConnectResponse {
    /// Create a new `CONNECT_RESPONSE`
    pub const fn new(channel_id: u8, status: Status, data_endpoint: Hpai, crd: ConnectionInfo) -> Self {
        Self {
            channel_id,
            status,
            data_endpoint,
            crd,
        }
    }

    /// Build the generic frame
    pub fn to_frame(&self) -> Frame {
        let mut frame = Frame::new(ServiceType::ConnectResponse);
        frame.push(&[self.channel_id, self.status.to_u8()]);
        if self.status.is_ok() || !self.crd.is_empty() {
            frame.push(&self.data_endpoint.to_bytes()).push(&self.crd);
        }
        frame
    }

    /// Read a `CONNECT_RESPONSE` frame
    pub fn parse(frame: &Frame) -> Result<Self> {
        expect_service(frame, ServiceType::ConnectResponse)?;
        let body = frame.body();
        let (&channel_id, rest) = body.split_first().ok_or_else(KnxError::invalid_frame)?;
        let (&status, rest) = rest.split_first().ok_or_else(KnxError::invalid_frame)?;
        let status = Status::from_u8(status);

        // A rejection only has to carry its status; keep what else decodes.
        if !status.is_ok() {
            let (data_endpoint, used) = Hpai::decode(rest, 0).unwrap_or((Hpai::udp(NAT_PLACEHOLDER), 0));
            let crd = connection_info(&rest[used..]).unwrap_or_default();
            return Ok(Self::new(channel_id, status, data_endpoint, crd));
        }

        let (data_endpoint, used) = Hpai::decode(rest, 0)?;
        let crd = connection_info(&rest[used..])?;
        Ok(Self::new(channel_id, status, data_endpoint, crd))
    }

    /// Validity predicate for [`parse`](Self::parse)
    pub fn is_valid(frame: &Frame) -> bool {
        Self::parse(frame).is_ok()
    }
}

// =============================================================================
// Connection state (heartbeat)
// =============================================================================

/// `CONNECTIONSTATE_REQUEST` service (0x0207)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStateRequest {
    /// Communication channel ID
    pub channel_id: u8,
    /// Control endpoint
    pub control_endpoint: Hpai,
}

impl ConnectionStateRequest {
    /// Create a new `CONNECTIONSTATE_REQUEST`
    pub const fn new(channel_id: u8, control_endpoint: Hpai) -> Self {
        Self {
            channel_id,
            control_endpoint,
        }
    }

    /// Build the generic frame
    pub fn to_frame(&self) -> Frame {
        Frame::new(ServiceType::ConnectionStateRequest)
            .with(&[self.channel_id, 0x00])
            .with(&self.control_endpoint.to_bytes())
    }

    /// Read a `CONNECTIONSTATE_REQUEST` frame
    pub fn parse(frame: &Frame) -> Result<Self> {
        expect_service(frame, ServiceType::ConnectionStateRequest)?;
        let (channel_id, _, control_endpoint) = channel_and_hpai(frame.body())?;
        Ok(Self::new(channel_id, control_endpoint))
    }

    /// Validity predicate for [`parse`](Self::parse)
    pub fn is_valid(frame: &Frame) -> bool {
        Self::parse(frame).is_ok()
    }
}

/// `CONNECTIONSTATE_RESPONSE` service (0x0208)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStateResponse {
    /// Communication channel ID
    pub channel_id: u8,
    /// Status reported by the server
    pub status: Status,
}

impl ConnectionStateResponse {
    /// Create a new `CONNECTIONSTATE_RESPONSE`
    pub const fn new(channel_id: u8, status: Status) -> Self {
        Self { channel_id, status }
    }

    /// Build the generic frame
    pub fn to_frame(&self) -> Frame {
        Frame::new(ServiceType::ConnectionStateResponse).with(&[self.channel_id, self.status.to_u8()])
    }

    /// Read a `CONNECTIONSTATE_RESPONSE` frame
    pub fn parse(frame: &Frame) -> Result<Self> {
        expect_service(frame, ServiceType::ConnectionStateResponse)?;
        let (channel_id, status) = channel_and_status(frame.body())?;
        Ok(Self::new(channel_id, status))
    }

    /// Validity predicate for [`parse`](Self::parse)
    pub fn is_valid(frame: &Frame) -> bool {
        Self::parse(frame).is_ok()
    }
}

// =============================================================================
// Disconnect
// =============================================================================

/// `DISCONNECT_REQUEST` service (0x0209)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectRequest {
    /// Communication channel ID
    pub channel_id: u8,
    /// Control endpoint
    pub control_endpoint: Hpai,
}

impl DisconnectRequest {
    /// Create a new `DISCONNECT_REQUEST`
    pub const fn new(channel_id: u8, control_endpoint: Hpai) -> Self {
        Self {
            channel_id,
            control_endpoint,
        }
    }

    /// Build the generic frame
    pub fn to_frame(&self) -> Frame {
        Frame::new(ServiceType::DisconnectRequest)
            .with(&[self.channel_id, 0x00])
            .with(&self.control_endpoint.to_bytes())
    }

    /// Read a `DISCONNECT_REQUEST` frame
    pub fn parse(frame: &Frame) -> Result<Self> {
        expect_service(frame, ServiceType::DisconnectRequest)?;
        let (channel_id, _, control_endpoint) = channel_and_hpai(frame.body())?;
        Ok(Self::new(channel_id, control_endpoint))
    }

    /// Validity predicate for [`parse`](Self::parse)
    pub fn is_valid(frame: &Frame) -> bool {
        Self::parse(frame).is_ok()
    }
}

/// `DISCONNECT_RESPONSE` service (0x020A)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectResponse {
    /// Communication channel ID
    pub channel_id: u8,
    /// Status reported by the peer
    pub status: Status,
}

impl DisconnectResponse {
    /// Create a new `DISCONNECT_RESPONSE`
    pub const fn new(channel_id: u8, status: Status) -> Self {
        Self { channel_id, status }
    }

    /// Build the generic frame
    pub fn to_frame(&self) -> Frame {
        Frame::new(ServiceType::DisconnectResponse).with(&[self.channel_id, self.status.to_u8()])
    }

    /// Read a `DISCONNECT_RESPONSE` frame
    pub fn parse(frame: &Frame) -> Result<Self> {
        expect_service(frame, ServiceType::DisconnectResponse)?;
        let (channel_id, status) = channel_and_status(frame.body())?;
        Ok(Self::new(channel_id, status))
    }

    /// Validity predicate for [`parse`](Self::parse)
    pub fn is_valid(frame: &Frame) -> bool {
        Self::parse(frame).is_ok()
    }
}

// =============================================================================
// Data exchange (tunneling / device configuration)
// =============================================================================

/// Request/acknowledge pair used to carry cEMI frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DataService {
    /// `TUNNELLING_REQUEST` / `TUNNELLING_ACK`
    Tunnelling,
    /// `DEVICE_CONFIGURATION_REQUEST` / `DEVICE_CONFIGURATION_ACK`
    DeviceConfiguration,
}

impl DataService {
    /// Service type of the request frame
    pub const fn request_type(self) -> ServiceType {
        match self {
            Self::Tunnelling => ServiceType::TunnellingRequest,
            Self::DeviceConfiguration => ServiceType::DeviceConfigurationRequest,
        }
    }

    /// Service type of the acknowledge frame
    pub const fn ack_type(self) -> ServiceType {
        match self {
            Self::Tunnelling => ServiceType::TunnellingAck,
            Self::DeviceConfiguration => ServiceType::DeviceConfigurationAck,
        }
    }

    /// Service whose request frame has type `service_type`
    pub const fn from_request(service_type: ServiceType) -> Option<Self> {
        match service_type {
            ServiceType::TunnellingRequest => Some(Self::Tunnelling),
            ServiceType::DeviceConfigurationRequest => Some(Self::DeviceConfiguration),
            _ => None,
        }
    }

    /// Service whose acknowledge frame has type `service_type`
    pub const fn from_ack(service_type: ServiceType) -> Option<Self> {
        match service_type {
            ServiceType::TunnellingAck => Some(Self::Tunnelling),
            ServiceType::DeviceConfigurationAck => Some(Self::DeviceConfiguration),
            _ => None,
        }
    }
}

/// `TUNNELLING_REQUEST` (0x0420) or `DEVICE_CONFIGURATION_REQUEST` (0x0310)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRequest {
    /// Which request frame this is
    pub service: DataService,
    /// Connection header
    pub connection_header: ConnectionHeader,
    /// cEMI frame data
    pub cemi: Cemi,
}

impl DataRequest {
    /// Create a new data request
    pub const fn new(service: DataService, channel_id: u8, sequence_counter: u8, cemi: Cemi) -> Self {
        Self {
            service,
            connection_header: ConnectionHeader::new(channel_id, sequence_counter),
            cemi,
        }
    }

    /// Build the generic frame
    pub fn to_frame(&self) -> Frame {
        Frame::new(self.service.request_type())
            .with(&self.connection_header.to_bytes())
            .with(&self.cemi)
    }

    /// Read a tunnelling or device configuration request
    pub fn parse(frame: &Frame) -> Result<Self> {
        let service = DataService::from_request(frame.service_type()).ok_or_else(KnxError::invalid_frame)?;
        let body = frame.body();
        let (connection_header, used) = ConnectionHeader::decode(body, 0)?;
        let cemi = Cemi::from_slice(&body[used..]).map_err(|_| KnxError::payload_too_large())?;
        Ok(Self {
            service,
            connection_header,
            cemi,
        })
    }

    /// Validity predicate for [`parse`](Self::parse)
    pub fn is_valid(frame: &Frame) -> bool {
        Self::parse(frame).is_ok()
    }

    /// Communication channel ID
    pub const fn channel_id(&self) -> u8 {
        self.connection_header.channel_id
    }

    /// Sequence counter
    pub const fn sequence_counter(&self) -> u8 {
        self.connection_header.sequence_counter
    }
}

/// `TUNNELLING_ACK` (0x0421) or `DEVICE_CONFIGURATION_ACK` (0x0311)
///
/// The connection header's last byte carries the status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataAck {
    /// Which acknowledge frame this is
    pub service: DataService,
    /// Connection header
    pub connection_header: ConnectionHeader,
}

impl DataAck {
    /// Create a new acknowledge
    pub const fn new(service: DataService, channel_id: u8, sequence_counter: u8, status: Status) -> Self {
        Self {
            service,
            connection_header: ConnectionHeader {
                channel_id,
                sequence_counter,
                service_type_specific: status.to_u8(),
            },
        }
    }

    /// Build the generic frame
    pub fn to_frame(&self) -> Frame {
        Frame::new(self.service.ack_type()).with(&self.connection_header.to_bytes())
    }

    /// Read a tunnelling or device configuration acknowledge
    pub fn parse(frame: &Frame) -> Result<Self> {
        let service = DataService::from_ack(frame.service_type()).ok_or_else(KnxError::invalid_frame)?;
        let body = frame.body();
        if body.len() != ConnectionHeader::SIZE {
            return Err(KnxError::invalid_frame());
        }
        let (connection_header, _) = ConnectionHeader::decode(body, 0)?;
        Ok(Self {
            service,
            connection_header,
        })
    }

    /// Validity predicate for [`parse`](Self::parse)
    pub fn is_valid(frame: &Frame) -> bool {
        Self::parse(frame).is_ok()
    }

    /// Communication channel ID
    pub const fn channel_id(&self) -> u8 {
        self.connection_header.channel_id
    }

    /// Sequence counter
    pub const fn sequence_counter(&self) -> u8 {
        self.connection_header.sequence_counter
    }

    /// Status reported by the receiver
    pub const fn status(&self) -> Status {
        Status::from_u8(self.connection_header.service_type_specific)
    }
}

// =============================================================================
// Closed set of service frames
// =============================================================================

/// Any service frame a connection-oriented session exchanges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceFrame {
    /// `CONNECT_REQUEST`
    ConnectRequest(ConnectRequest),
    /// `CONNECT_RESPONSE`
    ConnectResponse(ConnectResponse),
    /// `CONNECTIONSTATE_REQUEST`
    ConnectionStateRequest(ConnectionStateRequest),
    /// `CONNECTIONSTATE_RESPONSE`
    ConnectionStateResponse(ConnectionStateResponse),
    /// `DISCONNECT_REQUEST`
    DisconnectRequest(DisconnectRequest),
    /// `DISCONNECT_RESPONSE`
    DisconnectResponse(DisconnectResponse),
    /// `TUNNELLING_REQUEST` or `DEVICE_CONFIGURATION_REQUEST`
    DataRequest(DataRequest),
    /// `TUNNELLING_ACK` or `DEVICE_CONFIGURATION_ACK`
    DataAck(DataAck),
}

impl ServiceFrame {
    /// Decode a datagram into a typed service frame.
    ///
    /// # Errors
    ///
    /// Returns error if the header is invalid, the service type is unknown,
    /// or the body does not match the service's layout.
    pub fn decode(data: &[u8]) -> Result<Self> {
        Self::from_frame(&Frame::decode(data)?)
    }

    /// Interpret an already decoded generic frame
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        Ok(match frame.service_type() {
            ServiceType::ConnectRequest => Self::ConnectRequest(ConnectRequest::parse(frame)?),
            ServiceType::ConnectResponse => Self::ConnectResponse(ConnectResponse::parse(frame)?),
            ServiceType::ConnectionStateRequest => {
                Self::ConnectionStateRequest(ConnectionStateRequest::parse(frame)?)
            }
            ServiceType::ConnectionStateResponse => {
                Self::ConnectionStateResponse(ConnectionStateResponse::parse(frame)?)
            }
            ServiceType::DisconnectRequest => Self::DisconnectRequest(DisconnectRequest::parse(frame)?),
            ServiceType::DisconnectResponse => Self::DisconnectResponse(DisconnectResponse::parse(frame)?),
            ServiceType::TunnellingRequest | ServiceType::DeviceConfigurationRequest => {
                Self::DataRequest(DataRequest::parse(frame)?)
            }
            ServiceType::TunnellingAck | ServiceType::DeviceConfigurationAck => {
                Self::DataAck(DataAck::parse(frame)?)
            }
        })
    }

    /// Build the generic frame
    pub fn to_frame(&self) -> Frame {
        match self {
            Self::ConnectRequest(f) => f.to_frame(),
            Self::ConnectResponse(f) => f.to_frame(),
            Self::ConnectionStateRequest(f) => f.to_frame(),
            Self::ConnectionStateResponse(f) => f.to_frame(),
            Self::DisconnectRequest(f) => f.to_frame(),
            Self::DisconnectResponse(f) => f.to_frame(),
            Self::DataRequest(f) => f.to_frame(),
            Self::DataAck(f) => f.to_frame(),
        }
    }

    /// Service type of this frame
    pub const fn service_type(&self) -> ServiceType {
        match self {
            Self::ConnectRequest(_) => ServiceType::ConnectRequest,
            Self::ConnectResponse(_) => ServiceType::ConnectResponse,
            Self::ConnectionStateRequest(_) => ServiceType::ConnectionStateRequest,
            Self::ConnectionStateResponse(_) => ServiceType::ConnectionStateResponse,
            Self::DisconnectRequest(_) => ServiceType::DisconnectRequest,
            Self::DisconnectResponse(_) => ServiceType::DisconnectResponse,
            Self::DataRequest(f) => f.service.request_type(),
            Self::DataAck(f) => f.service.ack_type(),
        }
    }
}
