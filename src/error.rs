//! Error types for KNXnet/IP connections.
//!
//! Two layers of errors exist:
//!
//! - [`KnxError`] is returned by codecs and API calls through [`Result`].
//!   It carries a structured kind and, when `std` is enabled, a backtrace.
//! - [`ErrorCode`] is the error the connection engine records when a session
//!   fails. It is surfaced through engine events rather than returned.

use core::fmt;

#[cfg(feature = "std")]
use std::backtrace::Backtrace;

/// Result type alias for KNX operations.
pub type Result<T> = core::result::Result<T, KnxError>;

// =============================================================================
// Error Kind Enums (Internal)
// =============================================================================

/// Protocol error variants (internal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum ProtocolErrorKind {
    InvalidFrame,
    UnsupportedServiceType,
    UnsupportedHostProtocol,
    PayloadTooLarge,
    InvalidAddress,
}

/// Connection error variants (internal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum ConnectionErrorKind {
    NotIpv4,
    NotConnected,
    AlreadyConnected,
    AwaitingAcknowledge,
    OutboxFull,
    Closed,
}

/// Transport error variants (internal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum TransportErrorKind {
    BindFailed,
    SendFailed,
    ReceiveFailed,
    BufferTooSmall,
}

// =============================================================================
// Main Error Type
// =============================================================================

/// KNX error returned by codecs and connection API calls.
#[derive(Debug)]
pub enum KnxError {
    /// Frame decoding/encoding errors
    Protocol(ProtocolError),
    /// Errors from connection operations (connect, send, disconnect)
    Connection(ConnectionError),
    /// Socket errors
    Transport(TransportError),
    /// Operation is not valid in the current engine state
    InvalidState,
}

/// Protocol error with optional backtrace
#[derive(Debug)]
pub struct ProtocolError {
    kind: ProtocolErrorKind,
    #[cfg(feature = "std")]
    backtrace: Backtrace,
}

impl ProtocolError {
    /// Backtrace captured where the error was created
    #[cfg(feature = "std")]
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub(crate) fn new(kind: ProtocolErrorKind) -> Self {
        Self {
            kind,
            #[cfg(feature = "std")]
            backtrace: Backtrace::capture(),
        }
    }

    /// Check if this is an invalid frame error
    pub fn is_invalid_frame(&self) -> bool {
        matches!(self.kind, ProtocolErrorKind::InvalidFrame)
    }

    /// Check if the service type identifier is unknown
    pub fn is_unsupported_service_type(&self) -> bool {
        matches!(self.kind, ProtocolErrorKind::UnsupportedServiceType)
    }

    /// Check if a payload exceeded the frame capacity
    pub fn is_payload_too_large(&self) -> bool {
        matches!(self.kind, ProtocolErrorKind::PayloadTooLarge)
    }

    /// Check if an individual address could not be parsed
    pub fn is_invalid_address(&self) -> bool {
        matches!(self.kind, ProtocolErrorKind::InvalidAddress)
    }
}

/// Connection error with optional backtrace
#[derive(Debug)]
pub struct ConnectionError {
    kind: ConnectionErrorKind,
    #[cfg(feature = "std")]
    backtrace: Backtrace,
}

impl ConnectionError {
    /// Backtrace captured where the error was created
    #[cfg(feature = "std")]
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub(crate) fn new(kind: ConnectionErrorKind) -> Self {
        Self {
            kind,
            #[cfg(feature = "std")]
            backtrace: Backtrace::capture(),
        }
    }

    /// Check if a non-IPv4 address was supplied
    pub fn is_not_ipv4(&self) -> bool {
        matches!(self.kind, ConnectionErrorKind::NotIpv4)
    }

    /// Check if the operation required an established connection
    pub fn is_not_connected(&self) -> bool {
        matches!(self.kind, ConnectionErrorKind::NotConnected)
    }

    /// Check if a data frame is still waiting for its acknowledge
    pub fn is_awaiting_acknowledge(&self) -> bool {
        matches!(self.kind, ConnectionErrorKind::AwaitingAcknowledge)
    }

    /// Check if the driver's send queue was full
    pub fn is_outbox_full(&self) -> bool {
        matches!(self.kind, ConnectionErrorKind::OutboxFull)
    }

    /// Check if the connection task is gone
    pub fn is_closed(&self) -> bool {
        matches!(self.kind, ConnectionErrorKind::Closed)
    }
}

/// Transport error with optional backtrace
#[derive(Debug)]
pub struct TransportError {
    kind: TransportErrorKind,
    #[cfg(feature = "std")]
    backtrace: Backtrace,
}

impl TransportError {
    /// Backtrace captured where the error was created
    #[cfg(feature = "std")]
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub(crate) fn new(kind: TransportErrorKind) -> Self {
        Self {
            kind,
            #[cfg(feature = "std")]
            backtrace: Backtrace::capture(),
        }
    }

    /// Check if binding a socket failed
    pub fn is_bind_failed(&self) -> bool {
        matches!(self.kind, TransportErrorKind::BindFailed)
    }

    /// Check if buffer is too small
    pub fn is_buffer_too_small(&self) -> bool {
        matches!(self.kind, TransportErrorKind::BufferTooSmall)
    }
}

// =============================================================================
// Convenience Constructors for KnxError
// =============================================================================

impl KnxError {
    // Protocol errors
    pub(crate) fn invalid_frame() -> Self {
        Self::Protocol(ProtocolError::new(ProtocolErrorKind::InvalidFrame))
    }

    pub(crate) fn unsupported_service_type() -> Self {
        Self::Protocol(ProtocolError::new(ProtocolErrorKind::UnsupportedServiceType))
    }

    pub(crate) fn unsupported_host_protocol() -> Self {
        Self::Protocol(ProtocolError::new(ProtocolErrorKind::UnsupportedHostProtocol))
    }

    pub(crate) fn payload_too_large() -> Self {
        Self::Protocol(ProtocolError::new(ProtocolErrorKind::PayloadTooLarge))
    }

    pub(crate) fn invalid_address() -> Self {
        Self::Protocol(ProtocolError::new(ProtocolErrorKind::InvalidAddress))
    }

    // Connection errors
    pub(crate) fn not_ipv4() -> Self {
        Self::Connection(ConnectionError::new(ConnectionErrorKind::NotIpv4))
    }

    pub(crate) fn not_connected() -> Self {
        Self::Connection(ConnectionError::new(ConnectionErrorKind::NotConnected))
    }

    pub(crate) fn already_connected() -> Self {
        Self::Connection(ConnectionError::new(ConnectionErrorKind::AlreadyConnected))
    }

    pub(crate) fn awaiting_acknowledge() -> Self {
        Self::Connection(ConnectionError::new(ConnectionErrorKind::AwaitingAcknowledge))
    }

    #[cfg(feature = "tokio")]
    pub(crate) fn outbox_full() -> Self {
        Self::Connection(ConnectionError::new(ConnectionErrorKind::OutboxFull))
    }

    #[cfg(feature = "tokio")]
    pub(crate) fn closed() -> Self {
        Self::Connection(ConnectionError::new(ConnectionErrorKind::Closed))
    }

    // Transport errors
    #[cfg(feature = "tokio")]
    pub(crate) fn bind_failed() -> Self {
        Self::Transport(TransportError::new(TransportErrorKind::BindFailed))
    }

    #[cfg(feature = "tokio")]
    pub(crate) fn send_failed() -> Self {
        Self::Transport(TransportError::new(TransportErrorKind::SendFailed))
    }

    #[cfg(feature = "tokio")]
    pub(crate) fn receive_failed() -> Self {
        Self::Transport(TransportError::new(TransportErrorKind::ReceiveFailed))
    }

    pub(crate) fn buffer_too_small() -> Self {
        Self::Transport(TransportError::new(TransportErrorKind::BufferTooSmall))
    }
}

// =============================================================================
// Engine Error Codes
// =============================================================================

/// Error recorded by the connection engine.
///
/// Only `Network`, `NotIpv4`, `Acknowledge`, `Heartbeat`, `Cemi` and
/// `Unknown` end a session. `State` marks an operation that was refused
/// because of the current state and leaves the session untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorCode {
    /// No error
    #[default]
    None,
    /// Operation invalid in the current state
    State,
    /// Socket bind/send/receive failure
    Network,
    /// A non-IPv4 address was supplied
    NotIpv4,
    /// Connect handshake rejected or timed out
    Acknowledge,
    /// Connection-state retry budget exhausted
    Heartbeat,
    /// Data frame acknowledge retry budget exhausted
    Cemi,
    /// Anything else
    Unknown,
}

impl ErrorCode {
    /// Whether this code terminates a session.
    pub const fn is_fatal(self) -> bool {
        !matches!(self, Self::None | Self::State)
    }
}

// =============================================================================
// Display Implementation
// =============================================================================

impl fmt::Display for KnxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KnxError::Protocol(e) => write!(f, "Protocol error: {:?}", e.kind),
            KnxError::Connection(e) => write!(f, "Connection error: {:?}", e.kind),
            KnxError::Transport(e) => write!(f, "Transport error: {:?}", e.kind),
            KnxError::InvalidState => write!(f, "Invalid state"),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ErrorCode::None => "no error",
            ErrorCode::State => "invalid state",
            ErrorCode::Network => "network error",
            ErrorCode::NotIpv4 => "address is not IPv4",
            ErrorCode::Acknowledge => "connect request not acknowledged",
            ErrorCode::Heartbeat => "connection state requests unanswered",
            ErrorCode::Cemi => "data frame not acknowledged",
            ErrorCode::Unknown => "unknown error",
        };
        f.write_str(text)
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for KnxError {
    fn format(&self, f: defmt::Formatter<'_>) {
        match self {
            KnxError::Protocol(e) => defmt::write!(f, "Protocol error: {}", e.kind),
            KnxError::Connection(e) => defmt::write!(f, "Connection error: {}", e.kind),
            KnxError::Transport(e) => defmt::write!(f, "Transport error: {}", e.kind),
            KnxError::InvalidState => defmt::write!(f, "Invalid state"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for KnxError {}
