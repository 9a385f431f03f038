//! Connection configuration.
//!
//! [`ConnectionConfig`] holds the options shared by every connection kind.
//! [`ConnectionKind`] selects the connection type and carries the data
//! exchange parameters that differ between tunneling and device management.
//!
//! ```rust
//! use core::time::Duration;
//! use knx_tunnel::configuration::ConnectionConfig;
//!
//! let config = ConnectionConfig::default()
//!     .with_nat_aware(true)
//!     .with_heartbeat_interval(Some(Duration::from_secs(30)));
//! assert!(config.nat_aware);
//! ```

use core::net::{IpAddr, Ipv4Addr};
use core::time::Duration;

use crate::protocol::constants::{
    CONNECTIONSTATE_REQUEST_TIMEOUT, CONNECT_REQUEST_TIMEOUT, DISCONNECT_REQUEST_TIMEOUT,
    HEARTBEAT_REQUEST_TIME, KNXNETIP_VERSION_10, MAX_CONNECTIONSTATE_REQUESTS,
};
use crate::protocol::services::{ConnectionInfo, DataService};

/// Protocol versions accepted on received frames.
pub type SupportedVersions = heapless::Vec<u8, 4>;

/// Options consumed by the connection engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Address both sockets bind to
    pub local_address: IpAddr,
    /// Port of the control socket (0 = ephemeral); the data socket always
    /// uses an ephemeral port
    pub local_port: u16,
    /// Advertise `0.0.0.0:0` and trust datagram source addresses
    pub nat_aware: bool,
    /// Pause between successful heartbeats; `None` disables periodic heartbeats
    pub heartbeat_interval: Option<Duration>,
    /// Time to wait for a `CONNECT_RESPONSE`
    pub connect_request_timeout: Duration,
    /// Time to wait for each `CONNECTIONSTATE_RESPONSE`
    pub connection_state_request_timeout: Duration,
    /// Unanswered connection-state requests tolerated before giving up
    pub max_connection_state_requests: u8,
    /// Time to wait for a `DISCONNECT_RESPONSE`
    pub disconnect_request_timeout: Duration,
    /// Protocol versions accepted on received frames
    pub supported_versions: SupportedVersions,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        let mut supported_versions = SupportedVersions::new();
        // Capacity is 4, a single push cannot fail.
        let _ = supported_versions.push(KNXNETIP_VERSION_10);

        Self {
            local_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            local_port: 0,
            nat_aware: false,
            heartbeat_interval: Some(HEARTBEAT_REQUEST_TIME),
            connect_request_timeout: CONNECT_REQUEST_TIMEOUT,
            connection_state_request_timeout: CONNECTIONSTATE_REQUEST_TIMEOUT,
            max_connection_state_requests: MAX_CONNECTIONSTATE_REQUESTS,
            disconnect_request_timeout: DISCONNECT_REQUEST_TIMEOUT,
            supported_versions,
        }
    }
}

impl ConnectionConfig {
    /// Set the local bind address
    #[must_use]
    pub fn with_local_address(mut self, address: IpAddr) -> Self {
        self.local_address = address;
        self
    }

    /// Set the local control port
    #[must_use]
    pub fn with_local_port(mut self, port: u16) -> Self {
        self.local_port = port;
        self
    }

    /// Enable or disable NAT mode
    #[must_use]
    pub fn with_nat_aware(mut self, enabled: bool) -> Self {
        self.nat_aware = enabled;
        self
    }

    /// Set the heartbeat interval
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Option<Duration>) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the connect request timeout
    #[must_use]
    pub fn with_connect_request_timeout(mut self, timeout: Duration) -> Self {
        self.connect_request_timeout = timeout;
        self
    }

    /// Set the per-request connection-state timeout
    #[must_use]
    pub fn with_connection_state_request_timeout(mut self, timeout: Duration) -> Self {
        self.connection_state_request_timeout = timeout;
        self
    }

    /// Set how many connection-state requests may go unanswered
    #[must_use]
    pub fn with_max_connection_state_requests(mut self, max: u8) -> Self {
        self.max_connection_state_requests = max.max(1);
        self
    }

    /// Set the disconnect request timeout
    #[must_use]
    pub fn with_disconnect_request_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_request_timeout = timeout;
        self
    }

    /// Replace the accepted protocol versions.
    ///
    /// Versions beyond the first four are ignored.
    #[must_use]
    pub fn with_supported_versions(mut self, versions: &[u8]) -> Self {
        self.supported_versions.clear();
        for &version in versions.iter().take(self.supported_versions.capacity()) {
            let _ = self.supported_versions.push(version);
        }
        self
    }

    /// Whether received frames of `version` are accepted
    pub fn supports_version(&self, version: u8) -> bool {
        self.supported_versions.contains(&version)
    }
}

/// Connection type and data-exchange parameters.
///
/// Constructed through [`ConnectionKind::tunneling`] or
/// [`ConnectionKind::device_management`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionKind {
    /// Connection type code carried in the CRI
    pub connection_type: u8,
    /// Connection request information sent in `CONNECT_REQUEST`
    pub cri: ConnectionInfo,
    /// Request/acknowledge pair carrying cEMI frames
    pub data_service: DataService,
    /// Time to wait for each data acknowledge
    pub acknowledge_timeout: Duration,
    /// Transmissions of one data frame before the session is dropped
    pub max_acknowledge_attempts: u8,
}

impl ConnectionKind {
    /// Override the acknowledge timeout
    #[must_use]
    pub fn with_acknowledge_timeout(mut self, timeout: Duration) -> Self {
        self.acknowledge_timeout = timeout;
        self
    }

    /// Override the number of transmissions per data frame
    #[must_use]
    pub fn with_max_acknowledge_attempts(mut self, attempts: u8) -> Self {
        self.max_acknowledge_attempts = attempts.max(1);
        self
    }
}
