//! Device management connections.
//!
//! A device management connection (`DEVICE_MGMT_CONNECTION`, 0x03) talks to
//! the KNXnet/IP server itself rather than the bus, using
//! `DEVICE_CONFIGURATION_REQUEST` / `DEVICE_CONFIGURATION_ACK` pairs. Its CRI
//! and CRD carry no parameters beyond the connection type.

use crate::configuration::ConnectionKind;
use crate::protocol::constants::{
    DEVICE_CONFIGURATION_REQUEST_TIMEOUT, DEVICE_MGMT_CONNECTION, MAX_ACKNOWLEDGE_ATTEMPTS,
};
use crate::protocol::services::{ConnectionInfo, DataService};

impl ConnectionKind {
    /// Device management connection with a 10 s acknowledge timeout and
    /// three transmissions per frame.
    pub fn device_management() -> Self {
        let mut cri = ConnectionInfo::new();
        let _ = cri.extend_from_slice(&[2, DEVICE_MGMT_CONNECTION]);

        Self {
            connection_type: DEVICE_MGMT_CONNECTION,
            cri,
            data_service: DataService::DeviceConfiguration,
            acknowledge_timeout: DEVICE_CONFIGURATION_REQUEST_TIMEOUT,
            max_acknowledge_attempts: MAX_ACKNOWLEDGE_ATTEMPTS,
        }
    }
}
