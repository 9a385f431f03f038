//! KNXnet/IP protocol implementation.
//!
//! Frame codecs, the connection engine and its two connection kinds.

pub mod constants;
pub mod device_management;
pub mod engine;
pub mod frame;
pub mod services;
pub mod tunnel;

#[cfg(feature = "tokio")]
pub mod async_connection;

pub use constants::{ServiceType, Status};
pub use frame::{ConnectionHeader, Frame, FrameBuffer, Hpai, KnxnetIpHeader};
pub use services::ServiceFrame;
